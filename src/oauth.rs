use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use reqwest::{
    Client, Url,
    header::{ACCEPT, ORIGIN, REFERER, USER_AGENT},
};
use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use url::form_urlencoded;

use crate::accounts::{AccountRegistry, OAuthAccount};
use crate::config::Clock;
use crate::{ConsoleError, mask_secret};

const SESSION_PENDING: &str = "pending";
const SESSION_EXCHANGING: &str = "exchanging";
const SESSION_CONSUMED: &str = "consumed";
const SESSION_EXPIRED: &str = "expired";

/// Finished sessions are kept this long for inspection, then purged.
const SESSION_RETENTION_SECS: i64 = 24 * 60 * 60;

/// A claim left behind by an exchange that never finished is only swept once
/// it is this far past the session deadline. Longer than the token request
/// timeout.
const EXCHANGE_CLAIM_GRACE_SECS: i64 = 120;

const CLAUDE_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
const CLAUDE_AUTHORIZE_URL: &str = "https://claude.ai/oauth/authorize";
const CLAUDE_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const CLAUDE_REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";
const CLAUDE_SCOPES: &str = "org:create_api_key user:profile user:inference";
const CLAUDE_CLI_USER_AGENT: &str = "claude-cli/1.0.56 (external, cli)";

const UPSTREAM_SNIPPET_CHARS: usize = 240;

/// Upstream AI providers known to the relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Claude,
    #[serde(rename = "openai")]
    OpenAi,
    Gemini,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Claude => "claude",
            Provider::OpenAi => "openai",
            Provider::Gemini => "gemini",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = ConsoleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(Provider::Claude),
            "openai" => Ok(Provider::OpenAi),
            "gemini" => Ok(Provider::Gemini),
            other => Err(ConsoleError::UnsupportedProvider(other.to_string())),
        }
    }
}

/// OAuth client registration used against the provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OAuthEndpoints {
    pub client_id: String,
    pub authorize_url: String,
    pub token_url: String,
    pub redirect_uri: String,
    pub scopes: String,
}

impl OAuthEndpoints {
    pub fn claude() -> Self {
        Self {
            client_id: CLAUDE_CLIENT_ID.to_string(),
            authorize_url: CLAUDE_AUTHORIZE_URL.to_string(),
            token_url: CLAUDE_TOKEN_URL.to_string(),
            redirect_uri: CLAUDE_REDIRECT_URI.to_string(),
            scopes: CLAUDE_SCOPES.to_string(),
        }
    }

    /// Replaces the authorize and/or token URL, rejecting anything that does
    /// not parse as an absolute URL.
    pub fn with_endpoints(
        mut self,
        authorize_url: Option<&str>,
        token_url: Option<&str>,
    ) -> Result<Self, ConsoleError> {
        if let Some(raw) = authorize_url {
            self.authorize_url = parse_endpoint(raw)?.to_string();
        }
        if let Some(raw) = token_url {
            self.token_url = parse_endpoint(raw)?.to_string();
        }
        Ok(self)
    }
}

fn parse_endpoint(raw: &str) -> Result<Url, ConsoleError> {
    Url::parse(raw.trim()).map_err(|source| ConsoleError::InvalidEndpoint {
        endpoint: raw.to_string(),
        source,
    })
}

#[derive(Debug, Clone)]
pub(crate) struct PkcePair {
    pub(crate) code_verifier: String,
    pub(crate) code_challenge: String,
}

pub(crate) fn generate_pkce_pair() -> PkcePair {
    let code_verifier = random_url_token();
    let code_challenge = code_challenge_s256(&code_verifier);

    PkcePair {
        code_verifier,
        code_challenge,
    }
}

pub(crate) fn code_challenge_s256(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// 32 random bytes, base64url without padding (43 chars).
fn random_url_token() -> String {
    let mut random = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut random);
    URL_SAFE_NO_PAD.encode(random)
}

/// Splits what the operator pasted into the authorization code and, when
/// present, the state that came back with it.
///
/// Accepts a bare code, `code#state`, or the full callback URL with `code`
/// and `state` in either the query string or the fragment.
pub fn parse_authorization_input(input: &str) -> Result<(String, Option<String>), ConsoleError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ConsoleError::Validation(
            "authorization code is required".to_string(),
        ));
    }

    if input.starts_with("http://") || input.starts_with("https://") {
        let url = Url::parse(input).map_err(|err| {
            ConsoleError::Validation(format!("authorization callback URL is invalid: {err}"))
        })?;
        let from_query = code_and_state(url.query_pairs());
        let from_fragment = url
            .fragment()
            .map(|fragment| code_and_state(form_urlencoded::parse(fragment.as_bytes())))
            .unwrap_or_default();

        let code = from_query.0.or(from_fragment.0).ok_or_else(|| {
            ConsoleError::Validation("authorization callback URL has no code".to_string())
        })?;
        return Ok((code, from_query.1.or(from_fragment.1)));
    }

    let (code, state) = match input.split_once('#') {
        Some((code, state)) => (code.trim(), non_empty(state)),
        None => (input, None),
    };
    if code.is_empty() {
        return Err(ConsoleError::Validation(
            "authorization code is required".to_string(),
        ));
    }
    Ok((code.to_string(), state))
}

fn code_and_state<'a>(
    pairs: impl Iterator<Item = (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>)>,
) -> (Option<String>, Option<String>) {
    let mut code = None;
    let mut state = None;
    for (key, value) in pairs {
        match key.as_ref() {
            "code" => code = non_empty(&value),
            "state" => state = non_empty(&value),
            _ => {}
        }
    }
    (code, state)
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Tokens returned by a provider for either grant type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Lifetime in seconds as reported by the provider.
    pub expires_in: Option<i64>,
    pub email: Option<String>,
    pub organization: Option<String>,
}

impl TokenGrant {
    pub fn expires_at(&self, now: i64) -> Option<i64> {
        self.expires_in
            .filter(|secs| *secs > 0)
            .map(|secs| now.saturating_add(secs))
    }
}

/// Network seam to an OAuth provider.
#[async_trait]
pub trait TokenProvider: Send + Sync + fmt::Debug {
    fn provider(&self) -> Provider;

    fn authorization_url(&self, code_challenge: &str, state: &str) -> Result<String, ConsoleError>;

    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        state: &str,
    ) -> Result<TokenGrant, ConsoleError>;

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, ConsoleError>;
}

/// Claude's OAuth endpoints over reqwest.
#[derive(Clone, Debug)]
pub struct ClaudeProvider {
    client: Client,
    endpoints: OAuthEndpoints,
    authorize_url: Url,
    token_url: Url,
}

impl ClaudeProvider {
    pub fn new(endpoints: OAuthEndpoints) -> Result<Self, ConsoleError> {
        let authorize_url = parse_endpoint(&endpoints.authorize_url)?;
        let token_url = parse_endpoint(&endpoints.token_url)?;
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            endpoints,
            authorize_url,
            token_url,
        })
    }
}

#[async_trait]
impl TokenProvider for ClaudeProvider {
    fn provider(&self) -> Provider {
        Provider::Claude
    }

    fn authorization_url(&self, code_challenge: &str, state: &str) -> Result<String, ConsoleError> {
        let mut url = self.authorize_url.clone();
        url.query_pairs_mut()
            .append_pair("code", "true")
            .append_pair("client_id", &self.endpoints.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", &self.endpoints.redirect_uri)
            .append_pair("scope", &self.endpoints.scopes)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", state);
        Ok(url.to_string())
    }

    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        state: &str,
    ) -> Result<TokenGrant, ConsoleError> {
        let body = json!({
            "grant_type": "authorization_code",
            "code": code,
            "client_id": self.endpoints.client_id,
            "redirect_uri": self.endpoints.redirect_uri,
            "code_verifier": code_verifier,
            "state": state,
        });

        let response = self
            .client
            .post(self.token_url.clone())
            .header(ACCEPT, "application/json, text/plain, */*")
            .header(USER_AGENT, CLAUDE_CLI_USER_AGENT)
            .header(REFERER, "https://claude.ai/")
            .header(ORIGIN, "https://claude.ai")
            .json(&body)
            .send()
            .await?;

        parse_token_response(response).await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, ConsoleError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.endpoints.client_id.as_str()),
        ];

        let response = self
            .client
            .post(self.token_url.clone())
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, CLAUDE_CLI_USER_AGENT)
            .form(&form)
            .send()
            .await?;

        parse_token_response(response).await
    }
}

async fn parse_token_response(response: reqwest::Response) -> Result<TokenGrant, ConsoleError> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(ConsoleError::UpstreamExchangeFailed(format!(
            "token endpoint returned status {}: {}",
            status.as_u16(),
            sanitize_error_body(&body)
        )));
    }

    let value: Value = serde_json::from_str(&body).map_err(|err| {
        ConsoleError::UpstreamExchangeFailed(format!("token response is not valid JSON: {err}"))
    })?;
    token_grant_from_json(&value)
}

pub(crate) fn token_grant_from_json(value: &Value) -> Result<TokenGrant, ConsoleError> {
    let access_token = string_field(value.get("access_token")).ok_or_else(|| {
        ConsoleError::UpstreamExchangeFailed("token response is missing access_token".to_string())
    })?;

    Ok(TokenGrant {
        access_token,
        refresh_token: string_field(value.get("refresh_token")),
        expires_in: value.get("expires_in").and_then(parse_i64_lossy),
        email: string_field(value.pointer("/account/email_address")),
        organization: string_field(value.pointer("/organization/name")),
    })
}

fn string_field(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).and_then(non_empty)
}

fn parse_i64_lossy(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Keeps the provider's error code and description, masks anything that
/// looks like a credential.
fn sanitize_error_body(body: &str) -> String {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) {
        let mut parts = Vec::new();
        for (key, value) in &map {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if is_sensitive_key(key) {
                parts.push(format!("{key}={}", mask_secret(&text)));
            } else {
                parts.push(format!("{key}={text}"));
            }
        }
        return parts
            .join(" ")
            .chars()
            .take(UPSTREAM_SNIPPET_CHARS)
            .collect();
    }

    body.trim().chars().take(UPSTREAM_SNIPPET_CHARS).collect()
}

fn is_sensitive_key(key: &str) -> bool {
    let key = key.trim().to_ascii_lowercase();
    key.contains("token") || key.contains("secret") || key == "authorization"
}

/// Returned to the operator when an authorization link is generated.
#[derive(Clone, Debug, Serialize)]
pub struct PendingAuthorization {
    pub authorization_url: String,
    pub state: String,
    pub code_verifier: String,
    pub provider: Provider,
    pub bound_account_id: Option<String>,
    pub expires_at: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    /// Claimed by an exchange whose token request is in flight.
    Exchanging,
    Consumed,
    Expired,
}

impl SessionStatus {
    fn parse(value: &str) -> Self {
        match value {
            SESSION_EXCHANGING => SessionStatus::Exchanging,
            SESSION_CONSUMED => SessionStatus::Consumed,
            SESSION_EXPIRED => SessionStatus::Expired,
            _ => SessionStatus::Pending,
        }
    }
}

/// A stored authorization session. The verifier is not exposed.
#[derive(Clone, Debug)]
pub struct AuthorizationSession {
    pub state: String,
    pub provider: String,
    pub status: SessionStatus,
    pub bound_account_id: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
    pub consumed_at: Option<i64>,
    code_verifier: String,
}

#[derive(Clone, Debug, Default)]
pub struct ExchangeRequest {
    /// Bare code, `code#state`, or the full callback URL.
    pub code: String,
    pub code_verifier: String,
    pub state: Option<String>,
    pub bound_account_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ExchangeOutcome {
    pub account: OAuthAccount,
    /// True when an existing account had its tokens rotated.
    pub reauthorized: bool,
}

/// Owns the PKCE session table and the single-use exchange.
#[derive(Clone, Debug)]
pub struct AuthorizationSessionManager {
    pool: SqlitePool,
    provider: Arc<dyn TokenProvider>,
    accounts: AccountRegistry,
    session_ttl_secs: i64,
    clock: Clock,
}

impl AuthorizationSessionManager {
    pub(crate) fn new(
        pool: SqlitePool,
        provider: Arc<dyn TokenProvider>,
        accounts: AccountRegistry,
        session_ttl_secs: i64,
        clock: Clock,
    ) -> Self {
        Self {
            pool,
            provider,
            accounts,
            session_ttl_secs,
            clock,
        }
    }

    pub async fn begin_session(
        &self,
        provider: Provider,
        bound_account_id: Option<&str>,
    ) -> Result<PendingAuthorization, ConsoleError> {
        if provider != self.provider.provider() {
            return Err(ConsoleError::UnsupportedProvider(provider.to_string()));
        }

        if let Some(account_id) = bound_account_id {
            let account = self.accounts.get(account_id).await?;
            if account.provider != provider {
                return Err(ConsoleError::Validation(format!(
                    "account {account_id} belongs to provider {}",
                    account.provider
                )));
            }
        }

        self.purge_expired_sessions().await?;

        let pkce = generate_pkce_pair();
        let state = random_url_token();
        let authorization_url = self
            .provider
            .authorization_url(&pkce.code_challenge, &state)?;
        let now = self.clock.now();
        let expires_at = now + self.session_ttl_secs;

        sqlx::query(
            r#"
            INSERT INTO oauth_sessions (
                state,
                provider,
                code_verifier,
                code_challenge,
                authorization_url,
                status,
                bound_account_id,
                created_at,
                expires_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&state)
        .bind(provider.as_str())
        .bind(&pkce.code_verifier)
        .bind(&pkce.code_challenge)
        .bind(&authorization_url)
        .bind(SESSION_PENDING)
        .bind(bound_account_id)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        info!(
            provider = provider.as_str(),
            bound_account_id,
            expires_at,
            "authorization session created"
        );

        Ok(PendingAuthorization {
            authorization_url,
            state,
            code_verifier: pkce.code_verifier,
            provider,
            bound_account_id: bound_account_id.map(str::to_string),
            expires_at,
        })
    }

    /// Trades an authorization code for tokens and records the account.
    ///
    /// The session is claimed before the provider sees the code, so of several
    /// concurrent submissions exactly one reaches the provider and the rest get
    /// `SessionAlreadyConsumed`. The claim turns into `consumed` in the same
    /// transaction that writes the account. A provider rejection puts the
    /// session back to pending.
    pub async fn exchange(&self, request: ExchangeRequest) -> Result<ExchangeOutcome, ConsoleError> {
        let (code, embedded_state) = parse_authorization_input(&request.code)?;
        let verifier = request.code_verifier.trim();
        if verifier.is_empty() {
            return Err(ConsoleError::Validation(
                "code_verifier is required".to_string(),
            ));
        }

        let explicit_state = request.state.as_deref().and_then(non_empty);
        if let (Some(explicit), Some(embedded)) = (&explicit_state, &embedded_state) {
            if explicit != embedded {
                return Err(ConsoleError::Validation(
                    "state does not match the one returned with the code".to_string(),
                ));
            }
        }

        let session = match explicit_state.or(embedded_state) {
            Some(state) => self.find_session(&state).await?,
            None => self.find_by_verifier(verifier).await?,
        }
        .ok_or(ConsoleError::SessionNotFound)?;

        self.ensure_pending(&session).await?;

        if !bool::from(session.code_verifier.as_bytes().ct_eq(verifier.as_bytes())) {
            warn!(state = %mask_secret(&session.state), "code_verifier mismatch");
            return Err(ConsoleError::Validation(
                "code_verifier does not match the authorization session".to_string(),
            ));
        }

        let bound_account_id = match (
            request.bound_account_id.as_deref().and_then(non_empty),
            session.bound_account_id.clone(),
        ) {
            (Some(requested), Some(bound)) if requested != bound => {
                return Err(ConsoleError::Validation(format!(
                    "this authorization link was generated for account {bound}"
                )));
            }
            (requested, bound) => requested.or(bound),
        };
        if let Some(account_id) = &bound_account_id {
            self.accounts.get(account_id).await?;
        }

        let provider: Provider = session.provider.parse()?;
        self.claim(&session.state).await?;

        let result = self
            .finish_exchange(&session.state, provider, &code, verifier, bound_account_id.as_deref())
            .await;
        if result.is_err() {
            self.release_claim(&session.state).await?;
        }
        let (account, reauthorized) = result?;

        info!(
            account_id = %account.id,
            provider = provider.as_str(),
            reauthorized,
            "authorization code exchanged"
        );

        Ok(ExchangeOutcome {
            account,
            reauthorized,
        })
    }

    /// Moves the session from pending to exchanging. Only one caller can win;
    /// the rest learn whether the session was taken or ran out of time.
    async fn claim(&self, state: &str) -> Result<(), ConsoleError> {
        let claimed = sqlx::query(
            r#"
            UPDATE oauth_sessions
            SET status = ?
            WHERE state = ? AND status = ? AND expires_at > ?
            "#,
        )
        .bind(SESSION_EXCHANGING)
        .bind(state)
        .bind(SESSION_PENDING)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if claimed == 1 {
            return Ok(());
        }

        let current = self
            .find_session(state)
            .await?
            .ok_or(ConsoleError::SessionNotFound)?;
        match self.ensure_pending(&current).await {
            Err(err) => Err(err),
            Ok(()) => Err(ConsoleError::SessionAlreadyConsumed),
        }
    }

    async fn release_claim(&self, state: &str) -> Result<(), ConsoleError> {
        sqlx::query("UPDATE oauth_sessions SET status = ? WHERE state = ? AND status = ?")
            .bind(SESSION_PENDING)
            .bind(state)
            .bind(SESSION_EXCHANGING)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Calls the provider for a claimed session, then marks it consumed and
    /// writes the account in one transaction.
    async fn finish_exchange(
        &self,
        state: &str,
        provider: Provider,
        code: &str,
        verifier: &str,
        bound_account_id: Option<&str>,
    ) -> Result<(OAuthAccount, bool), ConsoleError> {
        let grant = self
            .provider
            .exchange_code(code, verifier, state)
            .await
            .inspect_err(|err| warn!(provider = provider.as_str(), error = %err, "code exchange rejected"))?;

        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let consumed = sqlx::query(
            "UPDATE oauth_sessions SET status = ?, consumed_at = ? WHERE state = ? AND status = ?",
        )
        .bind(SESSION_CONSUMED)
        .bind(now)
        .bind(state)
        .bind(SESSION_EXCHANGING)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if consumed == 0 {
            tx.rollback().await?;
            return Err(ConsoleError::SessionExpired);
        }

        let upserted = self
            .accounts
            .upsert_from_exchange(&mut *tx, provider, &grant, bound_account_id, now)
            .await?;
        tx.commit().await?;
        Ok(upserted)
    }

    pub async fn find_session(
        &self,
        state: &str,
    ) -> Result<Option<AuthorizationSession>, ConsoleError> {
        let row = sqlx::query(
            r#"
            SELECT state, provider, code_verifier, status, bound_account_id,
                   created_at, expires_at, consumed_at
            FROM oauth_sessions
            WHERE state = ?
            LIMIT 1
            "#,
        )
        .bind(state)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| session_from_row(&row))
            .transpose()
            .map_err(ConsoleError::from)
    }

    async fn find_by_verifier(
        &self,
        verifier: &str,
    ) -> Result<Option<AuthorizationSession>, ConsoleError> {
        let row = sqlx::query(
            r#"
            SELECT state, provider, code_verifier, status, bound_account_id,
                   created_at, expires_at, consumed_at
            FROM oauth_sessions
            WHERE code_verifier = ?
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(verifier)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| session_from_row(&row))
            .transpose()
            .map_err(ConsoleError::from)
    }

    /// Fails unless the session can still be consumed. A pending session past
    /// its deadline is marked expired on the way out.
    async fn ensure_pending(&self, session: &AuthorizationSession) -> Result<(), ConsoleError> {
        match session.status {
            SessionStatus::Exchanging | SessionStatus::Consumed => {
                Err(ConsoleError::SessionAlreadyConsumed)
            }
            SessionStatus::Expired => Err(ConsoleError::SessionExpired),
            SessionStatus::Pending if self.clock.now() >= session.expires_at => {
                sqlx::query("UPDATE oauth_sessions SET status = ? WHERE state = ? AND status = ?")
                    .bind(SESSION_EXPIRED)
                    .bind(&session.state)
                    .bind(SESSION_PENDING)
                    .execute(&self.pool)
                    .await?;
                Err(ConsoleError::SessionExpired)
            }
            SessionStatus::Pending => Ok(()),
        }
    }

    /// Marks overdue pending sessions expired and drops finished sessions
    /// past retention. Returns the number of rows deleted.
    pub async fn purge_expired_sessions(&self) -> Result<u64, ConsoleError> {
        let now = self.clock.now();

        let expired = sqlx::query(
            r#"
            UPDATE oauth_sessions
            SET status = ?
            WHERE (status = ? AND expires_at <= ?)
               OR (status = ? AND expires_at <= ?)
            "#,
        )
        .bind(SESSION_EXPIRED)
        .bind(SESSION_PENDING)
        .bind(now)
        .bind(SESSION_EXCHANGING)
        .bind(now - EXCHANGE_CLAIM_GRACE_SECS)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let deleted = sqlx::query(
            "DELETE FROM oauth_sessions WHERE status IN (?, ?) AND created_at < ?",
        )
        .bind(SESSION_CONSUMED)
        .bind(SESSION_EXPIRED)
        .bind(now - SESSION_RETENTION_SECS)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if expired > 0 || deleted > 0 {
            info!(expired, deleted, "authorization sessions purged");
        }
        Ok(deleted)
    }
}

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<AuthorizationSession, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(AuthorizationSession {
        state: row.try_get("state")?,
        provider: row.try_get("provider")?,
        status: SessionStatus::parse(&status),
        bound_account_id: row.try_get("bound_account_id")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        consumed_at: row.try_get("consumed_at")?,
        code_verifier: row.try_get("code_verifier")?,
    })
}

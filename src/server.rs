use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use axum::{
    Router,
    extract::{FromRequest, Path, Query, Request, State, rejection::JsonRejection},
    http::{StatusCode, header::AUTHORIZATION},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post, put},
};
use relay_console::{
    AdminConsole, ConsoleError,
    accounts::{AccountStatus, AccountSummary, OAuthAccount},
    api_keys::{ApiKey, ApiKeyPatch, NewApiKey},
    diagnostics::RequestLogRecord,
    mask_secret,
    oauth::{ExchangeRequest, Provider},
    rate_limit::{RateLimitOverride, RateLimitSettings},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use subtle::ConstantTimeEq;
use tower_http::{
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};
use tracing::{error, info, warn};

const DEFAULT_LOG_LIMIT: usize = 50;

pub struct AppState {
    console: AdminConsole,
    admin_token: String,
    static_dir: Option<PathBuf>,
}

impl AppState {
    pub fn new(console: AdminConsole, admin_token: String, static_dir: Option<PathBuf>) -> Self {
        Self {
            console,
            admin_token,
            static_dir,
        }
    }
}

/// Error body shared by every endpoint: `{success: false, error, code}`.
struct ApiError(ConsoleError);

impl From<ConsoleError> for ApiError {
    fn from(err: ConsoleError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(ConsoleError::Validation(rejection.body_text()))
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// JSON body whose rejections use the same error body as every other failure.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
struct ApiJson<T>(T);

fn status_for(err: &ConsoleError) -> StatusCode {
    match err {
        ConsoleError::UnsupportedProvider(_) | ConsoleError::Validation(_) => {
            StatusCode::BAD_REQUEST
        }
        ConsoleError::Unauthorized => StatusCode::UNAUTHORIZED,
        ConsoleError::SessionNotFound
        | ConsoleError::AccountNotFound(_)
        | ConsoleError::KeyNotFound(_) => StatusCode::NOT_FOUND,
        ConsoleError::SessionAlreadyConsumed => StatusCode::CONFLICT,
        ConsoleError::SessionExpired => StatusCode::GONE,
        ConsoleError::UpstreamExchangeFailed(_) | ConsoleError::Http(_) => StatusCode::BAD_GATEWAY,
        ConsoleError::InvalidEndpoint { .. }
        | ConsoleError::Database(_)
        | ConsoleError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let message = if status.is_server_error() && status != StatusCode::BAD_GATEWAY {
            error!(error = %self.0, "request failed");
            "internal server error".to_string()
        } else {
            warn!(code = self.0.code(), error = %self.0, "request rejected");
            self.0.to_string()
        };

        let body = json!({
            "success": false,
            "error": message,
            "code": self.0.code(),
        });
        (status, Json(body)).into_response()
    }
}

async fn require_admin(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split_once(' '))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, token)| token.trim());

    match presented {
        Some(token) if bool::from(token.as_bytes().ct_eq(state.admin_token.as_bytes())) => {
            next.run(request).await
        }
        _ => ApiError(ConsoleError::Unauthorized).into_response(),
    }
}

async fn health_check() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct AuthorizeUrlQuery {
    provider: Option<String>,
    account_id: Option<String>,
}

async fn authorize_url(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuthorizeUrlQuery>,
) -> ApiResult<Json<Value>> {
    let provider = match params.provider.as_deref() {
        Some(raw) => raw.parse::<Provider>()?,
        None => Provider::Claude,
    };
    let account_id = params.account_id.as_deref().filter(|id| !id.trim().is_empty());
    let pending = state
        .console
        .sessions()
        .begin_session(provider, account_id)
        .await?;

    Ok(Json(json!({
        "success": true,
        "authorization_url": pending.authorization_url,
        "code_verifier": pending.code_verifier,
        "state": pending.state,
        "provider": pending.provider,
        "account_id": pending.bound_account_id,
        "expires_at": pending.expires_at,
        "instructions": [
            "1. Open the authorization URL and sign in to the provider",
            "2. Approve access and copy the code shown on the callback page",
            "3. POST /oauth/token with the code and this code_verifier",
        ],
    })))
}

#[derive(Debug, Deserialize)]
struct ExchangeBody {
    code: String,
    code_verifier: String,
    state: Option<String>,
    account_id: Option<String>,
    update_existing: Option<bool>,
}

async fn exchange_token(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<ExchangeBody>,
) -> ApiResult<Json<Value>> {
    let account_id = payload.account_id.filter(|id| !id.trim().is_empty());
    // Without update_existing the exchange creates a new account; only the
    // link's own binding can still target an existing one.
    let bound_account_id = match (payload.update_existing.unwrap_or(false), account_id) {
        (true, None) => {
            return Err(ConsoleError::Validation(
                "account_id is required when update_existing is true".to_string(),
            )
            .into());
        }
        (true, account_id) => account_id,
        (false, _) => None,
    };

    let outcome = state
        .console
        .sessions()
        .exchange(ExchangeRequest {
            code: payload.code,
            code_verifier: payload.code_verifier,
            state: payload.state,
            bound_account_id,
        })
        .await?;
    let accounts = state.console.accounts().list().await?;

    Ok(Json(json!({
        "success": true,
        "reauthorized": outcome.reauthorized,
        "account": AccountView::from(outcome.account),
        "accounts": accounts.into_iter().map(AccountView::from).collect::<Vec<_>>(),
    })))
}

async fn list_accounts(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let accounts = state.console.accounts().list().await?;
    Ok(Json(json!({
        "success": true,
        "accounts": accounts.into_iter().map(AccountView::from).collect::<Vec<_>>(),
    })))
}

async fn get_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let account = state.console.accounts().get(&id).await?;
    Ok(account_response(account))
}

#[derive(Debug, Deserialize)]
struct UpdateAccountStatus {
    enabled: bool,
}

async fn update_account_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ApiJson(payload): ApiJson<UpdateAccountStatus>,
) -> ApiResult<Json<Value>> {
    let account = state
        .console
        .accounts()
        .set_enabled(&id, payload.enabled)
        .await?;
    Ok(account_response(account))
}

#[derive(Debug, Deserialize)]
struct UpdateAccountRateLimited {
    rate_limited: bool,
}

async fn update_account_rate_limited(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ApiJson(payload): ApiJson<UpdateAccountRateLimited>,
) -> ApiResult<Json<Value>> {
    let account = state
        .console
        .accounts()
        .set_rate_limited(&id, payload.rate_limited)
        .await?;
    Ok(account_response(account))
}

async fn refresh_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let account = state.console.accounts().refresh(&id).await?;
    Ok(account_response(account))
}

async fn delete_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.console.accounts().delete(&id).await?;
    Ok(Json(json!({ "success": true, "message": "account deleted" })))
}

async fn account_summary(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let summary: AccountSummary = state.console.accounts().summary().await?;
    Ok(Json(json!({ "success": true, "summary": summary })))
}

fn account_response(account: OAuthAccount) -> Json<Value> {
    Json(json!({ "success": true, "account": AccountView::from(account) }))
}

async fn list_api_keys(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let keys = state.console.api_keys().list().await?;
    Ok(Json(json!({
        "success": true,
        "api_keys": keys.into_iter().map(ApiKeyView::from).collect::<Vec<_>>(),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateKeyBody {
    name: Option<String>,
    description: Option<String>,
    rate_limit: Option<u32>,
    tokens_per_day: Option<u64>,
    expires_in: Option<i64>,
    allowed_clients: Option<Vec<String>>,
    status: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreatedKeyView {
    key: String,
    #[serde(flatten)]
    view: ApiKeyView,
}

async fn create_api_key(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<CreateKeyBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let expires_in_days = payload
        .expires_in
        .ok_or_else(|| ConsoleError::Validation("expiresIn is required".to_string()))?;
    let enabled = match payload.status.as_deref() {
        Some(status) => parse_key_status(status)?,
        None => true,
    };

    let created = state
        .console
        .api_keys()
        .create(NewApiKey {
            name: payload.name.unwrap_or_default(),
            description: payload.description,
            rate_limit: RateLimitOverride {
                requests_per_minute: payload.rate_limit,
                tokens_per_day: payload.tokens_per_day,
            },
            expires_in_days,
            allowed_clients: payload.allowed_clients.unwrap_or_default(),
            enabled,
        })
        .await?;

    let body = json!({
        "success": true,
        "api_key": CreatedKeyView {
            key: created.secret,
            view: ApiKeyView::from(created.key),
        },
        "message": "store this key now; it will not be shown again",
    });
    Ok((StatusCode::CREATED, Json(body)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateKeyBody {
    name: Option<String>,
    description: Option<String>,
    rate_limit: Option<u32>,
    tokens_per_day: Option<u64>,
    allowed_clients: Option<Vec<String>>,
    status: Option<String>,
    expires_at: Option<i64>,
}

async fn update_api_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ApiJson(payload): ApiJson<UpdateKeyBody>,
) -> ApiResult<Json<Value>> {
    let enabled = payload
        .status
        .as_deref()
        .map(parse_key_status)
        .transpose()?;

    let key = state
        .console
        .api_keys()
        .update(
            &id,
            ApiKeyPatch {
                name: payload.name,
                description: payload.description,
                rate_limit: RateLimitOverride {
                    requests_per_minute: payload.rate_limit,
                    tokens_per_day: payload.tokens_per_day,
                },
                allowed_clients: payload.allowed_clients,
                enabled,
                expires_at: payload.expires_at,
            },
        )
        .await?;

    Ok(Json(json!({ "success": true, "api_key": ApiKeyView::from(key) })))
}

async fn delete_api_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.console.api_keys().delete(&id).await?;
    Ok(Json(json!({ "success": true, "message": "api key deleted" })))
}

fn parse_key_status(status: &str) -> Result<bool, ConsoleError> {
    match status.trim().to_ascii_lowercase().as_str() {
        "active" | "enabled" => Ok(true),
        "inactive" | "disabled" => Ok(false),
        other => Err(ConsoleError::Validation(format!(
            "status must be 'active' or 'inactive', got '{other}'"
        ))),
    }
}

async fn get_rate_limit_settings(State(state): State<Arc<AppState>>) -> Json<Value> {
    let settings = state.console.rate_limits().get().await;
    Json(json!({ "success": true, "settings": settings }))
}

async fn update_rate_limit_settings(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<RateLimitSettings>,
) -> ApiResult<Json<Value>> {
    let settings = state.console.rate_limits().update(payload).await?;
    Ok(Json(json!({ "success": true, "settings": settings })))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn list_logs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LogsQuery>,
) -> ApiResult<Json<Value>> {
    let limit = params.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    let logs: Vec<RequestLogRecord> = state.console.diagnostics().recent(limit).await?;
    Ok(Json(json!({ "success": true, "logs": logs })))
}

pub fn router(state: Arc<AppState>) -> Router {
    let admin = Router::new()
        .route("/admin/accounts/authorize-url", get(authorize_url))
        .route("/admin/accounts/summary", get(account_summary))
        .route("/oauth/token", post(exchange_token))
        .route("/oauth/accounts", get(list_accounts))
        .route("/oauth/accounts/:id", get(get_account))
        .route("/oauth/accounts/:id", delete(delete_account))
        .route("/oauth/accounts/:id/status", put(update_account_status))
        .route(
            "/oauth/accounts/:id/rate-limited",
            put(update_account_rate_limited),
        )
        .route("/oauth/accounts/:id/refresh", post(refresh_account))
        .route("/admin/api-keys", get(list_api_keys))
        .route("/admin/api-keys", post(create_api_key))
        .route("/admin/api-keys/:id", put(update_api_key))
        .route("/admin/api-keys/id/:id", delete(delete_api_key))
        .route("/admin/settings/rate-limit", get(get_rate_limit_settings))
        .route("/admin/settings/rate-limit", put(update_rate_limit_settings))
        .route("/admin/logs", get(list_logs))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    let mut router = Router::new()
        .route("/health", get(health_check))
        .merge(admin);

    if let Some(dir) = state.static_dir.as_ref() {
        let index_file = dir.join("index.html");
        if index_file.exists() {
            router = router.fallback_service(ServeDir::new(dir).fallback(ServeFile::new(index_file)));
        } else {
            warn!(
                path = %index_file.display(),
                "static index.html not found; skip serving the console UI"
            );
        }
    }

    router
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> Result<(), Box<dyn std::error::Error>> {
    let app = router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    info!("relay console listening on http://{bound_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
    info!("shutting down");
}

/// Account as shown to operators. Tokens only ever leave masked.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountView {
    id: String,
    provider: Provider,
    email: String,
    organization: Option<String>,
    access_token: String,
    refresh_token: Option<String>,
    token_expires_at: Option<i64>,
    enabled: bool,
    rate_limited: bool,
    status: AccountStatus,
    created_at: i64,
    updated_at: i64,
    last_used_at: Option<i64>,
    total_requests: i64,
    total_tokens: i64,
}

impl From<OAuthAccount> for AccountView {
    fn from(account: OAuthAccount) -> Self {
        Self {
            id: account.id,
            provider: account.provider,
            email: account.external_identifier,
            organization: account.organization,
            access_token: mask_secret(&account.access_token),
            refresh_token: account.refresh_token.as_deref().map(mask_secret),
            token_expires_at: account.token_expires_at,
            enabled: account.enabled,
            rate_limited: account.rate_limited,
            status: account.status,
            created_at: account.created_at,
            updated_at: account.updated_at,
            last_used_at: account.last_used_at,
            total_requests: account.total_requests,
            total_tokens: account.total_tokens,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiKeyView {
    id: String,
    masked_key: String,
    name: String,
    description: Option<String>,
    status: &'static str,
    rate_limit: u32,
    tokens_per_day: u64,
    allowed_clients: Option<Vec<String>>,
    created_at: i64,
    updated_at: i64,
    expires_at: Option<i64>,
    last_used_at: Option<i64>,
    total_requests: i64,
    total_tokens: i64,
}

impl From<ApiKey> for ApiKeyView {
    fn from(key: ApiKey) -> Self {
        Self {
            id: key.id,
            masked_key: key.masked_key,
            name: key.name,
            description: key.description,
            status: if key.enabled { "active" } else { "inactive" },
            rate_limit: key.rate_limit.requests_per_minute,
            tokens_per_day: key.rate_limit.tokens_per_day,
            allowed_clients: key.allowed_clients,
            created_at: key.created_at,
            updated_at: key.updated_at,
            expires_at: key.expires_at,
            last_used_at: key.last_used_at,
            total_requests: key.total_requests,
            total_tokens: key.total_tokens,
        }
    }
}

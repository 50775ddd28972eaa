use nanoid::nanoid;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::config::{Clock, KeyBounds, SECONDS_PER_DAY};
use crate::rate_limit::{RateLimitDefaults, RateLimitOverride, RateLimitRule};
use crate::store::{generate_unique_id, normalize_timestamp};
use crate::{ConsoleError, mask_secret};

pub const SECRET_PREFIX: &str = "sk-relay-";
const SECRET_RANDOM_LEN: usize = 40;

const KEY_COLUMNS: &str = r#"
    id, masked_key, name, description, enabled, requests_per_minute, tokens_per_day,
    allowed_clients, created_at, updated_at, expires_at, last_used_at,
    total_requests, total_tokens
"#;

/// A client credential as stored. Only the masked form of the secret exists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiKey {
    pub id: String,
    pub masked_key: String,
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub rate_limit: RateLimitRule,
    /// `None` means any client may use the key.
    pub allowed_clients: Option<Vec<String>>,
    pub created_at: i64,
    pub updated_at: i64,
    pub expires_at: Option<i64>,
    pub last_used_at: Option<i64>,
    pub total_requests: i64,
    pub total_tokens: i64,
}

impl ApiKey {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Allowed clients match case-insensitively anywhere in the user agent.
    pub fn allows_client(&self, user_agent: Option<&str>) -> bool {
        let Some(allowed) = &self.allowed_clients else {
            return true;
        };
        let Some(user_agent) = user_agent else {
            return false;
        };
        let user_agent = user_agent.to_lowercase();
        allowed
            .iter()
            .any(|client| user_agent.contains(&client.to_lowercase()))
    }
}

#[derive(Clone, Debug)]
pub struct NewApiKey {
    pub name: String,
    pub description: Option<String>,
    pub rate_limit: RateLimitOverride,
    pub expires_in_days: i64,
    pub allowed_clients: Vec<String>,
    pub enabled: bool,
}

impl NewApiKey {
    pub fn new(name: impl Into<String>, expires_in_days: i64) -> Self {
        Self {
            name: name.into(),
            description: None,
            rate_limit: RateLimitOverride::default(),
            expires_in_days,
            allowed_clients: Vec::new(),
            enabled: true,
        }
    }
}

/// Result of `create`: the only place the plaintext secret ever appears.
#[derive(Clone, Debug)]
pub struct CreatedApiKey {
    pub key: ApiKey,
    pub secret: String,
}

/// Partial edit. `None` leaves a field untouched; an empty description or
/// client list clears it.
#[derive(Clone, Debug, Default)]
pub struct ApiKeyPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub rate_limit: RateLimitOverride,
    pub allowed_clients: Option<Vec<String>>,
    pub enabled: Option<bool>,
    pub expires_at: Option<i64>,
}

/// Issues, edits, revokes and checks API keys.
#[derive(Clone, Debug)]
pub struct ApiKeyRegistry {
    pool: SqlitePool,
    defaults: RateLimitDefaults,
    bounds: KeyBounds,
    clock: Clock,
}

impl ApiKeyRegistry {
    pub(crate) fn new(
        pool: SqlitePool,
        defaults: RateLimitDefaults,
        bounds: KeyBounds,
        clock: Clock,
    ) -> Self {
        Self {
            pool,
            defaults,
            bounds,
            clock,
        }
    }

    pub async fn create(&self, request: NewApiKey) -> Result<CreatedApiKey, ConsoleError> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(ConsoleError::Validation("name is required".to_string()));
        }
        if !(1..=self.bounds.max_expires_in_days).contains(&request.expires_in_days) {
            return Err(ConsoleError::Validation(format!(
                "expiresIn must be between 1 and {} days",
                self.bounds.max_expires_in_days
            )));
        }
        let rule = request
            .rate_limit
            .resolve(self.defaults.default_rule().await);
        self.validate_rule(&rule)?;

        let secret = format!("{SECRET_PREFIX}{}", nanoid!(SECRET_RANDOM_LEN));
        let masked_key = mask_secret(&secret);
        let allowed_clients = encode_clients(&request.allowed_clients)?;
        let description = request.description.as_deref().and_then(non_empty);
        let now = self.clock.now();
        let expires_at = now + request.expires_in_days * SECONDS_PER_DAY;

        let mut conn = self.pool.acquire().await?;
        let id = generate_unique_id(&mut conn, "api_keys").await?;
        sqlx::query(
            r#"
            INSERT INTO api_keys (
                id,
                secret_hash,
                masked_key,
                name,
                description,
                enabled,
                requests_per_minute,
                tokens_per_day,
                allowed_clients,
                created_at,
                updated_at,
                expires_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(hash_secret(&secret))
        .bind(&masked_key)
        .bind(name)
        .bind(description)
        .bind(request.enabled)
        .bind(i64::from(rule.requests_per_minute))
        .bind(tokens_to_i64(rule.tokens_per_day))
        .bind(allowed_clients)
        .bind(now)
        .bind(now)
        .bind(expires_at)
        .execute(&mut *conn)
        .await?;

        info!(key_id = %id, key = %masked_key, "api key created");
        let key = self.get(&id).await?;
        Ok(CreatedApiKey { key, secret })
    }

    /// Applies a partial edit as one statement. The secret is never touched.
    pub async fn update(&self, id: &str, patch: ApiKeyPatch) -> Result<ApiKey, ConsoleError> {
        let name = match patch.name.as_deref().map(str::trim) {
            Some("") => {
                return Err(ConsoleError::Validation("name must not be empty".to_string()));
            }
            other => other,
        };
        if let Some(rpm) = patch.rate_limit.requests_per_minute {
            self.validate_requests_per_minute(rpm)?;
        }
        if patch.rate_limit.tokens_per_day == Some(0) {
            return Err(ConsoleError::Validation(
                "tokensPerDay must be at least 1".to_string(),
            ));
        }
        let now = self.clock.now();
        if let Some(expires_at) = patch.expires_at {
            let latest = now + self.bounds.max_expires_in_days * SECONDS_PER_DAY;
            if expires_at <= now || expires_at > latest {
                return Err(ConsoleError::Validation(format!(
                    "expiresAt must be in the future and within {} days",
                    self.bounds.max_expires_in_days
                )));
            }
        }
        let allowed_clients = match &patch.allowed_clients {
            Some(clients) => encode_clients(clients)?,
            None => None,
        };

        let updated = sqlx::query(
            r#"
            UPDATE api_keys
            SET name = COALESCE(?, name),
                description = CASE WHEN ? THEN ? ELSE description END,
                requests_per_minute = COALESCE(?, requests_per_minute),
                tokens_per_day = COALESCE(?, tokens_per_day),
                allowed_clients = CASE WHEN ? THEN ? ELSE allowed_clients END,
                enabled = COALESCE(?, enabled),
                expires_at = COALESCE(?, expires_at),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(name)
        .bind(patch.description.is_some())
        .bind(patch.description.as_deref().and_then(non_empty))
        .bind(patch.rate_limit.requests_per_minute.map(i64::from))
        .bind(patch.rate_limit.tokens_per_day.map(tokens_to_i64))
        .bind(patch.allowed_clients.is_some())
        .bind(allowed_clients)
        .bind(patch.enabled)
        .bind(patch.expires_at)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(ConsoleError::KeyNotFound(id.to_string()));
        }
        info!(key_id = id, "api key updated");
        self.get(id).await
    }

    /// Revokes a key. Request logs that reference it are kept.
    pub async fn delete(&self, id: &str) -> Result<(), ConsoleError> {
        let deleted = sqlx::query("DELETE FROM api_keys WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if deleted == 0 {
            return Err(ConsoleError::KeyNotFound(id.to_string()));
        }
        info!(key_id = id, "api key deleted");
        Ok(())
    }

    /// All keys, newest first.
    pub async fn list(&self) -> Result<Vec<ApiKey>, ConsoleError> {
        let rows = sqlx::query(&format!(
            "SELECT {KEY_COLUMNS} FROM api_keys ORDER BY created_at DESC, id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;

        let keys = rows
            .iter()
            .map(key_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    pub async fn get(&self, id: &str) -> Result<ApiKey, ConsoleError> {
        let row = sqlx::query(&format!(
            "SELECT {KEY_COLUMNS} FROM api_keys WHERE id = ? LIMIT 1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ConsoleError::KeyNotFound(id.to_string()))?;

        Ok(key_from_row(&row)?)
    }

    /// Resolves a presented secret to its key. Unknown, disabled, expired
    /// and client-restricted keys all fail the same way.
    pub async fn authenticate(
        &self,
        secret: &str,
        user_agent: Option<&str>,
    ) -> Result<ApiKey, ConsoleError> {
        let row = sqlx::query(&format!(
            "SELECT {KEY_COLUMNS} FROM api_keys WHERE secret_hash = ? LIMIT 1"
        ))
        .bind(hash_secret(secret.trim()))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            warn!(key = %mask_secret(secret), "unknown api key presented");
            return Err(ConsoleError::Unauthorized);
        };
        let key = key_from_row(&row)?;

        let rejection = if !key.enabled {
            Some("disabled")
        } else if key.is_expired(self.clock.now()) {
            Some("expired")
        } else if !key.allows_client(user_agent) {
            Some("client not allowed")
        } else {
            None
        };
        if let Some(reason) = rejection {
            warn!(key_id = %key.id, reason, "api key rejected");
            return Err(ConsoleError::Unauthorized);
        }

        Ok(key)
    }

    /// Counts one relayed request against the key.
    pub async fn record_usage(&self, id: &str, tokens: u64) -> Result<(), ConsoleError> {
        let updated = sqlx::query(
            r#"
            UPDATE api_keys
            SET total_requests = total_requests + 1,
                total_tokens = total_tokens + ?,
                last_used_at = ?
            WHERE id = ?
            "#,
        )
        .bind(tokens_to_i64(tokens))
        .bind(self.clock.now())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(ConsoleError::KeyNotFound(id.to_string()));
        }
        Ok(())
    }

    fn validate_rule(&self, rule: &RateLimitRule) -> Result<(), ConsoleError> {
        self.validate_requests_per_minute(rule.requests_per_minute)?;
        if rule.tokens_per_day == 0 {
            return Err(ConsoleError::Validation(
                "tokensPerDay must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_requests_per_minute(&self, rpm: u32) -> Result<(), ConsoleError> {
        if !(1..=self.bounds.max_requests_per_minute).contains(&rpm) {
            return Err(ConsoleError::Validation(format!(
                "rateLimit must be between 1 and {} requests per minute",
                self.bounds.max_requests_per_minute
            )));
        }
        Ok(())
    }
}

pub(crate) fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

fn tokens_to_i64(tokens: u64) -> i64 {
    i64::try_from(tokens).unwrap_or(i64::MAX)
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Stored as a JSON array; an empty list is stored as NULL.
fn encode_clients(clients: &[String]) -> Result<Option<String>, ConsoleError> {
    let clients: Vec<String> = clients.iter().filter_map(|c| non_empty(c)).collect();
    if clients.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(&clients)?))
}

fn decode_clients(raw: Option<String>) -> Result<Option<Vec<String>>, sqlx::Error> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let clients: Vec<String> =
        serde_json::from_str(&raw).map_err(|err| sqlx::Error::Decode(Box::new(err)))?;
    Ok((!clients.is_empty()).then_some(clients))
}

fn key_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ApiKey, sqlx::Error> {
    let requests_per_minute: i64 = row.try_get("requests_per_minute")?;
    let tokens_per_day: i64 = row.try_get("tokens_per_day")?;
    let rate_limit = RateLimitRule {
        requests_per_minute: u32::try_from(requests_per_minute)
            .map_err(|err| sqlx::Error::Decode(Box::new(err)))?,
        tokens_per_day: u64::try_from(tokens_per_day)
            .map_err(|err| sqlx::Error::Decode(Box::new(err)))?,
    };

    Ok(ApiKey {
        id: row.try_get("id")?,
        masked_key: row.try_get("masked_key")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        enabled: row.try_get("enabled")?,
        rate_limit,
        allowed_clients: decode_clients(row.try_get("allowed_clients")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        expires_at: normalize_timestamp(row.try_get("expires_at")?),
        last_used_at: normalize_timestamp(row.try_get("last_used_at")?),
        total_requests: row.try_get("total_requests")?,
        total_tokens: row.try_get("total_tokens")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::console;

    fn rpm(requests_per_minute: u32) -> RateLimitOverride {
        RateLimitOverride {
            requests_per_minute: Some(requests_per_minute),
            tokens_per_day: None,
        }
    }

    #[tokio::test]
    async fn created_secret_is_revealed_once_and_listed_masked() {
        let (console, _dir, clock) = console().await;
        let keys = console.api_keys();

        let mut request = NewApiKey::new("K1", 30);
        request.rate_limit = rpm(1000);
        let created = keys.create(request).await.unwrap();

        assert!(created.secret.starts_with(SECRET_PREFIX));
        assert_eq!(created.secret.len(), SECRET_PREFIX.len() + SECRET_RANDOM_LEN);
        let expected_mask = format!(
            "{}...{}",
            &created.secret[..8],
            &created.secret[created.secret.len() - 8..]
        );
        assert_eq!(created.key.masked_key, expected_mask);
        assert_eq!(created.key.rate_limit.requests_per_minute, 1000);
        assert_eq!(created.key.expires_at, Some(clock.now() + 30 * SECONDS_PER_DAY));

        let listed = keys.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "K1");
        assert_eq!(listed[0].masked_key, expected_mask);

        let stored: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM api_keys WHERE secret_hash = ? OR masked_key = ? OR name = ?",
        )
        .bind(&created.secret)
        .bind(&created.secret)
        .bind(&created.secret)
        .fetch_one(console.pool())
        .await
        .unwrap();
        assert_eq!(stored, 0);
    }

    #[tokio::test]
    async fn create_validates_bounds() {
        let (console, _dir, _clock) = console().await;
        let keys = console.api_keys();

        assert!(matches!(
            keys.create(NewApiKey::new("   ", 30)).await,
            Err(ConsoleError::Validation(_))
        ));
        assert!(matches!(
            keys.create(NewApiKey::new("K", 0)).await,
            Err(ConsoleError::Validation(_))
        ));
        assert!(matches!(
            keys.create(NewApiKey::new("K", 366)).await,
            Err(ConsoleError::Validation(_))
        ));

        let mut too_fast = NewApiKey::new("K", 30);
        too_fast.rate_limit = rpm(10_001);
        assert!(matches!(
            keys.create(too_fast).await,
            Err(ConsoleError::Validation(_))
        ));

        let mut no_tokens = NewApiKey::new("K", 30);
        no_tokens.rate_limit.tokens_per_day = Some(0);
        assert!(matches!(
            keys.create(no_tokens).await,
            Err(ConsoleError::Validation(_))
        ));

        assert!(keys.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unspecified_limits_follow_current_defaults() {
        let (console, _dir, _clock) = console().await;
        let mut settings = console.rate_limits().get().await;
        settings.default_requests_per_minute = 90;
        settings.default_tokens_per_day = 20_000;
        console.rate_limits().update(settings).await.unwrap();

        let created = console
            .api_keys()
            .create(NewApiKey::new("K", 7))
            .await
            .unwrap();
        assert_eq!(
            created.key.rate_limit,
            RateLimitRule {
                requests_per_minute: 90,
                tokens_per_day: 20_000,
            }
        );
    }

    #[tokio::test]
    async fn update_is_partial_and_keeps_the_secret() {
        let (console, _dir, clock) = console().await;
        let keys = console.api_keys();
        let mut request = NewApiKey::new("K1", 30);
        request.description = Some("first".to_string());
        request.allowed_clients = vec!["claude-cli".to_string()];
        let created = keys.create(request).await.unwrap();

        let updated = keys
            .update(
                &created.key.id,
                ApiKeyPatch {
                    name: Some("K1 renamed".to_string()),
                    rate_limit: rpm(500),
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "K1 renamed");
        assert_eq!(updated.rate_limit.requests_per_minute, 500);
        assert_eq!(
            updated.rate_limit.tokens_per_day,
            created.key.rate_limit.tokens_per_day
        );
        assert!(!updated.enabled);
        assert_eq!(updated.description.as_deref(), Some("first"));
        assert_eq!(updated.allowed_clients, Some(vec!["claude-cli".to_string()]));
        assert_eq!(updated.masked_key, created.key.masked_key);

        let cleared = keys
            .update(
                &created.key.id,
                ApiKeyPatch {
                    description: Some(String::new()),
                    allowed_clients: Some(Vec::new()),
                    expires_at: Some(clock.now() + 60),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(cleared.description, None);
        assert_eq!(cleared.allowed_clients, None);
        assert_eq!(cleared.expires_at, Some(clock.now() + 60));
        assert_eq!(cleared.name, "K1 renamed");
    }

    #[tokio::test]
    async fn update_rejects_bad_input_and_unknown_ids() {
        let (console, _dir, clock) = console().await;
        let keys = console.api_keys();
        let created = keys.create(NewApiKey::new("K1", 30)).await.unwrap();

        assert!(matches!(
            keys.update("missing", ApiKeyPatch::default()).await,
            Err(ConsoleError::KeyNotFound(_))
        ));
        assert!(matches!(
            keys.update(
                &created.key.id,
                ApiKeyPatch {
                    expires_at: Some(clock.now()),
                    ..Default::default()
                }
            )
            .await,
            Err(ConsoleError::Validation(_))
        ));
        assert!(matches!(
            keys.update(
                &created.key.id,
                ApiKeyPatch {
                    rate_limit: rpm(0),
                    ..Default::default()
                }
            )
            .await,
            Err(ConsoleError::Validation(_))
        ));
        assert!(matches!(
            keys.delete("missing").await,
            Err(ConsoleError::KeyNotFound(_))
        ));

        keys.delete(&created.key.id).await.unwrap();
        assert!(keys.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn authenticate_checks_enabled_expiry_and_client() {
        let (console, _dir, clock) = console().await;
        let keys = console.api_keys();

        let open = keys.create(NewApiKey::new("open", 1)).await.unwrap();
        let found = keys.authenticate(&open.secret, None).await.unwrap();
        assert_eq!(found.id, open.key.id);
        assert!(matches!(
            keys.authenticate("sk-relay-not-a-real-key", None).await,
            Err(ConsoleError::Unauthorized)
        ));

        let mut restricted = NewApiKey::new("cli only", 30);
        restricted.allowed_clients = vec!["Claude-CLI".to_string()];
        let restricted = keys.create(restricted).await.unwrap();
        assert!(
            keys.authenticate(&restricted.secret, Some("claude-cli/1.0.57 (external, cli)"))
                .await
                .is_ok()
        );
        assert!(matches!(
            keys.authenticate(&restricted.secret, Some("curl/8.0")).await,
            Err(ConsoleError::Unauthorized)
        ));
        assert!(matches!(
            keys.authenticate(&restricted.secret, None).await,
            Err(ConsoleError::Unauthorized)
        ));

        let mut disabled = NewApiKey::new("off", 30);
        disabled.enabled = false;
        let disabled = keys.create(disabled).await.unwrap();
        assert!(matches!(
            keys.authenticate(&disabled.secret, None).await,
            Err(ConsoleError::Unauthorized)
        ));

        clock.advance(SECONDS_PER_DAY);
        assert!(matches!(
            keys.authenticate(&open.secret, None).await,
            Err(ConsoleError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn usage_is_accumulated() {
        let (console, _dir, clock) = console().await;
        let keys = console.api_keys();
        let created = keys.create(NewApiKey::new("K", 30)).await.unwrap();

        keys.record_usage(&created.key.id, 120).await.unwrap();
        clock.advance(5);
        keys.record_usage(&created.key.id, 30).await.unwrap();

        let key = keys.get(&created.key.id).await.unwrap();
        assert_eq!(key.total_requests, 2);
        assert_eq!(key.total_tokens, 150);
        assert_eq!(key.last_used_at, Some(clock.now()));
        assert!(matches!(
            keys.record_usage("missing", 1).await,
            Err(ConsoleError::KeyNotFound(_))
        ));
    }

    #[test]
    fn secret_hash_is_lowercase_hex_sha256() {
        assert_eq!(
            hash_secret("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}

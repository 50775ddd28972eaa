use std::sync::Arc;

use serde::Serialize;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{info, warn};

use crate::ConsoleError;
use crate::config::Clock;
use crate::oauth::{Provider, TokenGrant, TokenProvider};
use crate::store::{generate_unique_id, normalize_timestamp};

const UNKNOWN_EMAIL: &str = "unknown@claude.ai";

const ACCOUNT_COLUMNS: &str = r#"
    id, provider, external_identifier, organization, access_token, refresh_token,
    token_expires_at, enabled, rate_limited, created_at, updated_at, last_used_at,
    total_requests, total_tokens
"#;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Active,
    Disabled,
    Expired,
    RateLimited,
}

/// Precedence: disabled, then expired, then rate limited. A missing expiry
/// never counts as expired.
pub fn derive_status(
    enabled: bool,
    token_expires_at: Option<i64>,
    rate_limited: bool,
    now: i64,
) -> AccountStatus {
    if !enabled {
        AccountStatus::Disabled
    } else if token_expires_at.is_some_and(|expires_at| expires_at <= now) {
        AccountStatus::Expired
    } else if rate_limited {
        AccountStatus::RateLimited
    } else {
        AccountStatus::Active
    }
}

/// Upstream credential held by the relay. `status` is computed at read time.
#[derive(Clone, Debug)]
pub struct OAuthAccount {
    pub id: String,
    pub provider: Provider,
    pub external_identifier: String,
    pub organization: Option<String>,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<i64>,
    pub enabled: bool,
    pub rate_limited: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_used_at: Option<i64>,
    pub total_requests: i64,
    pub total_tokens: i64,
    pub status: AccountStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    pub total: i64,
    pub active: i64,
    pub disabled: i64,
    pub expired: i64,
    pub rate_limited: i64,
    pub total_requests: i64,
    pub total_tokens: i64,
}

/// Store of OAuth accounts.
#[derive(Clone, Debug)]
pub struct AccountRegistry {
    pool: SqlitePool,
    provider: Arc<dyn TokenProvider>,
    clock: Clock,
}

impl AccountRegistry {
    pub(crate) fn new(pool: SqlitePool, provider: Arc<dyn TokenProvider>, clock: Clock) -> Self {
        Self {
            pool,
            provider,
            clock,
        }
    }

    /// All accounts, newest first.
    pub async fn list(&self) -> Result<Vec<OAuthAccount>, ConsoleError> {
        let now = self.clock.now();
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM oauth_accounts ORDER BY created_at DESC, id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;

        let accounts = rows
            .iter()
            .map(|row| account_from_row(row, now))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(accounts)
    }

    pub async fn get(&self, id: &str) -> Result<OAuthAccount, ConsoleError> {
        let mut conn = self.pool.acquire().await?;
        fetch_account(&mut conn, id, self.clock.now())
            .await?
            .ok_or_else(|| ConsoleError::AccountNotFound(id.to_string()))
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<OAuthAccount, ConsoleError> {
        self.update_flag(id, "enabled", enabled).await?;
        info!(account_id = id, enabled, "account status changed");
        self.get(id).await
    }

    /// Records the upstream rate-limit signal for an account.
    pub async fn set_rate_limited(
        &self,
        id: &str,
        rate_limited: bool,
    ) -> Result<OAuthAccount, ConsoleError> {
        self.update_flag(id, "rate_limited", rate_limited).await?;
        info!(account_id = id, rate_limited, "account rate-limit flag changed");
        self.get(id).await
    }

    async fn update_flag(
        &self,
        id: &str,
        column: &'static str,
        value: bool,
    ) -> Result<(), ConsoleError> {
        let updated = sqlx::query(&format!(
            "UPDATE oauth_accounts SET {column} = ?, updated_at = ? WHERE id = ?"
        ))
        .bind(value)
        .bind(self.clock.now())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(ConsoleError::AccountNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Removes the account. Request logs that reference it are kept.
    pub async fn delete(&self, id: &str) -> Result<(), ConsoleError> {
        let deleted = sqlx::query("DELETE FROM oauth_accounts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if deleted == 0 {
            return Err(ConsoleError::AccountNotFound(id.to_string()));
        }
        info!(account_id = id, "account deleted");
        Ok(())
    }

    pub async fn summary(&self) -> Result<AccountSummary, ConsoleError> {
        let accounts = self.list().await?;
        let summary = accounts
            .iter()
            .fold(AccountSummary::default(), |mut summary, account| {
                summary.total += 1;
                match account.status {
                    AccountStatus::Active => summary.active += 1,
                    AccountStatus::Disabled => summary.disabled += 1,
                    AccountStatus::Expired => summary.expired += 1,
                    AccountStatus::RateLimited => summary.rate_limited += 1,
                }
                summary.total_requests += account.total_requests;
                summary.total_tokens += account.total_tokens;
                summary
            });
        Ok(summary)
    }

    /// Uses the stored refresh token to obtain new tokens from the provider.
    pub async fn refresh(&self, id: &str) -> Result<OAuthAccount, ConsoleError> {
        let account = self.get(id).await?;
        if account.provider != self.provider.provider() {
            return Err(ConsoleError::UnsupportedProvider(
                account.provider.to_string(),
            ));
        }
        let refresh_token = account.refresh_token.as_deref().ok_or_else(|| {
            ConsoleError::Validation(format!("account {id} has no refresh token"))
        })?;

        let grant = self
            .provider
            .refresh_token(refresh_token)
            .await
            .inspect_err(|err| warn!(account_id = id, error = %err, "token refresh rejected"))?;

        let mut conn = self.pool.acquire().await?;
        let now = self.clock.now();
        rotate_tokens(&mut conn, id, &grant, now).await?;
        info!(account_id = id, "account tokens refreshed");

        fetch_account(&mut conn, id, now)
            .await?
            .ok_or_else(|| ConsoleError::AccountNotFound(id.to_string()))
    }

    /// Writes the result of a code exchange inside the caller's transaction.
    ///
    /// With a bound account only the token fields move; otherwise a new
    /// account is inserted. Returns the account and whether it existed.
    pub(crate) async fn upsert_from_exchange(
        &self,
        conn: &mut SqliteConnection,
        provider: Provider,
        grant: &TokenGrant,
        bound_account_id: Option<&str>,
        now: i64,
    ) -> Result<(OAuthAccount, bool), ConsoleError> {
        if let Some(id) = bound_account_id {
            rotate_tokens(conn, id, grant, now).await?;
            let account = fetch_account(conn, id, now)
                .await?
                .ok_or_else(|| ConsoleError::AccountNotFound(id.to_string()))?;
            return Ok((account, true));
        }

        let id = generate_unique_id(conn, "oauth_accounts").await?;
        let email = grant.email.as_deref().unwrap_or(UNKNOWN_EMAIL);
        sqlx::query(
            r#"
            INSERT INTO oauth_accounts (
                id,
                provider,
                external_identifier,
                organization,
                access_token,
                refresh_token,
                token_expires_at,
                enabled,
                rate_limited,
                created_at,
                updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 1, 0, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(provider.as_str())
        .bind(email)
        .bind(grant.organization.as_deref())
        .bind(&grant.access_token)
        .bind(grant.refresh_token.as_deref())
        .bind(grant.expires_at(now))
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        let account = fetch_account(conn, &id, now)
            .await?
            .ok_or_else(|| ConsoleError::AccountNotFound(id.clone()))?;
        Ok((account, false))
    }
}

/// Rotates the token fields only. A grant without a refresh token keeps the
/// stored one.
async fn rotate_tokens(
    conn: &mut SqliteConnection,
    id: &str,
    grant: &TokenGrant,
    now: i64,
) -> Result<(), ConsoleError> {
    let updated = sqlx::query(
        r#"
        UPDATE oauth_accounts
        SET access_token = ?,
            refresh_token = COALESCE(?, refresh_token),
            token_expires_at = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&grant.access_token)
    .bind(grant.refresh_token.as_deref())
    .bind(grant.expires_at(now))
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if updated == 0 {
        return Err(ConsoleError::AccountNotFound(id.to_string()));
    }
    Ok(())
}

async fn fetch_account(
    conn: &mut SqliteConnection,
    id: &str,
    now: i64,
) -> Result<Option<OAuthAccount>, ConsoleError> {
    let row = sqlx::query(&format!(
        "SELECT {ACCOUNT_COLUMNS} FROM oauth_accounts WHERE id = ? LIMIT 1"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|row| account_from_row(&row, now)).transpose()?)
}

fn account_from_row(row: &sqlx::sqlite::SqliteRow, now: i64) -> Result<OAuthAccount, sqlx::Error> {
    let provider: String = row.try_get("provider")?;
    let provider = provider
        .parse::<Provider>()
        .map_err(|err| sqlx::Error::Decode(Box::new(err)))?;
    let enabled: bool = row.try_get("enabled")?;
    let rate_limited: bool = row.try_get("rate_limited")?;
    let token_expires_at = normalize_timestamp(row.try_get("token_expires_at")?);

    Ok(OAuthAccount {
        id: row.try_get("id")?,
        provider,
        external_identifier: row.try_get("external_identifier")?,
        organization: row.try_get("organization")?,
        access_token: row.try_get("access_token")?,
        refresh_token: row.try_get("refresh_token")?,
        token_expires_at,
        enabled,
        rate_limited,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_used_at: normalize_timestamp(row.try_get("last_used_at")?),
        total_requests: row.try_get("total_requests")?,
        total_tokens: row.try_get("total_tokens")?,
        status: derive_status(enabled, token_expires_at, rate_limited, now),
    })
}

use std::time::Duration;

use nanoid::nanoid;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};

use crate::ConsoleError;

const ID_LENGTH: usize = 12;

pub(crate) async fn connect(database_path: &str) -> Result<SqlitePool, ConsoleError> {
    let options = SqliteConnectOptions::new()
        .filename(database_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .connect_with(options)
        .await?;

    initialize_schema(&pool).await?;
    Ok(pool)
}

async fn initialize_schema(pool: &SqlitePool) -> Result<(), ConsoleError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS oauth_accounts (
            id TEXT PRIMARY KEY,
            provider TEXT NOT NULL,
            external_identifier TEXT NOT NULL,
            organization TEXT,
            access_token TEXT NOT NULL,
            refresh_token TEXT,
            token_expires_at INTEGER,
            enabled INTEGER NOT NULL DEFAULT 1,
            rate_limited INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            last_used_at INTEGER,
            total_requests INTEGER NOT NULL DEFAULT 0,
            total_tokens INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // No foreign key on bound_account_id: an account may be deleted while a
    // reauthorization session for it is still pending.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS oauth_sessions (
            state TEXT PRIMARY KEY,
            provider TEXT NOT NULL,
            code_verifier TEXT NOT NULL,
            code_challenge TEXT NOT NULL,
            authorization_url TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            bound_account_id TEXT,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            consumed_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_oauth_sessions_verifier ON oauth_sessions (code_verifier)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS api_keys (
            id TEXT PRIMARY KEY,
            secret_hash TEXT NOT NULL UNIQUE,
            masked_key TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            enabled INTEGER NOT NULL DEFAULT 1,
            requests_per_minute INTEGER NOT NULL,
            tokens_per_day INTEGER NOT NULL,
            allowed_clients TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            expires_at INTEGER,
            last_used_at INTEGER,
            total_requests INTEGER NOT NULL DEFAULT 0,
            total_tokens INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Log rows carry a snapshot of key and account labels and outlive both.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS request_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            api_key_id TEXT,
            api_key_display TEXT,
            account_id TEXT,
            account_email TEXT,
            provider TEXT,
            method TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            status_code INTEGER,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            latency_ms INTEGER,
            error_message TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Picks a short random id that is not yet used in `table`.
pub(crate) async fn generate_unique_id(
    conn: &mut SqliteConnection,
    table: &'static str,
) -> Result<String, ConsoleError> {
    let sql = format!("SELECT id FROM {table} WHERE id = ? LIMIT 1");
    loop {
        let candidate = nanoid!(ID_LENGTH);
        let exists = sqlx::query_scalar::<_, String>(&sql)
            .bind(&candidate)
            .fetch_optional(&mut *conn)
            .await?;

        if exists.is_none() {
            return Ok(candidate);
        }
    }
}

pub(crate) fn normalize_timestamp(timestamp: Option<i64>) -> Option<i64> {
    timestamp.filter(|value| *value > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_is_idempotent_and_ids_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.db");
        let path = path.to_str().unwrap();

        let pool = connect(path).await.unwrap();
        // A second start against the same file must not fail.
        initialize_schema(&pool).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let first = generate_unique_id(&mut conn, "api_keys").await.unwrap();
        let second = generate_unique_id(&mut conn, "api_keys").await.unwrap();
        assert_eq!(first.len(), ID_LENGTH);
        assert_ne!(first, second);
    }

    #[test]
    fn zero_timestamps_are_treated_as_missing() {
        assert_eq!(normalize_timestamp(Some(0)), None);
        assert_eq!(normalize_timestamp(Some(-5)), None);
        assert_eq!(normalize_timestamp(None), None);
        assert_eq!(normalize_timestamp(Some(42)), Some(42));
    }
}

use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::ConsoleError;
use crate::config::Clock;

/// One relayed request as the relay reports it.
#[derive(Debug, Clone, Default)]
pub struct RequestLogEntry<'a> {
    pub api_key_id: Option<&'a str>,
    pub api_key_display: Option<&'a str>,
    pub account_id: Option<&'a str>,
    pub account_email: Option<&'a str>,
    pub provider: Option<&'a str>,
    pub method: &'a str,
    pub endpoint: &'a str,
    pub status_code: Option<u16>,
    pub total_tokens: u64,
    pub latency_ms: Option<u64>,
    pub error_message: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLogRecord {
    pub id: i64,
    pub api_key_id: Option<String>,
    pub api_key_display: Option<String>,
    pub account_id: Option<String>,
    pub account_email: Option<String>,
    pub provider: Option<String>,
    pub method: String,
    pub endpoint: String,
    pub status_code: Option<i64>,
    pub total_tokens: i64,
    pub latency_ms: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: i64,
}

/// Audit trail of relayed requests. Rows keep their own copy of the key and
/// account labels, so deleting either leaves history intact.
#[derive(Clone, Debug)]
pub struct RequestDiagnostics {
    pool: SqlitePool,
    clock: Clock,
}

impl RequestDiagnostics {
    pub(crate) fn new(pool: SqlitePool, clock: Clock) -> Self {
        Self { pool, clock }
    }

    pub async fn record(&self, entry: RequestLogEntry<'_>) -> Result<i64, ConsoleError> {
        let id = sqlx::query(
            r#"
            INSERT INTO request_logs (
                api_key_id,
                api_key_display,
                account_id,
                account_email,
                provider,
                method,
                endpoint,
                status_code,
                total_tokens,
                latency_ms,
                error_message,
                created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.api_key_id)
        .bind(entry.api_key_display)
        .bind(entry.account_id)
        .bind(entry.account_email)
        .bind(entry.provider)
        .bind(entry.method)
        .bind(entry.endpoint)
        .bind(entry.status_code.map(i64::from))
        .bind(i64::try_from(entry.total_tokens).unwrap_or(i64::MAX))
        .bind(entry.latency_ms.map(|ms| i64::try_from(ms).unwrap_or(i64::MAX)))
        .bind(entry.error_message)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(id)
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<RequestLogRecord>, ConsoleError> {
        let limit = limit.clamp(1, 500) as i64;

        let rows = sqlx::query(
            r#"
            SELECT
                id,
                api_key_id,
                api_key_display,
                account_id,
                account_email,
                provider,
                method,
                endpoint,
                status_code,
                total_tokens,
                latency_ms,
                error_message,
                created_at
            FROM request_logs
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let records = rows
            .into_iter()
            .map(|row| -> Result<RequestLogRecord, sqlx::Error> {
                Ok(RequestLogRecord {
                    id: row.try_get("id")?,
                    api_key_id: row.try_get("api_key_id")?,
                    api_key_display: row.try_get("api_key_display")?,
                    account_id: row.try_get("account_id")?,
                    account_email: row.try_get("account_email")?,
                    provider: row.try_get("provider")?,
                    method: row.try_get("method")?,
                    endpoint: row.try_get("endpoint")?,
                    status_code: row.try_get("status_code")?,
                    total_tokens: row.try_get("total_tokens")?,
                    latency_ms: row.try_get("latency_ms")?,
                    error_message: row.try_get("error_message")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_keys::NewApiKey;
    use crate::test_support::{authorize, console};

    #[tokio::test]
    async fn rows_survive_key_and_account_deletion() {
        let (console, _dir, clock) = console().await;
        let account = authorize(&console).await;
        let key = console
            .api_keys()
            .create(NewApiKey::new("K1", 30))
            .await
            .unwrap()
            .key;

        let diagnostics = console.diagnostics();
        diagnostics
            .record(RequestLogEntry {
                api_key_id: Some(&key.id),
                api_key_display: Some(&key.masked_key),
                account_id: Some(&account.id),
                account_email: Some(&account.external_identifier),
                provider: Some("claude"),
                method: "POST",
                endpoint: "/v1/messages",
                status_code: Some(200),
                total_tokens: 321,
                latency_ms: Some(850),
                error_message: None,
            })
            .await
            .unwrap();
        clock.advance(1);
        diagnostics
            .record(RequestLogEntry {
                api_key_id: Some(&key.id),
                method: "POST",
                endpoint: "/v1/messages",
                status_code: Some(429),
                error_message: Some("rate limited upstream"),
                ..Default::default()
            })
            .await
            .unwrap();

        console.api_keys().delete(&key.id).await.unwrap();
        console.accounts().delete(&account.id).await.unwrap();

        let logs = diagnostics.recent(10).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].status_code, Some(429));
        assert_eq!(logs[1].api_key_display.as_deref(), Some(key.masked_key.as_str()));
        assert_eq!(logs[1].account_email.as_deref(), Some("ops@example.com"));
        assert_eq!(logs[1].total_tokens, 321);
    }

    #[tokio::test]
    async fn limit_is_clamped() {
        let (console, _dir, _clock) = console().await;
        let diagnostics = console.diagnostics();
        for _ in 0..3 {
            diagnostics
                .record(RequestLogEntry {
                    method: "GET",
                    endpoint: "/v1/models",
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        assert_eq!(diagnostics.recent(0).await.unwrap().len(), 1);
        assert_eq!(diagnostics.recent(10_000).await.unwrap().len(), 3);
    }
}

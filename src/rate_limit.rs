use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::ConsoleError;
use crate::config::Clock;

const RATE_LIMIT_SETTINGS_KEY: &str = "rate-limit";

/// Request and token ceilings carried by an API key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRule {
    pub requests_per_minute: u32,
    pub tokens_per_day: u64,
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            tokens_per_day: 1_000_000,
        }
    }
}

/// Per-key overrides; missing fields come from the current defaults.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RateLimitOverride {
    pub requests_per_minute: Option<u32>,
    pub tokens_per_day: Option<u64>,
}

impl RateLimitOverride {
    pub fn resolve(&self, defaults: RateLimitRule) -> RateLimitRule {
        RateLimitRule {
            requests_per_minute: self
                .requests_per_minute
                .unwrap_or(defaults.requests_per_minute),
            tokens_per_day: self.tokens_per_day.unwrap_or(defaults.tokens_per_day),
        }
    }
}

/// Operator-editable defaults served at `/admin/settings/rate-limit`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSettings {
    pub enable_rate_limit: bool,
    pub default_requests_per_minute: u32,
    pub default_requests_per_hour: u32,
    pub default_tokens_per_day: u64,
    pub burst_size: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        let rule = RateLimitRule::default();
        Self {
            enable_rate_limit: true,
            default_requests_per_minute: rule.requests_per_minute,
            default_requests_per_hour: 1_000,
            default_tokens_per_day: rule.tokens_per_day,
            burst_size: 10,
        }
    }
}

impl RateLimitSettings {
    pub fn default_rule(&self) -> RateLimitRule {
        RateLimitRule {
            requests_per_minute: self.default_requests_per_minute,
            tokens_per_day: self.default_tokens_per_day,
        }
    }

    pub fn validate(&self) -> Result<(), ConsoleError> {
        check_range(
            "defaultRequestsPerMinute",
            u64::from(self.default_requests_per_minute),
            1,
            1_000,
        )?;
        check_range(
            "defaultRequestsPerHour",
            u64::from(self.default_requests_per_hour),
            1,
            10_000,
        )?;
        check_range(
            "defaultTokensPerDay",
            self.default_tokens_per_day,
            1_000,
            10_000_000,
        )?;
        check_range("burstSize", u64::from(self.burst_size), 1, 100)?;
        Ok(())
    }
}

fn check_range(field: &str, value: u64, min: u64, max: u64) -> Result<(), ConsoleError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConsoleError::Validation(format!(
            "{field} must be between {min} and {max}, got {value}"
        )))
    }
}

/// Shared handle over the stored rate-limit defaults.
#[derive(Clone, Debug)]
pub struct RateLimitDefaults {
    pool: SqlitePool,
    current: Arc<RwLock<RateLimitSettings>>,
    clock: Clock,
}

impl RateLimitDefaults {
    pub(crate) async fn load(
        pool: SqlitePool,
        fallback: RateLimitSettings,
        clock: Clock,
    ) -> Result<Self, ConsoleError> {
        let stored =
            sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ? LIMIT 1")
                .bind(RATE_LIMIT_SETTINGS_KEY)
                .fetch_optional(&pool)
                .await?;

        let current = match stored {
            Some(raw) => match serde_json::from_str::<RateLimitSettings>(&raw) {
                Ok(settings) => settings,
                Err(err) => {
                    warn!(error = %err, "stored rate-limit settings are unreadable; using defaults");
                    fallback
                }
            },
            None => fallback,
        };

        Ok(Self {
            pool,
            current: Arc::new(RwLock::new(current)),
            clock,
        })
    }

    pub async fn get(&self) -> RateLimitSettings {
        self.current.read().await.clone()
    }

    pub async fn default_rule(&self) -> RateLimitRule {
        self.current.read().await.default_rule()
    }

    /// Validates, persists and publishes new defaults. Keys created earlier
    /// keep the rule they were issued with.
    pub async fn update(
        &self,
        settings: RateLimitSettings,
    ) -> Result<RateLimitSettings, ConsoleError> {
        settings.validate()?;

        let mut current = self.current.write().await;
        let value = serde_json::to_string(&settings)?;
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(RATE_LIMIT_SETTINGS_KEY)
        .bind(&value)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;

        *current = settings.clone();
        info!(
            rpm = settings.default_requests_per_minute,
            tokens_per_day = settings.default_tokens_per_day,
            "rate-limit defaults updated"
        );
        Ok(settings)
    }
}

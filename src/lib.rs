use std::sync::Arc;

use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;

pub mod accounts;
pub mod api_keys;
pub mod config;
pub mod diagnostics;
pub mod oauth;
pub mod poll;
pub mod rate_limit;
mod store;
#[cfg(test)]
mod test_support;

use accounts::AccountRegistry;
use api_keys::ApiKeyRegistry;
use config::{Clock, ConsoleConfig};
use diagnostics::RequestDiagnostics;
use oauth::{AuthorizationSessionManager, ClaudeProvider, TokenProvider};
use rate_limit::RateLimitDefaults;

/// Control plane for the relay: upstream OAuth accounts, client API keys and
/// their rate-limit defaults, all over one SQLite store.
#[derive(Clone, Debug)]
pub struct AdminConsole {
    pool: SqlitePool,
    sessions: AuthorizationSessionManager,
    accounts: AccountRegistry,
    api_keys: ApiKeyRegistry,
    rate_limits: RateLimitDefaults,
    diagnostics: RequestDiagnostics,
    clock: Clock,
}

impl AdminConsole {
    /// Opens the store and talks to Claude's OAuth endpoints from `config`.
    pub async fn open(database_path: &str, config: ConsoleConfig) -> Result<Self, ConsoleError> {
        let provider = ClaudeProvider::new(config.endpoints.clone())?;
        Self::with_provider(database_path, config, Arc::new(provider)).await
    }

    pub async fn with_provider(
        database_path: &str,
        config: ConsoleConfig,
        provider: Arc<dyn TokenProvider>,
    ) -> Result<Self, ConsoleError> {
        let pool = store::connect(database_path).await?;
        let clock = config.clock.clone();

        let rate_limits =
            RateLimitDefaults::load(pool.clone(), config.rate_limit_defaults, clock.clone())
                .await?;
        let accounts = AccountRegistry::new(pool.clone(), provider.clone(), clock.clone());
        let sessions = AuthorizationSessionManager::new(
            pool.clone(),
            provider.clone(),
            accounts.clone(),
            config.session_ttl_secs,
            clock.clone(),
        );
        let api_keys = ApiKeyRegistry::new(
            pool.clone(),
            rate_limits.clone(),
            config.key_bounds,
            clock.clone(),
        );
        let diagnostics = RequestDiagnostics::new(pool.clone(), clock.clone());

        info!(
            database = database_path,
            provider = provider.provider().as_str(),
            "admin console ready"
        );

        Ok(Self {
            pool,
            sessions,
            accounts,
            api_keys,
            rate_limits,
            diagnostics,
            clock,
        })
    }

    pub fn sessions(&self) -> &AuthorizationSessionManager {
        &self.sessions
    }

    pub fn accounts(&self) -> &AccountRegistry {
        &self.accounts
    }

    pub fn api_keys(&self) -> &ApiKeyRegistry {
        &self.api_keys
    }

    pub fn rate_limits(&self) -> &RateLimitDefaults {
        &self.rate_limits
    }

    pub fn diagnostics(&self) -> &RequestDiagnostics {
        &self.diagnostics
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),
    #[error("authorization session not found; generate a new authorization link and try again")]
    SessionNotFound,
    #[error("authorization session has expired; generate a new authorization link and try again")]
    SessionExpired,
    #[error("authorization code has already been used; generate a new authorization link and try again")]
    SessionAlreadyConsumed,
    #[error("account not found: {0}")]
    AccountNotFound(String),
    #[error("api key not found: {0}")]
    KeyNotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("missing or invalid credentials")]
    Unauthorized,
    #[error("token exchange failed: {0}")]
    UpstreamExchangeFailed(String),
    #[error("invalid endpoint '{endpoint}': {source}")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConsoleError {
    /// Stable machine-readable code carried in error responses.
    pub fn code(&self) -> &'static str {
        match self {
            ConsoleError::UnsupportedProvider(_) => "UNSUPPORTED_PROVIDER",
            ConsoleError::SessionNotFound => "SESSION_NOT_FOUND",
            ConsoleError::SessionExpired => "SESSION_EXPIRED",
            ConsoleError::SessionAlreadyConsumed => "SESSION_ALREADY_CONSUMED",
            ConsoleError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            ConsoleError::KeyNotFound(_) => "KEY_NOT_FOUND",
            ConsoleError::Validation(_) => "VALIDATION_ERROR",
            ConsoleError::Unauthorized => "UNAUTHORIZED",
            ConsoleError::UpstreamExchangeFailed(_) => "UPSTREAM_EXCHANGE_FAILED",
            ConsoleError::InvalidEndpoint { .. } => "INVALID_ENDPOINT",
            ConsoleError::Database(_) => "DATABASE_ERROR",
            ConsoleError::Http(_) => "HTTP_ERROR",
            ConsoleError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

/// `first 8 + "..." + last 8`; anything too short to split is fully starred.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 16 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 8..].iter().collect();
    format!("{head}...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_keeps_eight_characters_each_side() {
        assert_eq!(
            mask_secret("sk-relay-0123456789abcdefghijklmnopqrstuvwxyzABCD"),
            "sk-relay...wxyzABCD"
        );
        assert_eq!(mask_secret("short"), "*****");
        assert_eq!(mask_secret(""), "");
    }

    #[test]
    fn regenerate_hint_is_part_of_session_errors() {
        for err in [
            ConsoleError::SessionNotFound,
            ConsoleError::SessionExpired,
            ConsoleError::SessionAlreadyConsumed,
        ] {
            assert!(err.to_string().contains("generate a new authorization link"));
        }
        assert_eq!(ConsoleError::SessionExpired.code(), "SESSION_EXPIRED");
    }
}

use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use chrono::Utc;

use crate::oauth::OAuthEndpoints;
use crate::rate_limit::RateLimitSettings;

/// Default lifetime of a pending authorization session.
pub const DEFAULT_SESSION_TTL_SECS: i64 = 10 * 60;

pub const DEFAULT_MAX_REQUESTS_PER_MINUTE: u32 = 10_000;
pub const DEFAULT_MAX_EXPIRES_IN_DAYS: i64 = 365;

pub(crate) const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Wall clock used for every expiry decision.
///
/// Production code uses the system clock; tests swap in a manual clock so
/// they can step past session and token deadlines without sleeping.
#[derive(Clone, Debug, Default)]
pub struct Clock {
    manual: Option<Arc<AtomicI64>>,
}

impl Clock {
    pub fn system() -> Self {
        Self::default()
    }

    pub fn manual(start: i64) -> Self {
        Self {
            manual: Some(Arc::new(AtomicI64::new(start))),
        }
    }

    /// Current unix timestamp in seconds.
    pub fn now(&self) -> i64 {
        match &self.manual {
            Some(value) => value.load(Ordering::SeqCst),
            None => Utc::now().timestamp(),
        }
    }

    /// Moves a manual clock forward. No-op on the system clock.
    pub fn advance(&self, seconds: i64) {
        if let Some(value) = &self.manual {
            value.fetch_add(seconds, Ordering::SeqCst);
        }
    }
}

/// Upper bounds enforced when API keys are created or edited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyBounds {
    pub max_requests_per_minute: u32,
    pub max_expires_in_days: i64,
}

impl Default for KeyBounds {
    fn default() -> Self {
        Self {
            max_requests_per_minute: DEFAULT_MAX_REQUESTS_PER_MINUTE,
            max_expires_in_days: DEFAULT_MAX_EXPIRES_IN_DAYS,
        }
    }
}

/// Process-wide settings handed to the registries at construction.
#[derive(Clone, Debug)]
pub struct ConsoleConfig {
    pub session_ttl_secs: i64,
    pub key_bounds: KeyBounds,
    /// Used until an operator stores different defaults.
    pub rate_limit_defaults: RateLimitSettings,
    pub endpoints: OAuthEndpoints,
    pub clock: Clock,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            key_bounds: KeyBounds::default(),
            rate_limit_defaults: RateLimitSettings::default(),
            endpoints: OAuthEndpoints::claude(),
            clock: Clock::system(),
        }
    }
}

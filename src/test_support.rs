//! Shared fixtures for unit tests: a scripted token provider and a console
//! backed by a throwaway database with a manual clock.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use crate::accounts::OAuthAccount;
use crate::config::{Clock, ConsoleConfig};
use crate::oauth::{ExchangeRequest, Provider, TokenGrant, TokenProvider};
use crate::{AdminConsole, ConsoleError};

pub(crate) const START: i64 = 1_700_000_000;

#[derive(Debug)]
struct StubState {
    grant: TokenGrant,
    failure: Option<String>,
    single_use_codes: bool,
    redeemed_codes: HashSet<String>,
    exchange_calls: usize,
    refresh_calls: usize,
}

/// Token provider that answers from memory. Clones share state.
#[derive(Clone, Debug)]
pub(crate) struct StubProvider {
    state: Arc<Mutex<StubState>>,
}

impl Default for StubProvider {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(StubState {
                grant: TokenGrant {
                    access_token: "at-initial".to_string(),
                    refresh_token: Some("rt-initial".to_string()),
                    expires_in: Some(3_600),
                    email: Some("ops@example.com".to_string()),
                    organization: Some("Example Org".to_string()),
                },
                failure: None,
                single_use_codes: false,
                redeemed_codes: HashSet::new(),
                exchange_calls: 0,
                refresh_calls: 0,
            })),
        }
    }
}

impl StubProvider {
    pub(crate) fn set_grant(&self, grant: TokenGrant) {
        self.state.lock().unwrap().grant = grant;
    }

    pub(crate) fn fail_with(&self, reason: &str) {
        self.state.lock().unwrap().failure = Some(reason.to_string());
    }

    /// Rejects a code the second time it is presented, like a real provider.
    pub(crate) fn reject_reused_codes(&self) {
        self.state.lock().unwrap().single_use_codes = true;
    }

    pub(crate) fn succeed(&self) {
        self.state.lock().unwrap().failure = None;
    }

    pub(crate) fn exchange_calls(&self) -> usize {
        self.state.lock().unwrap().exchange_calls
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.state.lock().unwrap().refresh_calls
    }

    fn answer(&self, code: Option<&str>) -> Result<TokenGrant, ConsoleError> {
        let mut state = self.state.lock().unwrap();
        match code {
            Some(code) => {
                state.exchange_calls += 1;
                if state.single_use_codes && !state.redeemed_codes.insert(code.to_string()) {
                    return Err(ConsoleError::UpstreamExchangeFailed(
                        "token endpoint returned status 400: error=invalid_grant".to_string(),
                    ));
                }
            }
            None => state.refresh_calls += 1,
        }
        match &state.failure {
            Some(reason) => Err(ConsoleError::UpstreamExchangeFailed(format!(
                "token endpoint returned status 400: error={reason}"
            ))),
            None => Ok(state.grant.clone()),
        }
    }
}

#[async_trait]
impl TokenProvider for StubProvider {
    fn provider(&self) -> Provider {
        Provider::Claude
    }

    fn authorization_url(&self, code_challenge: &str, state: &str) -> Result<String, ConsoleError> {
        Ok(format!(
            "https://auth.example.test/authorize?code_challenge={code_challenge}&state={state}"
        ))
    }

    async fn exchange_code(
        &self,
        code: &str,
        _code_verifier: &str,
        _state: &str,
    ) -> Result<TokenGrant, ConsoleError> {
        self.answer(Some(code))
    }

    async fn refresh_token(&self, _refresh_token: &str) -> Result<TokenGrant, ConsoleError> {
        self.answer(None)
    }
}

pub(crate) async fn console() -> (AdminConsole, TempDir, Clock) {
    console_with(StubProvider::default(), |_| {}).await
}

pub(crate) async fn console_with(
    provider: StubProvider,
    configure: impl FnOnce(&mut ConsoleConfig),
) -> (AdminConsole, TempDir, Clock) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("console.db");
    let clock = Clock::manual(START);
    let mut config = ConsoleConfig {
        clock: clock.clone(),
        ..ConsoleConfig::default()
    };
    configure(&mut config);

    let console = AdminConsole::with_provider(path.to_str().unwrap(), config, Arc::new(provider))
        .await
        .unwrap();
    (console, dir, clock)
}

/// Runs a full unbound authorization and returns the new account.
pub(crate) async fn authorize(console: &AdminConsole) -> OAuthAccount {
    let pending = console
        .sessions()
        .begin_session(Provider::Claude, None)
        .await
        .unwrap();
    console
        .sessions()
        .exchange(ExchangeRequest {
            code: "code-from-provider".to_string(),
            code_verifier: pending.code_verifier,
            state: Some(pending.state),
            bound_account_id: None,
        })
        .await
        .unwrap()
        .account
}

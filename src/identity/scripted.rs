//! Scripted Identity Provider
//!
//! An in-process provider whose answers are set up front. Used by the
//! simulator binary and by tests; several instances can share one
//! provider to model a single sign-on tenant.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use async_trait::async_trait;

use super::{Account, IdentityProvider, SessionResult, TokenResponse};
use crate::error::{Error, Result};

#[derive(Default)]
struct Script {
    pending_redirect: Option<SessionResult>,
    login_result: Option<SessionResult>,
    accounts: HashMap<String, Account>,
    tokens: HashMap<String, String>,
    failing: bool,
}

/// Provider with pre-programmed responses
#[derive(Default)]
pub struct ScriptedIdentityProvider {
    script: Mutex<Script>,
    logins: AtomicUsize,
    sign_outs: AtomicUsize,
}

impl ScriptedIdentityProvider {
    /// Create a provider that knows nobody
    pub fn new() -> Self {
        Self::default()
    }

    /// Result returned by the next resume check (consumed once)
    pub fn with_pending_redirect(self, result: SessionResult) -> Self {
        self.edit(|s| s.pending_redirect = Some(result));
        self
    }

    /// Result returned by every interactive login; registers its account
    pub fn with_login_result(self, result: SessionResult, username: &str) -> Self {
        self.edit(|s| {
            s.accounts.insert(
                result.account_id.clone(),
                Account {
                    home_account_id: result.account_id.clone(),
                    username: username.to_string(),
                    tenant_id: None,
                },
            );
            s.login_result = Some(result);
        });
        self
    }

    /// Access token issued for an account
    pub fn with_token(self, account_id: &str, token: &str) -> Self {
        self.edit(|s| {
            s.tokens.insert(account_id.to_string(), token.to_string());
        });
        self
    }

    /// Make every call fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.edit(|s| s.failing = failing);
    }

    /// Forget a cached account
    pub fn forget_account(&self, account_id: &str) {
        self.edit(|s| {
            s.accounts.remove(account_id);
        });
    }

    /// Number of interactive logins started
    pub fn login_count(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    /// Number of sign-outs attempted
    pub fn sign_out_count(&self) -> usize {
        self.sign_outs.load(Ordering::SeqCst)
    }

    fn edit(&self, f: impl FnOnce(&mut Script)) {
        if let Ok(mut script) = self.script.lock() {
            f(&mut script);
        }
    }

    fn with_script<R>(&self, f: impl FnOnce(&mut Script) -> Result<R>) -> Result<R> {
        let mut script = self
            .script
            .lock()
            .map_err(|_| Error::Internal("identity script lock poisoned".into()))?;
        if script.failing {
            return Err(Error::Identity("provider unavailable".into()));
        }
        f(&mut script)
    }
}

#[async_trait]
impl IdentityProvider for ScriptedIdentityProvider {
    async fn begin_interactive_login(&self, _session_hint: Option<&str>) -> Result<Option<SessionResult>> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        self.with_script(|s| Ok(s.login_result.clone()))
    }

    async fn complete_redirect_if_pending(&self) -> Result<Option<SessionResult>> {
        self.with_script(|s| Ok(s.pending_redirect.take()))
    }

    async fn sign_out(&self, _account_id: Option<&str>) -> Result<()> {
        self.sign_outs.fetch_add(1, Ordering::SeqCst);
        self.with_script(|_| Ok(()))
    }

    async fn get_account_by_id(&self, account_id: &str) -> Result<Option<Account>> {
        self.with_script(|s| Ok(s.accounts.get(account_id).cloned()))
    }

    async fn acquire_access_token(&self, account: &Account, _scopes: &[String]) -> Result<TokenResponse> {
        self.with_script(|s| {
            Ok(match s.tokens.get(&account.home_account_id) {
                Some(token) => TokenResponse::Token(token.clone()),
                None => TokenResponse::RedirectNeeded,
            })
        })
    }
}

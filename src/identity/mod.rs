//! Identity Provider Boundary
//!
//! The session logic only depends on these signatures. The provider's own
//! login, redirect and token protocol stays behind the trait.

mod scripted;

pub use scripted::ScriptedIdentityProvider;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// The signed-in user's identity as reported by a token response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Granted scopes
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Raw id token
    #[serde(default)]
    pub id_token: String,
    /// Id token claims
    #[serde(default)]
    pub claims: Value,
    /// Token expiry
    #[serde(default)]
    pub expires_on: Option<DateTime<Utc>>,
    /// Display name
    #[serde(default)]
    pub display_name: Option<String>,
}

impl Identity {
    /// Check whether the identity has expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_on.map_or(false, |expiry| expiry <= now)
    }
}

/// A provider account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Home account id (the session's account id)
    pub home_account_id: String,
    /// Sign-in name
    pub username: String,
    /// Tenant, if the provider is multi-tenant
    #[serde(default)]
    pub tenant_id: Option<String>,
}

/// Outcome of a completed login
#[derive(Debug, Clone, PartialEq)]
pub struct SessionResult {
    pub account_id: String,
    pub session_id: String,
    pub identity: Identity,
}

/// Outcome of a token request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenResponse {
    /// An access token was issued silently
    Token(String),
    /// The provider needs an interactive redirect first
    RedirectNeeded,
}

/// External identity provider
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Start an interactive login, optionally hinting an existing session.
    /// Providers that complete in place (popup) return the result; redirect
    /// flows return `None` and deliver the result on the next resume check.
    async fn begin_interactive_login(&self, session_hint: Option<&str>) -> Result<Option<SessionResult>>;

    /// Finish a pending redirect round-trip, if one is in progress
    async fn complete_redirect_if_pending(&self) -> Result<Option<SessionResult>>;

    /// Sign out, optionally for a specific account
    async fn sign_out(&self, account_id: Option<&str>) -> Result<()>;

    /// Look up a cached account
    async fn get_account_by_id(&self, account_id: &str) -> Result<Option<Account>>;

    /// Acquire an access token for the given scopes
    async fn acquire_access_token(&self, account: &Account, scopes: &[String]) -> Result<TokenResponse>;
}

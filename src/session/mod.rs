//! Session Synchronization
//!
//! Decides at startup whether this instance establishes the session itself
//! (a completed redirect, or later an interactive login) or waits a bounded
//! time for the leader to hand over its account and session ids.
//!
//! Identity provider failures never escape from here: they are reported to
//! telemetry and turned into a safe default (empty session, not
//! authenticated, no token).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::api::AccessTokenSource;
use crate::deferred::{BoundedDeferred, Settlement};
use crate::error::Result;
use crate::identity::{Identity, IdentityProvider, SessionResult, TokenResponse};
use crate::store::{is_leader, AuthModule, Origin, SessionState, Store, UserIds, AUTH_MODULE};
use crate::telemetry::Telemetry;
use crate::transport::Action;

const SET_USER: &str = "auth/__setUser";

/// Startup phase of the session logic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// `init_store` has not run
    Uninitialized,
    /// Resuming locally or waiting for the leader's answer
    AwaitingLeaderOrLocal,
    /// Startup finished, whatever the outcome
    Ready,
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a non-leader waits for the leader to share its session
    pub leader_answer_timeout: Duration,
    /// Scopes requested for API access tokens
    pub api_scopes: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            leader_answer_timeout: Duration::from_millis(1000),
            api_scopes: Vec::new(),
        }
    }
}

/// Session logic for one instance
pub struct SessionSync {
    store: Arc<Store>,
    provider: Arc<dyn IdentityProvider>,
    telemetry: Arc<dyn Telemetry>,
    config: SessionConfig,
    /// Module holding the leadership flag
    coordination_module: String,
    phase: RwLock<SessionPhase>,
    /// Armed while a non-leader waits for the leader's answer
    pending: Arc<Mutex<Option<BoundedDeferred>>>,
}

impl SessionSync {
    /// Register the auth module (if needed) and start watching for answers
    pub async fn new(
        store: Arc<Store>,
        provider: Arc<dyn IdentityProvider>,
        telemetry: Arc<dyn Telemetry>,
        config: SessionConfig,
        coordination_module: impl Into<String>,
    ) -> Self {
        store.register_module(Box::new(AuthModule::new())).await;

        let pending: Arc<Mutex<Option<BoundedDeferred>>> = Arc::new(Mutex::new(None));
        let watched = Arc::clone(&pending);
        store
            .subscribe(Arc::new(move |action: Action, _origin: Origin| {
                let watched = Arc::clone(&watched);
                async move {
                    // Any answer unblocks the wait, even one without a session
                    if action.kind == SET_USER {
                        if let Some(deferred) = watched.lock().ok().and_then(|slot| slot.clone()) {
                            deferred.resolve();
                        }
                    }
                }
                .boxed()
            }))
            .await;

        Self {
            store,
            provider,
            telemetry,
            config,
            coordination_module: coordination_module.into(),
            phase: RwLock::new(SessionPhase::Uninitialized),
            pending,
        }
    }

    pub async fn phase(&self) -> SessionPhase {
        *self.phase.read().await
    }

    /// Current session state
    pub async fn session(&self) -> SessionState {
        self.store
            .read::<AuthModule, _>(AUTH_MODULE, |m| m.session().clone())
            .await
            .unwrap_or_default()
    }

    async fn is_leader(&self) -> bool {
        is_leader(&self.store, &self.coordination_module).await
    }

    /// Startup: resume a redirect if one is pending, otherwise (as a
    /// non-leader) wait a bounded time for the leader's session. Always ends
    /// in `Ready`.
    pub async fn init_store(&self) {
        *self.phase.write().await = SessionPhase::AwaitingLeaderOrLocal;

        // Armed before the request goes out so an early answer is not missed
        let pending = if self.is_leader().await {
            None
        } else {
            let deferred = BoundedDeferred::new(self.config.leader_answer_timeout);
            if let Ok(mut slot) = self.pending.lock() {
                *slot = Some(deferred.clone());
            }
            Some(deferred)
        };

        if let Err(e) = self.store.dispatch("auth/initStore", Value::Null).await {
            self.report("initStore", &e);
        }

        match self.provider.complete_redirect_if_pending().await {
            Ok(Some(result)) => {
                tracing::info!("Resumed session for account {}", result.account_id);
                self.apply_result(result).await;
            }
            Ok(None) => {
                if let Some(deferred) = &pending {
                    match deferred.wait().await {
                        Ok(Settlement::Resolved) => tracing::debug!("Leader answered session request"),
                        Ok(_) => tracing::debug!("No session answer within {:?}", self.config.leader_answer_timeout),
                        Err(e) => self.report("initStore", &e),
                    }
                }
            }
            Err(e) => self.report("initStore", &e),
        }

        if let Ok(mut slot) = self.pending.lock() {
            slot.take();
        }
        *self.phase.write().await = SessionPhase::Ready;

        let session = self.session().await;
        tracing::info!("Session ready (authenticated ids: {})", session.is_complete());
    }

    /// Apply a completed login or redirect as this instance's own session
    async fn apply_result(&self, result: SessionResult) {
        if let Err(e) = self.store_result(result).await {
            self.report("applySession", &e);
        }
    }

    async fn store_result(&self, result: SessionResult) -> Result<()> {
        let ids = UserIds::new(result.account_id, result.session_id);
        self.store.dispatch(SET_USER, serde_json::to_value(&ids)?).await?;
        self.store
            .dispatch("auth/__setIdentity", serde_json::to_value(&result.identity)?)
            .await
    }

    /// Whether a usable session exists. May run an interactive login with
    /// the session id as hint when the account or identity is missing.
    pub async fn is_authenticated(&self) -> bool {
        match self.check_authenticated().await {
            Ok(authenticated) => authenticated,
            Err(e) => {
                self.report("isAuthenticated", &e);
                false
            }
        }
    }

    async fn check_authenticated(&self) -> Result<bool> {
        let session = self.session().await;
        let (Some(account_id), Some(session_id)) = (&session.account_id, &session.session_id) else {
            return Ok(false);
        };

        let now = Utc::now();
        let fresh = |identity: &Identity| !identity.is_expired_at(now);

        let account = self.provider.get_account_by_id(account_id).await?;
        if account.is_none() || !session.identity.as_ref().is_some_and(fresh) {
            tracing::debug!("Session {} needs a login to refresh its identity", session_id);
            if let Some(result) = self.provider.begin_interactive_login(Some(session_id)).await? {
                self.apply_result(result).await;
            }
        }

        Ok(self.session().await.identity.as_ref().is_some_and(fresh))
    }

    /// Access token for the configured API scopes, if one can be had silently
    pub async fn get_access_token(&self) -> Option<String> {
        match self.acquire_token().await {
            Ok(token) => token,
            Err(e) => {
                self.report("getAccessToken", &e);
                None
            }
        }
    }

    async fn acquire_token(&self) -> Result<Option<String>> {
        let session = self.session().await;
        let (Some(account_id), Some(_)) = (&session.account_id, &session.session_id) else {
            return Ok(None);
        };
        let Some(account) = self.provider.get_account_by_id(account_id).await? else {
            return Ok(None);
        };

        match self.provider.acquire_access_token(&account, &self.config.api_scopes).await? {
            TokenResponse::Token(token) => Ok(Some(token)),
            TokenResponse::RedirectNeeded => {
                tracing::debug!("Token for {} needs an interactive redirect", account_id);
                Ok(None)
            }
        }
    }

    /// Interactive login
    pub async fn login(&self) {
        match self.provider.begin_interactive_login(None).await {
            Ok(Some(result)) => {
                tracing::info!("Logged in as account {}", result.account_id);
                self.track("login", Some(&result.account_id));
                self.apply_result(result).await;
            }
            Ok(None) => tracing::debug!("Login continues through a redirect"),
            Err(e) => self.report("login", &e),
        }
    }

    /// Sign out and clear the session here and in every other instance
    pub async fn logout(&self) {
        let account_id = self.session().await.account_id;
        if let Err(e) = self.provider.sign_out(account_id.as_deref()).await {
            self.report("logout", &e);
        }
        if let Err(e) = self.store.dispatch("auth/reset", Value::Null).await {
            self.report("logout", &e);
        }
        self.track("logout", account_id.as_deref());
        tracing::info!("Logged out");
    }

    fn report(&self, context: &str, error: &crate::error::Error) {
        if error.is_identity() {
            tracing::warn!("Identity provider failed during {}: {}", context, error);
        } else {
            tracing::warn!("Session {} failed: {}", context, error);
        }
        self.telemetry.track_exception(context, error);
    }

    fn track(&self, name: &str, account_id: Option<&str>) {
        let mut properties = BTreeMap::new();
        if let Some(account_id) = account_id {
            properties.insert("accountId".to_string(), account_id.to_string());
        }
        self.telemetry.track_event(name, &properties);
    }
}

#[async_trait]
impl AccessTokenSource for SessionSync {
    async fn access_token(&self) -> Option<String> {
        self.get_access_token().await
    }
}

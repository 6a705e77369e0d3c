//! Auth Module
//!
//! Session state for the signed-in user. Only the internal setters are
//! eligible for replication: `__setUser` shares the account and session
//! ids, `reset` shares a logout. The identity itself stays per instance.

use std::any::Any;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{ModuleDefinition, Origin, StateModule};
use crate::error::{Error, Result};
use crate::identity::Identity;

/// Name of the auth module
pub const AUTH_MODULE: &str = "auth";

/// Session state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub account_id: Option<String>,
    pub session_id: Option<String>,
    pub identity: Option<Identity>,
}

impl SessionState {
    /// A session is complete when both ids are known
    pub fn is_complete(&self) -> bool {
        self.account_id.is_some() && self.session_id.is_some()
    }

    /// The account and session ids
    pub fn ids(&self) -> UserIds {
        UserIds {
            account_id: self.account_id.clone(),
            session_id: self.session_id.clone(),
        }
    }
}

/// Payload of `__setUser`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIds {
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl UserIds {
    /// Ids for a known session
    pub fn new(account_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            account_id: Some(account_id.into()),
            session_id: Some(session_id.into()),
        }
    }

    /// True when the sender had no session to share
    pub fn is_empty(&self) -> bool {
        self.account_id.is_none() && self.session_id.is_none()
    }
}

/// How the current session ids were obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSource {
    /// Login or redirect completed in this instance
    Local,
    /// Received from another instance
    Replicated,
}

/// The auth state module
pub struct AuthModule {
    definition: ModuleDefinition,
    session: SessionState,
    source: Option<SessionSource>,
}

impl AuthModule {
    pub fn new() -> Self {
        Self {
            definition: ModuleDefinition::new(AUTH_MODULE)
                .with_actions(&["initStore", "getUser", "__setUser", "__setIdentity"])
                .with_mutations(&["reset"])
                .shareable(&["__setUser", "reset"]),
            session: SessionState::default(),
            source: None,
        }
    }

    /// Current session
    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Where the current ids came from
    pub fn source(&self) -> Option<SessionSource> {
        self.source
    }

    fn set_user(&mut self, ids: UserIds, origin: Origin) {
        if ids.is_empty() {
            return;
        }

        // A session this instance established itself is never replaced by
        // a remote answer; replicated sessions follow the latest answer.
        if origin.is_replay()
            && self.session.is_complete()
            && self.source == Some(SessionSource::Local)
        {
            tracing::debug!("Ignoring replicated user, local session already established");
            return;
        }

        if ids == self.session.ids() {
            // Re-establishing a replicated session locally makes it ours
            if origin == Origin::Local {
                self.source = Some(SessionSource::Local);
            }
            return;
        }

        self.session.account_id = ids.account_id;
        self.session.session_id = ids.session_id;
        self.source = Some(match origin {
            Origin::Local => SessionSource::Local,
            Origin::Replay => SessionSource::Replicated,
        });
    }

    fn reset(&mut self) {
        self.session = SessionState::default();
        self.source = None;
    }

    fn parse<T: serde::de::DeserializeOwned>(operation: &str, payload: &Value) -> Result<T> {
        serde_json::from_value(payload.clone()).map_err(|e| Error::InvalidPayload {
            operation: operation.to_string(),
            reason: e.to_string(),
        })
    }
}

impl Default for AuthModule {
    fn default() -> Self {
        Self::new()
    }
}

impl StateModule for AuthModule {
    fn definition(&self) -> &ModuleDefinition {
        &self.definition
    }

    fn apply(&mut self, operation: &str, payload: &Value, origin: Origin) -> Result<()> {
        match operation {
            // Markers handled by the auth channel
            "initStore" | "getUser" => {}
            "__setUser" => {
                let ids: UserIds = Self::parse(operation, payload)?;
                self.set_user(ids, origin);
            }
            "__setIdentity" => {
                let identity: Option<Identity> = Self::parse(operation, payload)?;
                if identity != self.session.identity {
                    self.session.identity = identity;
                }
            }
            "reset" => self.reset(),
            other => {
                return Err(Error::UnknownOperation {
                    module: AUTH_MODULE.to_string(),
                    operation: other.to_string(),
                })
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> Value {
        serde_json::to_value(&self.session).unwrap_or_else(|_| json!({}))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(account: &str, session: &str) -> Value {
        serde_json::to_value(UserIds::new(account, session)).unwrap()
    }

    #[test]
    fn test_eligible_operations() {
        let module = AuthModule::new();
        let eligible = module.definition().qualified_broadcast_actions();
        assert!(eligible.contains("auth/__setUser"));
        assert!(eligible.contains("auth/reset"));
        assert!(!eligible.contains("auth/initStore"));
        assert!(!eligible.contains("auth/__setIdentity"));
        assert_eq!(eligible.len(), 2);
    }

    #[test]
    fn test_set_user_and_reset() {
        let mut module = AuthModule::new();
        module.apply("__setUser", &ids("u1", "s1"), Origin::Local).unwrap();
        assert!(module.session().is_complete());
        assert_eq!(module.source(), Some(SessionSource::Local));

        module.apply("reset", &Value::Null, Origin::Replay).unwrap();
        assert_eq!(module.session(), &SessionState::default());
        assert_eq!(module.source(), None);
    }

    #[test]
    fn test_replay_never_overwrites_local_session() {
        let mut module = AuthModule::new();
        module.apply("__setUser", &ids("u1", "s1"), Origin::Local).unwrap();
        module.apply("__setUser", &ids("u2", "s2"), Origin::Replay).unwrap();
        assert_eq!(module.session().ids(), UserIds::new("u1", "s1"));
    }

    #[test]
    fn test_replay_overwrites_replicated_session() {
        let mut module = AuthModule::new();
        module.apply("__setUser", &ids("u1", "s1"), Origin::Replay).unwrap();
        module.apply("__setUser", &ids("u1", "s2"), Origin::Replay).unwrap();
        assert_eq!(module.session().ids(), UserIds::new("u1", "s2"));
        assert_eq!(module.source(), Some(SessionSource::Replicated));
    }

    #[test]
    fn test_local_login_claims_replicated_session() {
        let mut module = AuthModule::new();
        module.apply("__setUser", &ids("u1", "s1"), Origin::Replay).unwrap();
        module.apply("__setUser", &ids("u1", "s1"), Origin::Local).unwrap();
        assert_eq!(module.source(), Some(SessionSource::Local));

        module.apply("__setUser", &ids("u2", "s2"), Origin::Replay).unwrap();
        assert_eq!(module.session().ids(), UserIds::new("u1", "s1"));
        assert_eq!(module.source(), Some(SessionSource::Local));
    }

    #[test]
    fn test_empty_answer_changes_nothing() {
        let mut module = AuthModule::new();
        let empty = serde_json::json!({"accountId": null, "sessionId": null});
        module.apply("__setUser", &empty, Origin::Replay).unwrap();
        assert!(!module.session().is_complete());
        assert_eq!(module.source(), None);
    }

    #[test]
    fn test_identity_is_set_and_cleared() {
        let mut module = AuthModule::new();
        let identity = serde_json::json!({"scopes": ["user.read"], "idToken": "t", "claims": {}});
        module.apply("__setIdentity", &identity, Origin::Local).unwrap();
        assert!(module.session().identity.is_some());

        module.apply("__setIdentity", &Value::Null, Origin::Local).unwrap();
        assert!(module.session().identity.is_none());
    }

    #[test]
    fn test_bad_payload() {
        let mut module = AuthModule::new();
        let result = module.apply("__setUser", &serde_json::json!("u1"), Origin::Local);
        assert!(matches!(result, Err(Error::InvalidPayload { .. })));
    }
}

//! Auth Module Channel
//!
//! Adds a two-message exchange on top of plain replication:
//!
//! - `auth/getUser` (broadcast): a non-leader starting up without a
//!   session asks for one.
//! - `auth/__setUser` (targeted): the leader answers with the account and
//!   session ids it holds.
//!
//! Login and logout themselves never cross instances; each instance talks
//! to the identity provider on its own and only the resulting ids travel.

use async_trait::async_trait;
use serde_json::Value;

use super::{forward_outgoing, replay_incoming, ChannelCore, ChannelKind, ModuleChannel};
use crate::error::Result;
use crate::store::{is_leader, AuthModule, Origin, Store, UserIds, AUTH_MODULE};
use crate::transport::{Action, Envelope};

const INIT_STORE: &str = "initStore";
const GET_USER: &str = "getUser";
const SET_USER: &str = "__setUser";

/// Channel for the auth module
pub struct AuthChannel {
    core: ChannelCore,
}

impl AuthChannel {
    pub fn new(core: ChannelCore) -> Self {
        Self { core }
    }

    async fn is_leader(&self, store: &Store) -> bool {
        is_leader(store, &self.core.context().coordination_module).await
    }

    async fn local_ids(&self, store: &Store) -> UserIds {
        store
            .read::<AuthModule, _>(AUTH_MODULE, |m| m.session().ids())
            .await
            .unwrap_or_default()
    }

    /// Startup hook: non-leaders without a session ask the leader
    async fn process_init(&self, store: &Store) -> Result<()> {
        if self.is_leader(store).await {
            tracing::debug!("Auth channel: this instance is leader, nothing to request");
            return Ok(());
        }
        self.request_user_info(store).await
    }

    async fn request_user_info(&self, store: &Store) -> Result<()> {
        let ids = self.local_ids(store).await;
        if ids.account_id.is_some() && ids.session_id.is_some() {
            return Ok(());
        }

        tracing::debug!("Auth channel: not leader, requesting session from leader");
        self.core.post(&Envelope::broadcast(
            self.core.instance_id().clone(),
            Action::qualified(AUTH_MODULE, GET_USER, Value::Null),
        ))
    }

    /// Leader side of the exchange: answer the requester directly
    async fn answer_user_request(&self, store: &Store, request: &Envelope) -> Result<()> {
        let ids = self.local_ids(store).await;
        tracing::debug!(
            "Auth channel: answering session request from {} (has session: {})",
            request.from,
            !ids.is_empty()
        );

        self.core.post(&Envelope::targeted(
            self.core.instance_id().clone(),
            request.from.clone(),
            Action::qualified(AUTH_MODULE, SET_USER, serde_json::to_value(ids)?),
        ))
    }
}

#[async_trait]
impl ModuleChannel for AuthChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Auth
    }

    async fn process_outgoing(&self, store: &Store, action: &Action, origin: Origin) -> Result<()> {
        if action.operation() == Some(INIT_STORE) {
            if !origin.is_replay() {
                self.process_init(store).await?;
            }
            return Ok(());
        }

        forward_outgoing(&self.core, action, origin)?;
        Ok(())
    }

    async fn process_incoming(&self, store: &Store, envelope: Envelope) -> Result<()> {
        if envelope.value.operation() == Some(GET_USER) && self.is_leader(store).await {
            self.answer_user_request(store, &envelope).await?;
        }

        replay_incoming(&self.core, store, envelope).await?;
        Ok(())
    }
}

//! Module Channels
//!
//! A module channel wraps a broadcast handle for one shareable state
//! module. It knows which qualified operations may cross instances and
//! remembers the last message it sent or received, so a replayed
//! operation is never posted back and a repeated one is applied once.

mod auth;
mod default;

pub use auth::AuthChannel;
pub use default::DefaultChannel;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use async_trait::async_trait;

use crate::error::Result;
use crate::id::InstanceId;
use crate::store::{Origin, Store, AUTH_MODULE};
use crate::transport::{Action, ChannelHandle, Envelope, Listener, ListenerId};

/// Channel variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Plain replication
    Default,
    /// Replication plus the leader request/response exchange
    Auth,
}

/// What a channel needs to know about its instance
#[derive(Debug, Clone)]
pub struct ChannelContext {
    /// This instance's id
    pub instance_id: InstanceId,
    /// Name of the coordination module holding the leadership flag
    pub coordination_module: String,
}

/// State shared by every channel variant
pub struct ChannelCore {
    name: String,
    handle: Arc<dyn ChannelHandle>,
    /// Qualified names of broadcast-eligible operations
    action_names: BTreeSet<String>,
    /// Canonical form of the last message sent or received
    last_message: Mutex<Option<String>>,
    context: ChannelContext,
}

impl ChannelCore {
    /// Create the shared channel state
    pub fn new(
        name: impl Into<String>,
        handle: Arc<dyn ChannelHandle>,
        action_names: BTreeSet<String>,
        context: ChannelContext,
    ) -> Self {
        Self {
            name: name.into(),
            handle,
            action_names,
            last_message: Mutex::new(None),
            context,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.context.instance_id
    }

    pub fn context(&self) -> &ChannelContext {
        &self.context
    }

    /// Check whether a qualified operation is broadcast-eligible here
    pub fn has_action(&self, qualified: &str) -> bool {
        self.action_names.contains(qualified)
    }

    /// The broadcast-eligible qualified operation names
    pub fn action_names(&self) -> &BTreeSet<String> {
        &self.action_names
    }

    /// Check whether `action` equals the last recorded message
    pub fn is_duplicate_of_last(&self, action: &Action) -> bool {
        let Ok(canonical) = action.canonical() else {
            return false;
        };
        self.last_message
            .lock()
            .map(|last| last.as_deref() == Some(canonical.as_str()))
            .unwrap_or(false)
    }

    /// Overwrite the last recorded message
    pub fn record_last(&self, action: &Action) {
        if let (Ok(canonical), Ok(mut last)) = (action.canonical(), self.last_message.lock()) {
            *last = Some(canonical);
        }
    }

    /// Record `action` unless it duplicates the last message.
    /// Returns true if it was new.
    pub fn record_if_new(&self, action: &Action) -> bool {
        let Ok(canonical) = action.canonical() else {
            return false;
        };
        match self.last_message.lock() {
            Ok(mut last) => {
                if last.as_deref() == Some(canonical.as_str()) {
                    false
                } else {
                    *last = Some(canonical);
                    true
                }
            }
            Err(_) => false,
        }
    }

    /// The last recorded message, serialized
    pub fn last_message(&self) -> Option<String> {
        self.last_message.lock().ok().and_then(|last| last.clone())
    }

    /// Post an envelope on the underlying handle
    pub fn post(&self, envelope: &Envelope) -> Result<()> {
        self.handle.post_message(envelope)
    }

    pub fn handle(&self) -> &Arc<dyn ChannelHandle> {
        &self.handle
    }
}

/// A replication channel for one state module
#[async_trait]
pub trait ModuleChannel: Send + Sync {
    /// Shared channel state
    fn core(&self) -> &ChannelCore;

    /// Which variant this is
    fn kind(&self) -> ChannelKind;

    /// Handle a local operation; posts it if it should be replicated
    async fn process_outgoing(&self, store: &Store, action: &Action, origin: Origin) -> Result<()>;

    /// Handle an envelope received from another instance
    async fn process_incoming(&self, store: &Store, envelope: Envelope) -> Result<()>;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn has_action(&self, qualified: &str) -> bool {
        self.core().has_action(qualified)
    }

    fn is_duplicate_of_last(&self, action: &Action) -> bool {
        self.core().is_duplicate_of_last(action)
    }

    fn record_last(&self, action: &Action) {
        self.core().record_last(action)
    }

    fn add_listener(&self, listener: Listener) -> ListenerId {
        self.core().handle().add_listener(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.core().handle().remove_listener(id)
    }

    fn close(&self) {
        self.core().handle().close()
    }
}

/// Variant used for a module name
pub fn channel_kind(module_name: &str) -> ChannelKind {
    match module_name {
        AUTH_MODULE => ChannelKind::Auth,
        _ => ChannelKind::Default,
    }
}

/// Build the channel variant for a module
pub fn create_channel(
    module_name: &str,
    handle: Arc<dyn ChannelHandle>,
    action_names: BTreeSet<String>,
    context: ChannelContext,
) -> Arc<dyn ModuleChannel> {
    let core = ChannelCore::new(module_name, handle, action_names, context);
    match channel_kind(module_name) {
        ChannelKind::Auth => Arc::new(AuthChannel::new(core)),
        ChannelKind::Default => Arc::new(DefaultChannel::new(core)),
    }
}

/// Post a local, eligible, non-duplicate operation as a broadcast.
/// Returns true if something was posted.
pub(crate) fn forward_outgoing(core: &ChannelCore, action: &Action, origin: Origin) -> Result<bool> {
    if origin.is_replay() || !core.has_action(&action.kind) {
        return Ok(false);
    }

    if !core.record_if_new(action) {
        tracing::trace!("Channel {}: suppressing duplicate {}", core.name(), action.kind);
        return Ok(false);
    }

    core.post(&Envelope::broadcast(core.instance_id().clone(), action.clone()))?;
    tracing::debug!("Channel {}: posted {}", core.name(), action.kind);
    Ok(true)
}

/// Replay an eligible, non-duplicate envelope addressed to this instance.
/// Returns true if it was applied.
pub(crate) async fn replay_incoming(core: &ChannelCore, store: &Store, envelope: Envelope) -> Result<bool> {
    if !envelope.is_for(core.instance_id()) {
        return Ok(false);
    }

    if !core.has_action(&envelope.value.kind) {
        return Ok(false);
    }

    if !core.record_if_new(&envelope.value) {
        tracing::trace!("Channel {}: dropping duplicate {}", core.name(), envelope.value.kind);
        return Ok(false);
    }

    tracing::debug!(
        "Channel {}: replaying {} from {}",
        core.name(),
        envelope.value.kind,
        envelope.from
    );
    store.replay(envelope.value).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{BroadcastTransport, MemoryHub};
    use serde_json::json;

    fn context() -> ChannelContext {
        ChannelContext {
            instance_id: InstanceId::from_raw("a"),
            coordination_module: "broadcast".into(),
        }
    }

    #[test]
    fn test_factory_mapping() {
        assert_eq!(channel_kind(AUTH_MODULE), ChannelKind::Auth);
        assert_eq!(channel_kind("orders"), ChannelKind::Default);
        assert_eq!(channel_kind(""), ChannelKind::Default);
    }

    #[tokio::test]
    async fn test_factory_builds_variants() {
        let hub = MemoryHub::new();
        let auth = create_channel(AUTH_MODULE, hub.open(AUTH_MODULE).unwrap(), BTreeSet::new(), context());
        let orders = create_channel("orders", hub.open("orders").unwrap(), BTreeSet::new(), context());
        assert_eq!(auth.kind(), ChannelKind::Auth);
        assert_eq!(orders.kind(), ChannelKind::Default);
        assert_eq!(orders.name(), "orders");
    }

    #[tokio::test]
    async fn test_duplicate_cache() {
        let hub = MemoryHub::new();
        let core = ChannelCore::new("orders", hub.open("orders").unwrap(), BTreeSet::new(), context());
        let first = Action::new("orders/add", json!({"id": 1}));
        let second = Action::new("orders/add", json!({"id": 2}));

        assert!(core.last_message().is_none());
        assert!(!core.is_duplicate_of_last(&first));

        core.record_last(&first);
        assert!(core.is_duplicate_of_last(&first));
        assert!(!core.is_duplicate_of_last(&second));

        assert!(!core.record_if_new(&first));
        assert!(core.record_if_new(&second));
        assert!(core.is_duplicate_of_last(&second));
        assert!(!core.is_duplicate_of_last(&first));
    }
}

//! Broadcast Transport
//!
//! The publish/subscribe primitive shared by all same-origin instances.
//! A transport opens named channels; every envelope posted on a handle is
//! delivered to every other handle open on the same name, never back to
//! the sender. Delivery is at-least-once and ordered per handle only.

mod memory;

pub use memory::{MemoryChannel, MemoryHub};

use std::sync::Arc;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::id::InstanceId;

/// A qualified operation and its payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Fully qualified operation name: `<module>/<operation>`
    #[serde(rename = "type")]
    pub kind: String,
    /// Operation payload
    #[serde(default)]
    pub payload: Value,
}

impl Action {
    /// Create a new action
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Build an action from module and operation names
    pub fn qualified(module: &str, operation: &str, payload: Value) -> Self {
        Self::new(format!("{}/{}", module, operation), payload)
    }

    /// Owning module name (the part before the first `/`)
    pub fn module(&self) -> &str {
        self.kind.split('/').next().unwrap_or("")
    }

    /// Operation name (the part after the first `/`), if qualified
    pub fn operation(&self) -> Option<&str> {
        self.kind.split_once('/').map(|(_, op)| op)
    }

    /// Canonical serialized form, used for duplicate detection
    pub fn canonical(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Message envelope posted on a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending instance
    pub from: InstanceId,
    /// Target instance; `None` means broadcast to everyone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<InstanceId>,
    /// The carried action
    pub value: Action,
}

impl Envelope {
    /// Broadcast envelope
    pub fn broadcast(from: InstanceId, value: Action) -> Self {
        Self {
            from,
            to: None,
            value,
        }
    }

    /// Envelope addressed to a single instance
    pub fn targeted(from: InstanceId, to: InstanceId, value: Action) -> Self {
        Self {
            from,
            to: Some(to),
            value,
        }
    }

    /// Check whether this envelope should be handled by `instance`
    pub fn is_for(&self, instance: &InstanceId) -> bool {
        match &self.to {
            Some(target) => target == instance,
            None => true,
        }
    }
}

/// Identifier returned by `add_listener`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(pub u64);

/// Message listener callback
pub type Listener = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// An open channel on the broadcast medium
pub trait ChannelHandle: Send + Sync {
    /// Channel name
    fn name(&self) -> &str;

    /// Post an envelope to every other handle open on this name
    fn post_message(&self, envelope: &Envelope) -> Result<()>;

    /// Attach a listener; listeners run in attachment order
    fn add_listener(&self, listener: Listener) -> ListenerId;

    /// Detach a listener. Returns false if it was not attached.
    fn remove_listener(&self, id: ListenerId) -> bool;

    /// Close the handle; further posts fail and no more messages arrive
    fn close(&self);

    /// Check whether the handle has been closed
    fn is_closed(&self) -> bool;
}

/// Something that can open named channels
pub trait BroadcastTransport: Send + Sync {
    /// Open a channel by name
    fn open(&self, name: &str) -> Result<Arc<dyn ChannelHandle>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_names() {
        let action = Action::new("auth/__setUser", json!({"accountId": "u1"}));
        assert_eq!(action.module(), "auth");
        assert_eq!(action.operation(), Some("__setUser"));

        let bare = Action::new("orphan", Value::Null);
        assert_eq!(bare.module(), "orphan");
        assert_eq!(bare.operation(), None);
    }

    #[test]
    fn test_envelope_wire_format() {
        let envelope = Envelope::broadcast(
            InstanceId::from_raw("a"),
            Action::qualified("auth", "getUser", Value::Null),
        );
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            wire,
            json!({"from": "a", "value": {"type": "auth/getUser", "payload": null}})
        );

        let targeted: Envelope = serde_json::from_value(json!({
            "from": "a",
            "to": "b",
            "value": {"type": "auth/__setUser", "payload": {"accountId": "u1"}}
        }))
        .unwrap();
        assert!(targeted.is_for(&InstanceId::from_raw("b")));
        assert!(!targeted.is_for(&InstanceId::from_raw("c")));
    }

    #[test]
    fn test_canonical_form_ignores_key_order() {
        let a = Action::new("m/op", json!({"x": 1, "y": 2}));
        let b = Action::new("m/op", serde_json::from_str(r#"{"y": 2, "x": 1}"#).unwrap());
        assert_eq!(a.canonical().unwrap(), b.canonical().unwrap());
    }
}

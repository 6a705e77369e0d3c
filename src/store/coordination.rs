//! Coordination Module
//!
//! Process-wide state owned by the coordination bus: this instance's id
//! and whether it currently holds leadership. Leadership is local
//! knowledge; the module is never shareable.

use std::any::Any;
use serde_json::{json, Value};

use super::{ModuleDefinition, Origin, StateModule, Store};
use crate::error::{Error, Result};
use crate::id::InstanceId;

/// Operations owned by the coordination module (never re-broadcast)
pub const COORDINATION_OPERATIONS: &[&str] = &["setLeader"];

/// Coordination state: instance id and leadership flag
pub struct CoordinationModule {
    definition: ModuleDefinition,
    uid: InstanceId,
    is_leader: bool,
}

impl CoordinationModule {
    /// Create the module for an instance
    pub fn new(name: impl Into<String>, uid: InstanceId) -> Self {
        Self {
            definition: ModuleDefinition::new(name)
                .with_mutations(&["set_leader"])
                .with_actions(COORDINATION_OPERATIONS),
            uid,
            is_leader: false,
        }
    }

    /// This instance's id
    pub fn uid(&self) -> &InstanceId {
        &self.uid
    }

    /// Whether this instance is leader
    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    /// Check whether an unqualified operation belongs to the coordination set
    pub fn owns_operation(operation: &str) -> bool {
        COORDINATION_OPERATIONS.contains(&operation)
    }
}

impl StateModule for CoordinationModule {
    fn definition(&self) -> &ModuleDefinition {
        &self.definition
    }

    fn apply(&mut self, operation: &str, payload: &Value, _origin: Origin) -> Result<()> {
        match operation {
            // A missing payload means "became leader"
            "setLeader" | "set_leader" => {
                self.is_leader = match payload {
                    Value::Null => true,
                    Value::Bool(flag) => *flag,
                    other => {
                        return Err(Error::InvalidPayload {
                            operation: operation.to_string(),
                            reason: format!("expected bool, got {}", other),
                        })
                    }
                };
                Ok(())
            }
            other => Err(Error::UnknownOperation {
                module: self.definition.name.clone(),
                operation: other.to_string(),
            }),
        }
    }

    fn snapshot(&self) -> Value {
        json!({ "uid": self.uid, "isLeader": self.is_leader })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Read the leadership flag from the coordination module named `module`.
/// An unregistered module reads as "not leader".
pub async fn is_leader(store: &Store, module: &str) -> bool {
    store
        .read::<CoordinationModule, _>(module, |m| m.is_leader())
        .await
        .unwrap_or(false)
}

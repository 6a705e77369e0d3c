//! Host State Container
//!
//! Holds the registered state modules, applies qualified operations to
//! them, and notifies subscribers after every applied operation. Each
//! dispatch carries an `Origin` so replication can tell local mutations
//! from replays of remote ones.

pub mod auth;
pub mod coordination;

pub use auth::{AuthModule, SessionSource, SessionState, UserIds, AUTH_MODULE};
pub use coordination::{is_leader, CoordinationModule, COORDINATION_OPERATIONS};

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::transport::Action;

/// Where a dispatched operation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Produced by this instance
    Local,
    /// Applied from a message received on a channel
    Replay,
}

impl Origin {
    /// Check whether this is a replay of a remote message
    pub fn is_replay(&self) -> bool {
        matches!(self, Origin::Replay)
    }
}

/// Static declaration of a state module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDefinition {
    /// Module name (the namespace of its operations)
    pub name: String,
    /// Synchronous state mutations
    pub mutations: BTreeSet<String>,
    /// Higher-level actions
    pub actions: BTreeSet<String>,
    /// Whether the module gets a replication channel
    pub shareable: bool,
    /// Operations eligible for cross-instance broadcast
    pub broadcast_actions: BTreeSet<String>,
}

impl ModuleDefinition {
    /// Start a definition for a module
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mutations: BTreeSet::new(),
            actions: BTreeSet::new(),
            shareable: false,
            broadcast_actions: BTreeSet::new(),
        }
    }

    /// Add mutations
    pub fn with_mutations(mut self, names: &[&str]) -> Self {
        self.mutations.extend(names.iter().map(|n| n.to_string()));
        self
    }

    /// Add actions
    pub fn with_actions(mut self, names: &[&str]) -> Self {
        self.actions.extend(names.iter().map(|n| n.to_string()));
        self
    }

    /// Mark the module shareable and declare its broadcast-eligible operations
    pub fn shareable(mut self, broadcast: &[&str]) -> Self {
        self.shareable = true;
        self.broadcast_actions.extend(broadcast.iter().map(|n| n.to_string()));
        self
    }

    /// Check whether an unqualified operation is eligible for broadcast
    pub fn is_broadcast_action(&self, operation: &str) -> bool {
        self.broadcast_actions.contains(operation)
    }

    /// Check whether the module declares this unqualified operation
    pub fn has_operation(&self, operation: &str) -> bool {
        self.mutations.contains(operation) || self.actions.contains(operation)
    }

    /// Qualified names of the broadcast-eligible operations that the module declares
    pub fn qualified_broadcast_actions(&self) -> BTreeSet<String> {
        self.mutations
            .iter()
            .chain(self.actions.iter())
            .filter(|op| self.is_broadcast_action(op))
            .map(|op| format!("{}/{}", self.name, op))
            .collect()
    }
}

/// A state module registered in the store
pub trait StateModule: Send + Sync + 'static {
    /// The module's static declaration
    fn definition(&self) -> &ModuleDefinition;

    /// Apply an unqualified operation to the module state
    fn apply(&mut self, operation: &str, payload: &Value, origin: Origin) -> Result<()>;

    /// Serializable snapshot of the module state
    fn snapshot(&self) -> Value;

    /// Downcast support for typed reads
    fn as_any(&self) -> &dyn Any;
}

/// Callback invoked after every applied operation
pub type Subscriber = Arc<dyn Fn(Action, Origin) -> BoxFuture<'static, ()> + Send + Sync>;

/// Split a qualified name into module and operation
pub fn split_qualified(name: &str) -> Result<(&str, &str)> {
    match name.split_once('/') {
        Some((module, operation)) if !module.is_empty() && !operation.is_empty() => {
            Ok((module, operation))
        }
        _ => Err(Error::InvalidOperationName(name.to_string())),
    }
}

/// The host state container
#[derive(Default)]
pub struct Store {
    /// Registered modules by name
    modules: RwLock<HashMap<String, Box<dyn StateModule>>>,
    /// Module names in registration order
    order: RwLock<Vec<String>>,
    /// Dispatch subscribers
    subscribers: RwLock<Vec<Subscriber>>,
}

impl Store {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module. Returns false (and changes nothing) if a module
    /// with the same name is already registered.
    pub async fn register_module(&self, module: Box<dyn StateModule>) -> bool {
        let name = module.definition().name.clone();
        let mut modules = self.modules.write().await;
        if modules.contains_key(&name) {
            tracing::debug!("Module {} already registered, skipping", name);
            return false;
        }
        modules.insert(name.clone(), module);
        self.order.write().await.push(name.clone());
        tracing::debug!("Registered module {}", name);
        true
    }

    /// Check whether a module is registered
    pub async fn has_module(&self, name: &str) -> bool {
        self.modules.read().await.contains_key(name)
    }

    /// Definition of one module
    pub async fn definition(&self, name: &str) -> Option<ModuleDefinition> {
        self.modules
            .read()
            .await
            .get(name)
            .map(|m| m.definition().clone())
    }

    /// Definitions of every registered module, in registration order
    pub async fn definitions(&self) -> Vec<ModuleDefinition> {
        let order = self.order.read().await.clone();
        let modules = self.modules.read().await;
        order
            .iter()
            .filter_map(|name| modules.get(name).map(|m| m.definition().clone()))
            .collect()
    }

    /// Definitions of the shareable modules, in registration order
    pub async fn shareable_modules(&self) -> Vec<ModuleDefinition> {
        self.definitions()
            .await
            .into_iter()
            .filter(|d| d.shareable)
            .collect()
    }

    /// Add a dispatch subscriber
    pub async fn subscribe(&self, subscriber: Subscriber) {
        self.subscribers.write().await.push(subscriber);
    }

    /// Dispatch a local operation
    pub async fn dispatch(&self, name: &str, payload: Value) -> Result<()> {
        self.dispatch_action(Action::new(name, payload), Origin::Local).await
    }

    /// Apply an operation received from another instance
    pub async fn replay(&self, action: Action) -> Result<()> {
        self.dispatch_action(action, Origin::Replay).await
    }

    /// Apply an action, then notify subscribers in registration order
    pub async fn dispatch_action(&self, action: Action, origin: Origin) -> Result<()> {
        {
            let (module_name, operation) = split_qualified(&action.kind)?;
            let mut modules = self.modules.write().await;
            let module = modules
                .get_mut(module_name)
                .ok_or_else(|| Error::ModuleNotFound(module_name.to_string()))?;
            module.apply(operation, &action.payload, origin)?;
        }

        tracing::trace!("Applied {} ({:?})", action.kind, origin);

        let subscribers = self.subscribers.read().await.clone();
        for subscriber in subscribers {
            subscriber(action.clone(), origin).await;
        }

        Ok(())
    }

    /// Snapshot of every module's state keyed by module name
    pub async fn get_state(&self) -> Value {
        let modules = self.modules.read().await;
        let mut root = Map::new();
        for (name, module) in modules.iter() {
            root.insert(name.clone(), module.snapshot());
        }
        Value::Object(root)
    }

    /// Typed read of one module's state
    pub async fn read<M, R>(&self, name: &str, f: impl FnOnce(&M) -> R) -> Option<R>
    where
        M: StateModule,
    {
        let modules = self.modules.read().await;
        modules
            .get(name)
            .and_then(|m| m.as_any().downcast_ref::<M>())
            .map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::Mutex;

    struct Counter {
        definition: ModuleDefinition,
        value: i64,
    }

    impl Counter {
        fn new(name: &str) -> Self {
            Self {
                definition: ModuleDefinition::new(name)
                    .with_mutations(&["add", "reset"])
                    .shareable(&["add"]),
                value: 0,
            }
        }
    }

    impl StateModule for Counter {
        fn definition(&self) -> &ModuleDefinition {
            &self.definition
        }

        fn apply(&mut self, operation: &str, payload: &Value, _origin: Origin) -> Result<()> {
            match operation {
                "add" => self.value += payload.as_i64().unwrap_or(0),
                "reset" => self.value = 0,
                other => {
                    return Err(Error::UnknownOperation {
                        module: self.definition.name.clone(),
                        operation: other.to_string(),
                    })
                }
            }
            Ok(())
        }

        fn snapshot(&self) -> Value {
            json!({ "value": self.value })
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_split_qualified() {
        assert_eq!(split_qualified("auth/reset").unwrap(), ("auth", "reset"));
        assert!(split_qualified("reset").is_err());
        assert!(split_qualified("/reset").is_err());
        assert!(split_qualified("auth/").is_err());
    }

    #[test]
    fn test_definition_broadcast_predicate() {
        let def = Counter::new("counter").definition;
        assert!(def.shareable);
        assert!(def.is_broadcast_action("add"));
        assert!(!def.is_broadcast_action("reset"));
        assert_eq!(
            def.qualified_broadcast_actions().into_iter().collect::<Vec<_>>(),
            vec!["counter/add".to_string()]
        );
    }

    #[tokio::test]
    async fn test_double_registration_is_noop() {
        let store = Store::new();
        assert!(store.register_module(Box::new(Counter::new("counter"))).await);
        store.dispatch("counter/add", json!(5)).await.unwrap();

        assert!(!store.register_module(Box::new(Counter::new("counter"))).await);
        let value = store.read::<Counter, _>("counter", |c| c.value).await;
        assert_eq!(value, Some(5));
        assert_eq!(store.definitions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_errors() {
        let store = Store::new();
        store.register_module(Box::new(Counter::new("counter"))).await;

        assert!(matches!(
            store.dispatch("missing/add", json!(1)).await,
            Err(Error::ModuleNotFound(_))
        ));
        assert!(matches!(
            store.dispatch("counter/explode", json!(1)).await,
            Err(Error::UnknownOperation { .. })
        ));
        assert!(matches!(
            store.dispatch("counter", json!(1)).await,
            Err(Error::InvalidOperationName(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribers_see_origin() {
        let store = Store::new();
        store.register_module(Box::new(Counter::new("counter"))).await;

        let seen: Arc<Mutex<Vec<(String, Origin)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store
            .subscribe(Arc::new(move |action: Action, origin: Origin| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push((action.kind, origin));
                }
                .boxed()
            }))
            .await;

        store.dispatch("counter/add", json!(1)).await.unwrap();
        store
            .replay(Action::new("counter/add", json!(2)))
            .await
            .unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                ("counter/add".to_string(), Origin::Local),
                ("counter/add".to_string(), Origin::Replay),
            ]
        );
        assert_eq!(store.get_state().await, json!({"counter": {"value": 3}}));
    }

    #[tokio::test]
    async fn test_shareable_modules_in_registration_order() {
        let store = Store::new();
        store.register_module(Box::new(Counter::new("b"))).await;
        store.register_module(Box::new(Counter::new("a"))).await;

        let names: Vec<String> = store
            .shareable_modules()
            .await
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["b".to_string(), "a".to_string()]);
    }
}

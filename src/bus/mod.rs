//! Coordination Bus
//!
//! Connects a `Store` to the broadcast medium. On `init` the bus registers
//! the coordination module, runs the leader election on the main channel,
//! subscribes to every dispatch, and opens one module channel per shareable
//! module. Leadership is local knowledge: it is written to the coordination
//! module and never replicated.

pub mod election;

pub use election::{ElectionConfig, ElectionSignal, ElectionState, LeaderElector};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use crate::channel::{create_channel, ChannelContext, ModuleChannel};
use crate::deferred::{BoundedDeferred, Settlement};
use crate::error::Result;
use crate::id::InstanceId;
use crate::store::{is_leader, CoordinationModule, ModuleDefinition, Origin, StateModule, Store};
use crate::transport::{Action, BroadcastTransport, Envelope, Listener, ListenerId};

/// Bus configuration
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Channel carrying election traffic
    pub main_channel_name: String,
    /// Name of the module holding the leadership flag
    pub coordination_module_name: String,
    /// Run the leader election at all
    pub enable_leader_election: bool,
    /// Upper bound on how long `init` waits for an election outcome
    pub election_wait: Duration,
    /// Election timings
    pub election: ElectionConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            main_channel_name: "tabsync".to_string(),
            coordination_module_name: "broadcast".to_string(),
            enable_leader_election: true,
            election_wait: Duration::from_millis(1000),
            election: ElectionConfig::default(),
        }
    }
}

/// A module channel and the listener attached to it
struct ChannelPair {
    channel: Arc<dyn ModuleChannel>,
    listener: ListenerId,
}

impl ChannelPair {
    fn teardown(self) {
        self.channel.remove_listener(self.listener);
        self.channel.close();
    }
}

type ChannelMap = Arc<RwLock<HashMap<String, ChannelPair>>>;

/// Coordination bus for one instance
pub struct CoordinationBus {
    /// Bus configuration
    config: BusConfig,
    /// This instance's id
    instance_id: InstanceId,
    /// Broadcast medium
    transport: Arc<dyn BroadcastTransport>,
    /// Module name -> channel
    channels: ChannelMap,
    /// Running election, if enabled and the main channel opened
    elector: Mutex<Option<Arc<LeaderElector>>>,
    /// Task mirroring leadership into the store
    watcher: Mutex<Option<JoinHandle<()>>>,
    /// Whether the dispatch subscriber is installed
    subscribed: AtomicBool,
}

impl CoordinationBus {
    /// Create a bus with a fresh instance id
    pub fn new(config: BusConfig, transport: Arc<dyn BroadcastTransport>) -> Self {
        Self::with_instance_id(config, transport, InstanceId::generate())
    }

    /// Create a bus with a given instance id
    pub fn with_instance_id(
        config: BusConfig,
        transport: Arc<dyn BroadcastTransport>,
        instance_id: InstanceId,
    ) -> Self {
        Self {
            config,
            instance_id,
            transport,
            channels: Arc::new(RwLock::new(HashMap::new())),
            elector: Mutex::new(None),
            watcher: Mutex::new(None),
            subscribed: AtomicBool::new(false),
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    fn context(&self) -> ChannelContext {
        ChannelContext {
            instance_id: self.instance_id.clone(),
            coordination_module: self.config.coordination_module_name.clone(),
        }
    }

    /// Wire the store to the broadcast medium. Completes once the election
    /// has produced a leader or the election wait has elapsed.
    pub async fn init(&self, store: &Arc<Store>) -> Result<()> {
        store
            .register_module(Box::new(CoordinationModule::new(
                self.config.coordination_module_name.clone(),
                self.instance_id.clone(),
            )))
            .await;

        if self.config.enable_leader_election {
            self.start_election(store).await;
        }

        self.install_subscriber(store).await;

        for definition in store.shareable_modules().await {
            match self.attach_channel(store, &definition).await {
                Ok(()) => {}
                Err(e) if e.is_channel_failure() => {
                    tracing::warn!("Module {} runs without replication: {}", definition.name, e);
                }
                Err(e) => return Err(e),
            }
        }

        let channel_count = self.channels.read().await.len();
        let leader = self.is_leader(store).await;
        tracing::info!(
            "Coordination bus {} ready ({} channels, leader: {})",
            self.instance_id,
            channel_count,
            leader
        );
        Ok(())
    }

    async fn start_election(&self, store: &Arc<Store>) {
        let main = match self.transport.open(&self.config.main_channel_name) {
            Ok(main) => main,
            Err(e) => {
                tracing::warn!("Main channel unavailable, running as non-leader: {}", e);
                return;
            }
        };

        let elector = LeaderElector::new(self.instance_id.clone(), main, self.config.election.clone());
        elector.start();

        let deferred = BoundedDeferred::new(self.config.election_wait);
        let watcher = spawn_leadership_watcher(
            Arc::downgrade(store),
            self.config.coordination_module_name.clone(),
            elector.leadership(),
            deferred.clone(),
        );

        if let Ok(mut slot) = self.elector.lock() {
            *slot = Some(elector);
        }
        if let Ok(mut slot) = self.watcher.lock() {
            *slot = Some(watcher);
        }

        match deferred.wait().await {
            Ok(Settlement::Resolved) => {
                tracing::debug!("Instance {} elected during startup", self.instance_id);
            }
            Ok(_) => {
                tracing::debug!("No election outcome within {:?}, continuing as non-leader", self.config.election_wait);
            }
            Err(e) => tracing::warn!("Election wait failed: {}", e),
        }
    }

    async fn install_subscriber(&self, store: &Arc<Store>) {
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak_store = Arc::downgrade(store);
        let channels = Arc::clone(&self.channels);
        let coordination = self.config.coordination_module_name.clone();

        store
            .subscribe(Arc::new(move |action: Action, origin: Origin| {
                let weak_store = weak_store.clone();
                let channels = Arc::clone(&channels);
                let coordination = coordination.clone();
                async move {
                    if action.module() == coordination {
                        return;
                    }
                    let Some(store) = weak_store.upgrade() else {
                        return;
                    };
                    let channel = channels
                        .read()
                        .await
                        .get(action.module())
                        .map(|pair| Arc::clone(&pair.channel));
                    if let Some(channel) = channel {
                        if let Err(e) = channel.process_outgoing(&store, &action, origin).await {
                            tracing::warn!("Channel {} failed to forward {}: {}", channel.name(), action.kind, e);
                        }
                    }
                }
                .boxed()
            }))
            .await;
    }

    /// Open the channel for a shareable module, replacing any existing one
    async fn attach_channel(&self, store: &Arc<Store>, definition: &ModuleDefinition) -> Result<()> {
        if let Some(old) = self.channels.write().await.remove(&definition.name) {
            tracing::debug!("Replacing channel for module {}", definition.name);
            old.teardown();
        }

        let handle = self.transport.open(&definition.name)?;
        let channel = create_channel(
            &definition.name,
            handle,
            definition.qualified_broadcast_actions(),
            self.context(),
        );

        let weak_store = Arc::downgrade(store);
        let weak_channel = Arc::downgrade(&channel);
        let listener: Listener = Arc::new(move |envelope: Envelope| {
            let weak_store = weak_store.clone();
            let weak_channel = weak_channel.clone();
            async move {
                let (Some(store), Some(channel)) = (weak_store.upgrade(), weak_channel.upgrade()) else {
                    return;
                };
                if let Err(e) = channel.process_incoming(&store, envelope).await {
                    tracing::warn!("Channel {} failed to apply message: {}", channel.name(), e);
                }
            }
            .boxed()
        });
        let listener = channel.add_listener(listener);

        tracing::debug!("Opened channel for module {}", definition.name);
        self.channels
            .write()
            .await
            .insert(definition.name.clone(), ChannelPair { channel, listener });
        Ok(())
    }

    /// Register a module after `init`. If it is shareable its channel is
    /// opened too; a channel failure is returned but the module stays
    /// registered and keeps working locally.
    pub async fn register_module(&self, store: &Arc<Store>, module: Box<dyn StateModule>) -> Result<bool> {
        let definition = module.definition().clone();
        if !store.register_module(module).await {
            return Ok(false);
        }
        if definition.shareable {
            self.attach_channel(store, &definition).await?;
        }
        Ok(true)
    }

    /// Check whether this instance is leader
    pub async fn is_leader(&self, store: &Store) -> bool {
        is_leader(store, &self.config.coordination_module_name).await
    }

    /// Leadership changes, if the election is running
    pub fn leadership(&self) -> Option<watch::Receiver<bool>> {
        self.elector
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|e| e.leadership()))
    }

    /// Names of the modules with an open channel
    pub async fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Leave the election and close every channel
    pub async fn shutdown(&self) {
        let elector = self.elector.lock().ok().and_then(|mut slot| slot.take());
        if let Some(elector) = elector {
            elector.die().await;
        }
        if let Some(watcher) = self.watcher.lock().ok().and_then(|mut slot| slot.take()) {
            watcher.abort();
        }

        let pairs: Vec<ChannelPair> = self.channels.write().await.drain().map(|(_, pair)| pair).collect();
        for pair in pairs {
            pair.teardown();
        }

        tracing::info!("Coordination bus {} shut down", self.instance_id);
    }
}

/// Mirror leadership changes into the coordination module and settle the
/// startup wait on the first win
fn spawn_leadership_watcher(
    store: Weak<Store>,
    coordination: String,
    mut leadership: watch::Receiver<bool>,
    startup: BoundedDeferred,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let set_leader = format!("{}/setLeader", coordination);
        let mut recorded = false;
        loop {
            let leading = *leadership.borrow_and_update();
            if leading != recorded {
                let Some(store) = store.upgrade() else {
                    break;
                };
                match store.dispatch(&set_leader, Value::Bool(leading)).await {
                    Ok(()) => recorded = leading,
                    Err(e) => tracing::warn!("Failed to record leadership: {}", e),
                }
            }
            if leading {
                startup.resolve();
            }
            if leadership.changed().await.is_err() {
                break;
            }
        }
    })
}

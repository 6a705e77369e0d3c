//! In-Memory Broadcast Hub
//!
//! A same-process stand-in for the browser's same-origin broadcast medium.
//! Each opened handle owns a queue drained by its own pump task, so
//! listeners see messages in posting order and never re-entrantly.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{BroadcastTransport, ChannelHandle, Envelope, Listener, ListenerId};
use crate::error::{Error, Result};

/// Registered endpoint for one open handle
struct Endpoint {
    handle_id: u64,
    tx: mpsc::UnboundedSender<Envelope>,
}

#[derive(Default)]
struct HubInner {
    next_handle: u64,
    /// Channel name -> open endpoints
    endpoints: HashMap<String, Vec<Endpoint>>,
}

/// Shared in-memory broadcast medium
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open handles on a channel name
    pub fn open_handles(&self, name: &str) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.endpoints.get(name).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Open a concrete handle
    pub fn open_channel(&self, name: &str) -> Result<Arc<MemoryChannel>> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| Error::ChannelUnavailable {
            name: name.to_string(),
            reason: format!("no async runtime: {}", e),
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let handle_id = {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| Error::Transport("hub lock poisoned".into()))?;
            inner.next_handle += 1;
            let id = inner.next_handle;
            inner
                .endpoints
                .entry(name.to_string())
                .or_default()
                .push(Endpoint { handle_id: id, tx });
            id
        };

        let listeners: Arc<RwLock<BTreeMap<ListenerId, Listener>>> = Arc::new(RwLock::new(BTreeMap::new()));
        let pump = runtime.spawn(pump(rx, Arc::clone(&listeners)));

        tracing::trace!("Opened channel {} (handle {})", name, handle_id);

        Ok(Arc::new(MemoryChannel {
            name: name.to_string(),
            handle_id,
            hub: Arc::clone(&self.inner),
            listeners,
            next_listener: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            pump: Mutex::new(Some(pump)),
        }))
    }
}

impl BroadcastTransport for MemoryHub {
    fn open(&self, name: &str) -> Result<Arc<dyn ChannelHandle>> {
        let channel: Arc<dyn ChannelHandle> = self.open_channel(name)?;
        Ok(channel)
    }
}

/// Deliver queued envelopes to the current listeners, one at a time
async fn pump(
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    listeners: Arc<RwLock<BTreeMap<ListenerId, Listener>>>,
) {
    while let Some(envelope) = rx.recv().await {
        let current: Vec<Listener> = match listeners.read() {
            Ok(map) => map.values().cloned().collect(),
            Err(_) => break,
        };
        for listener in current {
            listener(envelope.clone()).await;
        }
    }
}

/// A handle opened on a `MemoryHub`
pub struct MemoryChannel {
    name: String,
    handle_id: u64,
    hub: Arc<Mutex<HubInner>>,
    listeners: Arc<RwLock<BTreeMap<ListenerId, Listener>>>,
    next_listener: AtomicU64,
    closed: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelHandle for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn post_message(&self, envelope: &Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed(self.name.clone()));
        }

        let inner = self
            .hub
            .lock()
            .map_err(|_| Error::Transport("hub lock poisoned".into()))?;

        if let Some(endpoints) = inner.endpoints.get(&self.name) {
            for endpoint in endpoints.iter().filter(|e| e.handle_id != self.handle_id) {
                // A receiver that went away is simply skipped
                let _ = endpoint.tx.send(envelope.clone());
            }
        }

        Ok(())
    }

    fn add_listener(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut map) = self.listeners.write() {
            map.insert(id, listener);
        }
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners
            .write()
            .map(|mut map| map.remove(&id).is_some())
            .unwrap_or(false)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Ok(mut inner) = self.hub.lock() {
            let now_empty = match inner.endpoints.get_mut(&self.name) {
                Some(endpoints) => {
                    endpoints.retain(|e| e.handle_id != self.handle_id);
                    endpoints.is_empty()
                }
                None => false,
            };
            if now_empty {
                inner.endpoints.remove(&self.name);
            }
        }

        if let Ok(mut map) = self.listeners.write() {
            map.clear();
        }

        if let Ok(mut pump) = self.pump.lock() {
            if let Some(task) = pump.take() {
                task.abort();
            }
        }

        tracing::trace!("Closed channel {} (handle {})", self.name, self.handle_id);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.close();
    }
}

//! Leader Election
//!
//! Elects one leader among the instances sharing the main channel.
//! A candidate posts `apply`, waits one response window, repeats once,
//! and takes leadership if nobody objected during either window.
//!
//! Objections: any `tell`, or an `apply` from an instance whose id sorts
//! higher. A leader answers every `apply` with `tell`, announces itself with
//! `tell`, and posts `death` when it shuts down so followers re-apply at
//! once instead of waiting for the next fallback round.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use futures::FutureExt;
use rand::Rng;
use serde_json::Value;
use tokio::sync::{watch, Notify, RwLock};
use tokio::task::JoinHandle;

use crate::id::InstanceId;
use crate::transport::{Action, ChannelHandle, Envelope, Listener, ListenerId};

const ELECTION_NAMESPACE: &str = "election";

/// Election state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    /// Following a leader (or nobody)
    Follower,
    /// Running for election
    Candidate,
    /// Won the election
    Leader,
}

/// Election messages on the main channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionSignal {
    /// A candidate asks for leadership
    Apply,
    /// A leader announces itself
    Tell,
    /// A leader is going away
    Death,
}

impl ElectionSignal {
    fn as_str(&self) -> &'static str {
        match self {
            ElectionSignal::Apply => "apply",
            ElectionSignal::Tell => "tell",
            ElectionSignal::Death => "death",
        }
    }

    fn parse(action: &Action) -> Option<Self> {
        if action.module() != ELECTION_NAMESPACE {
            return None;
        }
        match action.operation()? {
            "apply" => Some(ElectionSignal::Apply),
            "tell" => Some(ElectionSignal::Tell),
            "death" => Some(ElectionSignal::Death),
            _ => None,
        }
    }

    fn to_action(self) -> Action {
        Action::qualified(ELECTION_NAMESPACE, self.as_str(), Value::Null)
    }
}

/// Election configuration
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Pause between re-applications while not leader
    pub fallback_interval: Duration,
    /// How long a candidate waits for objections per round
    pub response_time: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            fallback_interval: Duration::from_millis(1000),
            response_time: Duration::from_millis(300),
        }
    }
}

/// Leader elector for one instance
pub struct LeaderElector {
    /// This instance's id
    instance_id: InstanceId,
    /// Main channel
    channel: Arc<dyn ChannelHandle>,
    /// Election configuration
    config: ElectionConfig,
    /// Current state
    state: RwLock<ElectionState>,
    /// Set when another instance objects to the running application
    objection: AtomicBool,
    /// Leadership announcements
    leadership: watch::Sender<bool>,
    /// Wakes the fallback loop after a leader departs
    wakeup: Notify,
    /// Listener attached to the main channel
    listener: Mutex<Option<ListenerId>>,
    /// Fallback loop
    task: Mutex<Option<JoinHandle<()>>>,
    /// Set once the elector is shut down
    dead: AtomicBool,
}

impl LeaderElector {
    /// Create an elector on an open main channel
    pub fn new(instance_id: InstanceId, channel: Arc<dyn ChannelHandle>, config: ElectionConfig) -> Arc<Self> {
        let (leadership, _) = watch::channel(false);
        Arc::new(Self {
            instance_id,
            channel,
            config,
            state: RwLock::new(ElectionState::Follower),
            objection: AtomicBool::new(false),
            leadership,
            wakeup: Notify::new(),
            listener: Mutex::new(None),
            task: Mutex::new(None),
            dead: AtomicBool::new(false),
        })
    }

    /// Attach to the main channel and start applying for leadership
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let listener: Listener = Arc::new(move |envelope: Envelope| {
            let weak = weak.clone();
            async move {
                if let Some(elector) = weak.upgrade() {
                    elector.handle_message(envelope).await;
                }
            }
            .boxed()
        });
        let id = self.channel.add_listener(listener);
        if let Ok(mut slot) = self.listener.lock() {
            *slot = Some(id);
        }

        let elector = Arc::clone(self);
        let task = tokio::spawn(async move { elector.run().await });
        if let Ok(mut slot) = self.task.lock() {
            *slot = Some(task);
        }
    }

    /// Get current state
    pub async fn state(&self) -> ElectionState {
        *self.state.read().await
    }

    /// Check whether this instance currently leads
    pub fn is_leader(&self) -> bool {
        *self.leadership.borrow()
    }

    /// Subscribe to leadership changes
    pub fn leadership(&self) -> watch::Receiver<bool> {
        self.leadership.subscribe()
    }

    /// Resolve once this instance becomes leader
    pub async fn await_leadership(&self) {
        let mut rx = self.leadership.subscribe();
        // The sender lives as long as self, so this only ends on leadership
        let _ = rx.wait_for(|leading| *leading).await;
    }

    /// Fallback loop: keep applying while not leader
    async fn run(self: Arc<Self>) {
        loop {
            if self.dead.load(Ordering::SeqCst) {
                break;
            }

            if !self.is_leader() {
                self.apply_once().await;
            }

            let pause = Self::jittered(self.config.fallback_interval);
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = self.wakeup.notified() => {}
            }
        }
    }

    /// Add up to 20% random jitter so instances started together spread out
    fn jittered(base: Duration) -> Duration {
        let max_extra = (base.as_millis() as u64) / 5;
        if max_extra == 0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0..=max_extra);
        base + Duration::from_millis(extra)
    }

    /// Run one application round. Returns true if this instance leads afterwards.
    pub async fn apply_once(&self) -> bool {
        if self.is_leader() {
            return true;
        }
        if self.dead.load(Ordering::SeqCst) {
            return false;
        }

        {
            let mut state = self.state.write().await;
            if *state == ElectionState::Candidate {
                return false;
            }
            *state = ElectionState::Candidate;
        }
        self.objection.store(false, Ordering::SeqCst);

        tracing::trace!("Instance {} applying for leadership", self.instance_id);

        for _ in 0..2 {
            self.send(ElectionSignal::Apply);
            tokio::time::sleep(self.config.response_time).await;

            if self.objection.load(Ordering::SeqCst) || self.dead.load(Ordering::SeqCst) {
                *self.state.write().await = ElectionState::Follower;
                tracing::trace!("Instance {} lost the application round", self.instance_id);
                return false;
            }
        }

        self.become_leader().await;
        true
    }

    /// Become the leader
    async fn become_leader(&self) {
        *self.state.write().await = ElectionState::Leader;
        self.leadership.send_replace(true);
        self.send(ElectionSignal::Tell);

        tracing::info!("Instance {} won the election, becoming LEADER", self.instance_id);
    }

    /// Step down to follower (saw a leader that outranks us)
    async fn step_down(&self) {
        *self.state.write().await = ElectionState::Follower;
        self.leadership.send_replace(false);

        tracing::info!("Instance {} stepping down to follower", self.instance_id);
    }

    /// React to a message on the main channel
    async fn handle_message(&self, envelope: Envelope) {
        if envelope.from == self.instance_id {
            return;
        }
        let Some(signal) = ElectionSignal::parse(&envelope.value) else {
            return;
        };

        let state = *self.state.read().await;
        match (signal, state) {
            (ElectionSignal::Apply, ElectionState::Leader) => {
                self.send(ElectionSignal::Tell);
            }
            (ElectionSignal::Apply, ElectionState::Candidate) => {
                if envelope.from > self.instance_id {
                    self.objection.store(true, Ordering::SeqCst);
                }
            }
            (ElectionSignal::Tell, ElectionState::Candidate) => {
                self.objection.store(true, Ordering::SeqCst);
            }
            (ElectionSignal::Tell, ElectionState::Leader) => {
                tracing::warn!(
                    "Duplicate leader detected: {} and {}",
                    self.instance_id,
                    envelope.from
                );
                if envelope.from > self.instance_id {
                    self.step_down().await;
                } else {
                    self.send(ElectionSignal::Tell);
                }
            }
            (ElectionSignal::Death, _) => {
                tracing::debug!("Leader {} left, re-applying", envelope.from);
                self.wakeup.notify_one();
            }
            _ => {}
        }
    }

    fn send(&self, signal: ElectionSignal) {
        let envelope = Envelope::broadcast(self.instance_id.clone(), signal.to_action());
        if let Err(e) = self.channel.post_message(&envelope) {
            tracing::warn!("Failed to post election {}: {}", signal.as_str(), e);
        }
    }

    /// Leave the election: announce departure if leading, detach, close
    pub async fn die(&self) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.is_leader() {
            self.send(ElectionSignal::Death);
        }
        *self.state.write().await = ElectionState::Follower;
        self.leadership.send_replace(false);

        if let Some(id) = self.listener.lock().ok().and_then(|mut slot| slot.take()) {
            self.channel.remove_listener(id);
        }
        if let Some(task) = self.task.lock().ok().and_then(|mut slot| slot.take()) {
            task.abort();
        }
        self.channel.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{BroadcastTransport, MemoryHub};

    fn fast_config() -> ElectionConfig {
        ElectionConfig {
            fallback_interval: Duration::from_millis(50),
            response_time: Duration::from_millis(20),
        }
    }

    fn elector(hub: &MemoryHub, id: &str) -> Arc<LeaderElector> {
        LeaderElector::new(InstanceId::from_raw(id), hub.open("main").unwrap(), fast_config())
    }

    #[test]
    fn test_signal_names() {
        for signal in [ElectionSignal::Apply, ElectionSignal::Tell, ElectionSignal::Death] {
            assert_eq!(ElectionSignal::parse(&signal.to_action()), Some(signal));
        }
        assert_eq!(ElectionSignal::parse(&Action::new("auth/apply", Value::Null)), None);
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(100);
        for _ in 0..100 {
            let pause = LeaderElector::jittered(base);
            assert!(pause >= base && pause <= Duration::from_millis(120));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lone_instance_becomes_leader() {
        let hub = MemoryHub::new();
        let a = elector(&hub, "a");
        a.start();

        tokio::time::timeout(Duration::from_secs(2), a.await_leadership())
            .await
            .expect("lone instance should lead");
        assert_eq!(a.state().await, ElectionState::Leader);
        a.die().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_late_joiner_does_not_lead() {
        let hub = MemoryHub::new();
        let a = elector(&hub, "a");
        a.start();
        tokio::time::timeout(Duration::from_secs(2), a.await_leadership())
            .await
            .unwrap();

        // "b" sorts higher than "a" but an existing leader always wins
        let b = elector(&hub, "b");
        b.start();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(a.is_leader());
        assert!(!b.is_leader());
        a.die().await;
        b.die().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_simultaneous_start_elects_one() {
        let hub = MemoryHub::new();
        let electors: Vec<_> = ["a", "b", "c"].iter().map(|id| elector(&hub, id)).collect();
        for e in &electors {
            e.start();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        let leaders = electors.iter().filter(|e| e.is_leader()).count();
        assert_eq!(leaders, 1);
        for e in &electors {
            e.die().await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_follower_takes_over_after_death() {
        let hub = MemoryHub::new();
        let a = elector(&hub, "a");
        a.start();
        tokio::time::timeout(Duration::from_secs(2), a.await_leadership())
            .await
            .unwrap();

        let b = elector(&hub, "b");
        b.start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!b.is_leader());

        a.die().await;
        tokio::time::timeout(Duration::from_secs(2), b.await_leadership())
            .await
            .expect("follower should take over");
        b.die().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_duplicate_leaders_reconcile() {
        let hub = MemoryHub::new();
        let a = elector(&hub, "a");
        let b = elector(&hub, "b");
        // Both lead before either hears the other
        a.become_leader().await;
        b.become_leader().await;
        a.start();
        b.start();

        a.send(ElectionSignal::Tell);
        b.send(ElectionSignal::Tell);
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The higher id keeps leadership
        assert!(!a.is_leader());
        assert!(b.is_leader());
        a.die().await;
        b.die().await;
    }
}

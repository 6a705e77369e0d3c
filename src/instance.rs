//! Instance Wiring
//!
//! One `Instance` is one tab: a store with the auth module, a coordination
//! bus on a shared broadcast transport, and the session logic on top.

use std::sync::Arc;

use crate::api::{ApiService, HttpBackend};
use crate::bus::CoordinationBus;
use crate::config::TabSyncConfig;
use crate::error::Result;
use crate::id::InstanceId;
use crate::identity::IdentityProvider;
use crate::session::SessionSync;
use crate::store::{AuthModule, Store};
use crate::telemetry::Telemetry;
use crate::transport::BroadcastTransport;

/// A running instance
pub struct Instance {
    store: Arc<Store>,
    bus: CoordinationBus,
    session: Arc<SessionSync>,
    telemetry: Arc<dyn Telemetry>,
}

impl Instance {
    /// Build and start an instance. Returns once the election and the
    /// session startup have settled.
    pub async fn start(
        config: &TabSyncConfig,
        transport: Arc<dyn BroadcastTransport>,
        provider: Arc<dyn IdentityProvider>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Result<Self> {
        Self::start_with_id(config, transport, provider, telemetry, InstanceId::generate()).await
    }

    /// Like `start`, with a fixed instance id
    pub async fn start_with_id(
        config: &TabSyncConfig,
        transport: Arc<dyn BroadcastTransport>,
        provider: Arc<dyn IdentityProvider>,
        telemetry: Arc<dyn Telemetry>,
        instance_id: InstanceId,
    ) -> Result<Self> {
        let store = Arc::new(Store::new());
        store.register_module(Box::new(AuthModule::new())).await;

        let bus = CoordinationBus::with_instance_id(config.bus_config(), transport, instance_id);
        bus.init(&store).await?;

        let session = Arc::new(
            SessionSync::new(
                Arc::clone(&store),
                provider,
                Arc::clone(&telemetry),
                config.session_config(),
                config.bus.coordination_module.clone(),
            )
            .await,
        );
        session.init_store().await;

        tracing::info!("Instance {} started", bus.instance_id());
        Ok(Self {
            store,
            bus,
            session,
            telemetry,
        })
    }

    pub fn instance_id(&self) -> &InstanceId {
        self.bus.instance_id()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn bus(&self) -> &CoordinationBus {
        &self.bus
    }

    pub fn session(&self) -> &Arc<SessionSync> {
        &self.session
    }

    pub async fn is_leader(&self) -> bool {
        self.bus.is_leader(&self.store).await
    }

    /// API client authenticated through this instance's session
    pub fn api(&self, backend: Arc<dyn HttpBackend>) -> ApiService {
        ApiService::new(backend, self.session.clone()).with_telemetry(Arc::clone(&self.telemetry))
    }

    /// Leave the election and close all channels
    pub async fn shutdown(&self) {
        self.bus.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Identity, ScriptedIdentityProvider, SessionResult};
    use crate::store::{SessionSource, UserIds, AUTH_MODULE};
    use crate::telemetry::TracingTelemetry;
    use crate::transport::{Action, ChannelHandle, Envelope, MemoryHub};
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn test_config(election: bool) -> TabSyncConfig {
        let mut config = TabSyncConfig::default();
        config.bus.enable_leader_election = election;
        config.bus.election_wait_ms = 300;
        config.election.response_time_ms = 20;
        config.election.fallback_interval_ms = 100;
        config.session.leader_answer_timeout_ms = 300;
        config
    }

    fn sso_provider() -> Arc<ScriptedIdentityProvider> {
        let identity: Identity =
            serde_json::from_value(json!({"scopes": ["user.read"], "idToken": "t", "claims": {}})).unwrap();
        Arc::new(ScriptedIdentityProvider::new().with_login_result(
            SessionResult {
                account_id: "u1".into(),
                session_id: "s1".into(),
                identity,
            },
            "ada@example.com",
        ))
    }

    async fn tab(hub: &MemoryHub, config: &TabSyncConfig, id: &str) -> Instance {
        Instance::start_with_id(
            config,
            Arc::new(hub.clone()),
            sso_provider(),
            Arc::new(TracingTelemetry),
            InstanceId::from_raw(id),
        )
        .await
        .unwrap()
    }

    async fn source(instance: &Instance) -> Option<SessionSource> {
        instance
            .store()
            .read::<AuthModule, _>(AUTH_MODULE, |m| m.source())
            .await
            .flatten()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_first_tab_leads_and_logs_in() {
        let hub = MemoryHub::new();
        let a = tab(&hub, &test_config(true), "a").await;

        assert!(a.is_leader().await);
        assert!(!a.session().is_authenticated().await);

        a.session().login().await;
        assert_eq!(a.session().session().await.ids(), UserIds::new("u1", "s1"));
        assert!(a.session().is_authenticated().await);
        a.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_tab_receives_session_from_leader() {
        let hub = MemoryHub::new();
        let config = test_config(true);
        let a = tab(&hub, &config, "a").await;
        a.session().login().await;

        let started = Instant::now();
        let b = tab(&hub, &config, "b").await;
        let startup = started.elapsed();

        assert!(!b.is_leader().await);
        assert_eq!(b.session().session().await.ids(), UserIds::new("u1", "s1"));
        assert_eq!(source(&b).await, Some(SessionSource::Replicated));
        // Election wait plus an answered (not timed out) session request
        assert!(startup < Duration::from_millis(300 + 300));

        // Identity is per tab: B refreshes it through the provider
        assert!(b.session().is_authenticated().await);
        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tab_without_reachable_leader_stays_signed_out() {
        let hub = MemoryHub::new();
        let a = tab(&hub, &test_config(true), "a").await;
        a.session().login().await;
        a.shutdown().await;

        let started = Instant::now();
        let b = tab(&hub, &test_config(false), "b").await;

        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(!b.session().session().await.is_complete());
        assert!(!b.session().is_authenticated().await);
        b.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_logout_replicates_to_other_tabs() {
        let hub = MemoryHub::new();
        let config = test_config(true);
        let a = tab(&hub, &config, "a").await;
        a.session().login().await;
        let b = tab(&hub, &config, "b").await;
        assert!(b.session().session().await.is_complete());

        a.session().logout().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!a.session().session().await.is_complete());
        assert!(!b.session().session().await.is_complete());
        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_competing_answers_last_one_wins() {
        let hub = MemoryHub::new();
        let b = tab(&hub, &test_config(false), "b").await;

        // Two leaders of a split group answer the same request
        let leaders = hub.open(AUTH_MODULE).unwrap();
        for (from, session) in [("x", "s1"), ("y", "s2")] {
            leaders
                .post_message(&Envelope::targeted(
                    InstanceId::from_raw(from),
                    InstanceId::from_raw("b"),
                    Action::new("auth/__setUser", json!({"accountId": "u1", "sessionId": session})),
                ))
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(b.session().session().await.ids(), UserIds::new("u1", "s2"));
        b.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_local_session_survives_late_answer() {
        let hub = MemoryHub::new();
        let b = tab(&hub, &test_config(false), "b").await;
        b.session().login().await;

        let leader = hub.open(AUTH_MODULE).unwrap();
        leader
            .post_message(&Envelope::targeted(
                InstanceId::from_raw("x"),
                InstanceId::from_raw("b"),
                Action::new("auth/__setUser", json!({"accountId": "u9", "sessionId": "s9"})),
            ))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(b.session().session().await.ids(), UserIds::new("u1", "s1"));
        assert_eq!(source(&b).await, Some(SessionSource::Local));
        b.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_relogin_after_handover_keeps_session() {
        let hub = MemoryHub::new();
        let b = tab(&hub, &test_config(false), "b").await;

        let leader = hub.open(AUTH_MODULE).unwrap();
        leader
            .post_message(&Envelope::targeted(
                InstanceId::from_raw("x"),
                InstanceId::from_raw("b"),
                Action::new("auth/__setUser", json!({"accountId": "u1", "sessionId": "s1"})),
            ))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(source(&b).await, Some(SessionSource::Replicated));

        // B runs its own login for the same session
        assert!(b.session().is_authenticated().await);
        b.session().login().await;
        assert_eq!(source(&b).await, Some(SessionSource::Local));

        leader
            .post_message(&Envelope::broadcast(
                InstanceId::from_raw("x"),
                Action::new("auth/__setUser", json!({"accountId": "u2", "sessionId": "s2"})),
            ))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(b.session().session().await.ids(), UserIds::new("u1", "s1"));
        b.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tabs_elect_one_leader() {
        let hub = MemoryHub::new();
        let config = test_config(true);
        let (a, b, c) = tokio::join!(tab(&hub, &config, "a"), tab(&hub, &config, "b"), tab(&hub, &config, "c"));

        // Let any re-application rounds settle
        tokio::time::sleep(Duration::from_millis(300)).await;
        let mut leaders = 0;
        for instance in [&a, &b, &c] {
            if instance.is_leader().await {
                leaders += 1;
            }
        }
        assert_eq!(leaders, 1);
        for instance in [a, b, c] {
            instance.shutdown().await;
        }
    }
}

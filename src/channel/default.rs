//! Default Module Channel

use async_trait::async_trait;

use super::{forward_outgoing, replay_incoming, ChannelCore, ChannelKind, ModuleChannel};
use crate::error::Result;
use crate::store::{Origin, Store};
use crate::transport::{Action, Envelope};

/// Replicates a module's eligible operations verbatim
pub struct DefaultChannel {
    core: ChannelCore,
}

impl DefaultChannel {
    pub fn new(core: ChannelCore) -> Self {
        Self { core }
    }
}

#[async_trait]
impl ModuleChannel for DefaultChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Default
    }

    async fn process_outgoing(&self, _store: &Store, action: &Action, origin: Origin) -> Result<()> {
        forward_outgoing(&self.core, action, origin)?;
        Ok(())
    }

    async fn process_incoming(&self, store: &Store, envelope: Envelope) -> Result<()> {
        replay_incoming(&self.core, store, envelope).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelContext;
    use crate::id::InstanceId;
    use crate::store::{ModuleDefinition, StateModule};
    use crate::transport::{BroadcastTransport, ChannelHandle, Listener, MemoryHub};
    use futures::FutureExt;
    use serde_json::{json, Value};
    use std::any::Any;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Records every applied operation
    struct Journal {
        definition: ModuleDefinition,
        entries: Vec<(String, Value)>,
    }

    impl Journal {
        fn new() -> Self {
            Self {
                definition: ModuleDefinition::new("journal")
                    .with_mutations(&["append", "local_only"])
                    .shareable(&["append"]),
                entries: Vec::new(),
            }
        }
    }

    impl StateModule for Journal {
        fn definition(&self) -> &ModuleDefinition {
            &self.definition
        }

        fn apply(&mut self, operation: &str, payload: &Value, _origin: Origin) -> Result<()> {
            self.entries.push((operation.to_string(), payload.clone()));
            Ok(())
        }

        fn snapshot(&self) -> Value {
            json!(self.entries.len())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct Fixture {
        store: Store,
        channel: DefaultChannel,
        peer: Arc<dyn ChannelHandle>,
        received: mpsc::UnboundedReceiver<Envelope>,
    }

    async fn fixture() -> Fixture {
        let hub = MemoryHub::new();
        let store = Store::new();
        store.register_module(Box::new(Journal::new())).await;
        let definition = store.definition("journal").await.unwrap();

        let core = ChannelCore::new(
            "journal",
            hub.open("journal").unwrap(),
            definition.qualified_broadcast_actions(),
            ChannelContext {
                instance_id: InstanceId::from_raw("me"),
                coordination_module: "broadcast".into(),
            },
        );

        let peer = hub.open("journal").unwrap();
        let (tx, received) = mpsc::unbounded_channel();
        let listener: Listener = Arc::new(move |envelope: Envelope| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(envelope);
            }
            .boxed()
        });
        peer.add_listener(listener);

        Fixture {
            store,
            channel: DefaultChannel::new(core),
            peer,
            received,
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Option<Envelope> {
        tokio::time::timeout(Duration::from_millis(150), rx.recv())
            .await
            .ok()
            .flatten()
    }

    async fn journal_len(store: &Store) -> usize {
        store.read::<Journal, _>("journal", |j| j.entries.len()).await.unwrap_or(0)
    }

    #[tokio::test]
    async fn test_outgoing_posts_local_eligible_operation() {
        let mut f = fixture().await;
        let action = Action::new("journal/append", json!("x"));

        f.channel.process_outgoing(&f.store, &action, Origin::Local).await.unwrap();

        let envelope = next(&mut f.received).await.unwrap();
        assert_eq!(envelope.value, action);
        assert_eq!(envelope.from, InstanceId::from_raw("me"));
        assert!(envelope.to.is_none());
        assert!(f.channel.is_duplicate_of_last(&action));
    }

    #[tokio::test]
    async fn test_outgoing_skips_replays_and_ineligible() {
        let mut f = fixture().await;

        let replayed = Action::new("journal/append", json!("x"));
        f.channel.process_outgoing(&f.store, &replayed, Origin::Replay).await.unwrap();

        let private = Action::new("journal/local_only", json!("y"));
        f.channel.process_outgoing(&f.store, &private, Origin::Local).await.unwrap();

        assert!(next(&mut f.received).await.is_none());
    }

    #[tokio::test]
    async fn test_same_operation_twice_posts_once() {
        let mut f = fixture().await;
        let action = Action::new("journal/append", json!("x"));

        f.channel.process_outgoing(&f.store, &action, Origin::Local).await.unwrap();
        f.channel.process_outgoing(&f.store, &action, Origin::Local).await.unwrap();

        assert!(next(&mut f.received).await.is_some());
        assert!(next(&mut f.received).await.is_none());
    }

    #[tokio::test]
    async fn test_incoming_replays_once() {
        let f = fixture().await;
        let envelope = Envelope::broadcast(
            InstanceId::from_raw("peer"),
            Action::new("journal/append", json!("x")),
        );

        f.channel.process_incoming(&f.store, envelope.clone()).await.unwrap();
        assert_eq!(journal_len(&f.store).await, 1);

        // Duplicate of the last message: no side effect
        assert!(f.channel.is_duplicate_of_last(&envelope.value));
        f.channel.process_incoming(&f.store, envelope).await.unwrap();
        assert_eq!(journal_len(&f.store).await, 1);
    }

    #[tokio::test]
    async fn test_incoming_respects_target_and_eligibility() {
        let f = fixture().await;

        let elsewhere = Envelope::targeted(
            InstanceId::from_raw("peer"),
            InstanceId::from_raw("someone-else"),
            Action::new("journal/append", json!("x")),
        );
        f.channel.process_incoming(&f.store, elsewhere).await.unwrap();

        let private = Envelope::broadcast(
            InstanceId::from_raw("peer"),
            Action::new("journal/local_only", json!("y")),
        );
        f.channel.process_incoming(&f.store, private).await.unwrap();
        assert_eq!(journal_len(&f.store).await, 0);

        let mine = Envelope::targeted(
            InstanceId::from_raw("peer"),
            InstanceId::from_raw("me"),
            Action::new("journal/append", json!("z")),
        );
        f.channel.process_incoming(&f.store, mine).await.unwrap();
        assert_eq!(journal_len(&f.store).await, 1);
    }

    #[tokio::test]
    async fn test_received_message_is_not_echoed() {
        let mut f = fixture().await;
        let action = Action::new("journal/append", json!("x"));
        let envelope = Envelope::broadcast(InstanceId::from_raw("peer"), action.clone());

        f.channel.process_incoming(&f.store, envelope).await.unwrap();
        // Even if the same operation is then seen as local, the cache holds it back
        f.channel.process_outgoing(&f.store, &action, Origin::Local).await.unwrap();
        assert!(next(&mut f.received).await.is_none());
        assert!(!f.peer.is_closed());
    }
}

//! Dependency graphs through the validation service.
//!
//! Bodies are `label|dep,dep,...` with dependencies as hex message ids. The
//! validator rejects the label `bad`.

use std::time::Duration;

use courier_core::{
    Group, InvalidMessageError, Message, MessageContext, MessageId, MessageState, Metadata,
    Visibility,
};
use courier_store::{Event, EventListener, MemoryStore, Store};
use courier_testkit::{test_client, TestFixture};
use courier_validation::{ValidationConfig, ValidationManager};

fn labelled(message: &Message, _: &Group) -> Result<MessageContext, InvalidMessageError> {
    let body = std::str::from_utf8(message.body())
        .map_err(|_| InvalidMessageError::new("body is not utf-8"))?;
    let (label, deps) = body
        .split_once('|')
        .ok_or_else(|| InvalidMessageError::new("missing separator"))?;
    if label == "bad" {
        return Err(InvalidMessageError::new("bad label"));
    }
    let dependencies = deps
        .split(',')
        .filter(|d| !d.is_empty())
        .map(MessageId::from_hex)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| InvalidMessageError::new(e.to_string()))?;
    Ok(MessageContext::with_dependencies(Metadata::new(), dependencies))
}

struct Graph {
    fixture: TestFixture,
    manager: ValidationManager<MemoryStore>,
    listener: EventListener,
}

impl Graph {
    async fn start() -> Self {
        let fixture = TestFixture::new();
        fixture.contact(courier_core::ContactId(1), Visibility::Shared);
        let manager = ValidationManager::new(
            fixture.store.clone(),
            fixture.events.clone(),
            ValidationConfig::default(),
        );
        manager
            .register_message_validator(test_client(), labelled)
            .unwrap();
        manager.start_service().await.unwrap();
        let listener = fixture.events.subscribe();
        Self {
            fixture,
            manager,
            listener,
        }
    }

    fn message(&self, timestamp: u64, label: &str, deps: &[&Message]) -> Message {
        let deps: Vec<String> = deps.iter().map(|m| m.id().to_hex()).collect();
        self.fixture
            .message(timestamp, format!("{label}|{}", deps.join(",")).as_bytes())
    }

    async fn add(&self, message: &Message) {
        let m = message.clone();
        self.fixture
            .store
            .transaction(false, move |txn| {
                txn.add_message(&m, MessageState::Unknown, false, None)
            })
            .await
            .unwrap();
        self.fixture.events.broadcast(Event::MessageAdded {
            message: message.clone(),
            source: None,
        });
        tokio::time::timeout(Duration::from_secs(10), self.manager.wait_until_idle())
            .await
            .unwrap();
    }

    /// State changes seen so far, in order.
    fn changes(&mut self) -> Vec<(MessageId, MessageState)> {
        let mut out = Vec::new();
        while let Ok(event) = self.listener.try_recv() {
            if let Event::MessageStateChanged { id, state } = event {
                out.push((id, state));
            }
        }
        out
    }
}

#[tokio::test]
async fn test_convergent_invalidation_reaches_each_dependent_once() {
    let mut graph = Graph::start().await;
    let a = graph.message(1, "bad", &[]);
    let b = graph.message(2, "b", &[&a]);
    let c = graph.message(3, "c", &[&a]);
    let d = graph.message(4, "d", &[&b, &c]);

    for m in [&d, &b, &c] {
        graph.add(m).await;
        assert_eq!(graph.fixture.state(&m.id()), MessageState::Pending);
    }
    graph.changes();

    graph.add(&a).await;
    for m in [&a, &b, &c, &d] {
        assert_eq!(graph.fixture.state(&m.id()), MessageState::Invalid);
    }
    let changes = graph.changes();
    for m in [&a, &b, &c, &d] {
        let count = changes.iter().filter(|(id, _)| *id == m.id()).count();
        assert_eq!(count, 1, "{} changed {count} times", m.id());
    }
    assert!(changes.iter().all(|(_, s)| *s == MessageState::Invalid));

    graph.manager.stop_service().await.unwrap();
}

#[tokio::test]
async fn test_pending_chain_delivers_when_root_arrives() {
    let mut graph = Graph::start().await;
    let a = graph.message(1, "a", &[]);
    let b = graph.message(2, "b", &[&a]);
    let c = graph.message(3, "c", &[&b]);

    graph.add(&c).await;
    graph.add(&b).await;
    assert_eq!(graph.fixture.state(&c.id()), MessageState::Pending);
    assert_eq!(graph.fixture.state(&b.id()), MessageState::Pending);
    graph.changes();

    graph.add(&a).await;
    for m in [&a, &b, &c] {
        assert_eq!(graph.fixture.state(&m.id()), MessageState::Delivered);
    }
    let delivered: Vec<MessageId> = graph
        .changes()
        .into_iter()
        .filter(|(_, s)| *s == MessageState::Delivered)
        .map(|(id, _)| id)
        .collect();
    assert_eq!(delivered, vec![a.id(), b.id(), c.id()]);

    graph.manager.stop_service().await.unwrap();
}

#[tokio::test]
async fn test_dependency_on_invalid_message_is_invalid() {
    let graph = Graph::start().await;
    let a = graph.message(1, "bad", &[]);
    graph.add(&a).await;
    assert_eq!(graph.fixture.state(&a.id()), MessageState::Invalid);

    let b = graph.message(2, "b", &[&a]);
    graph.add(&b).await;
    assert_eq!(graph.fixture.state(&b.id()), MessageState::Invalid);
    // Invalid messages keep their row but lose their bytes.
    let id = b.id();
    let gone = graph
        .fixture
        .read(move |txn| Ok(txn.get_message(&id).is_err() && txn.contains_message(&id)?));
    assert!(gone);

    graph.manager.stop_service().await.unwrap();
}

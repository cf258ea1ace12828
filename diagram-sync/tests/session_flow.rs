//! Persistence behavior of a single session against an in-memory store.

use std::sync::Arc;
use tokio::time::{sleep, Duration};

use diagram_core::{Document, MemoryEngine, Node};
use diagram_sync::{
    ClientIdentity, DiagramSession, MemoryDiagramStore, RealtimeChannel, ReconcileOutcome,
    SessionRegistry, SyncConfig, SyncMessage,
};

const DEBOUNCE: Duration = Duration::from_millis(300);

fn config() -> SyncConfig {
    SyncConfig {
        debounce: DEBOUNCE,
        user_id: "tester".into(),
        ..SyncConfig::default()
    }
}

async fn open(store: Arc<MemoryDiagramStore>) -> DiagramSession<MemoryEngine> {
    DiagramSession::open(MemoryEngine::new(), Some("d1".into()), store, None, &config()).await
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_edits_saves_once_with_last_state() {
    let store = Arc::new(MemoryDiagramStore::new());
    let mut session = open(store.clone()).await;

    for i in 0..10 {
        session
            .edit("add", |doc| doc.upsert_node(Node::class(format!("C{i}"), "Entity")))
            .unwrap();
        sleep(Duration::from_millis(50)).await;
    }
    assert!(store.saves().is_empty());

    sleep(DEBOUNCE * 2).await;
    let saves = store.saves();
    assert_eq!(saves.len(), 1);
    let saved = Document::from_value(saves[0].1.model_json.clone()).unwrap();
    assert_eq!(saved.node_count(), 10);
    assert_eq!(session.debounce_stats().writes, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_write_does_not_block_next_edit() {
    let store = Arc::new(MemoryDiagramStore::new());
    let mut session = open(store.clone()).await;
    store.fail_next_saves(1);

    session
        .edit("add", |doc| doc.upsert_node(Node::class("User", "User")))
        .unwrap();
    sleep(DEBOUNCE * 2).await;
    assert_eq!(session.debounce_stats().failures, 1);
    assert!(store.saves().is_empty());

    session
        .edit("add", |doc| doc.upsert_node(Node::class("Order", "Order")))
        .unwrap();
    sleep(DEBOUNCE * 2).await;
    let stats = session.debounce_stats();
    assert_eq!((stats.writes, stats.failures), (1, 1));

    let saved = Document::from_value(store.model("d1").unwrap()).unwrap();
    assert!(saved.node("User").is_some());
    assert!(saved.node("Order").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_close_flushes_pending_write() {
    let store = Arc::new(MemoryDiagramStore::new());
    let mut session = open(store.clone()).await;
    session
        .edit("add", |doc| doc.upsert_node(Node::class("User", "User")))
        .unwrap();

    let engine = session.close().await;
    assert_eq!(store.saves().len(), 1);
    assert_eq!(engine.document().node_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_remote_changes_are_not_persisted() {
    let store = Arc::new(MemoryDiagramStore::new());
    let identity = ClientIdentity::generate();
    let (channel, mut outgoing) = RealtimeChannel::loopback(identity);
    let channel = Arc::new(channel);
    let mut session = DiagramSession::open(
        MemoryEngine::new(),
        Some("d1".into()),
        store.clone(),
        Some(channel.clone()),
        &config(),
    )
    .await;
    assert!(matches!(
        SyncMessage::decode(&outgoing.recv().await.unwrap()).unwrap(),
        SyncMessage::Join(_)
    ));

    let mut peer_doc = Document::new();
    peer_doc.upsert_node(Node::class("Remote", "Remote"));
    let frame = SyncMessage::Changed(diagram_sync::ChangedPayload {
        document_id: "d1".into(),
        delta: None,
        snapshot: Some(peer_doc.to_value().unwrap()),
        source: Some(ClientIdentity::generate()),
    });
    channel.deliver(&frame.encode().unwrap());

    assert_eq!(session.process_next_remote().await, Some(ReconcileOutcome::Applied));
    // Redelivery of the same payload is a no-op.
    channel.deliver(&frame.encode().unwrap());
    assert_eq!(
        session.process_next_remote().await,
        Some(ReconcileOutcome::AlreadyApplied)
    );

    sleep(DEBOUNCE * 2).await;
    assert!(store.saves().is_empty());
    assert!(outgoing.try_recv().is_err());
    assert_eq!(session.engine().document().node_count(), 1);
}

#[tokio::test]
async fn test_registry_exposes_active_session_snapshot() {
    let store = Arc::new(MemoryDiagramStore::new());
    let mut session = open(store).await;
    let registry = SessionRegistry::new();
    registry.register(session.context().unwrap());

    session
        .edit("add", |doc| doc.upsert_node(Node::class("User", "User")))
        .unwrap();

    let active = registry.active().unwrap();
    assert_eq!(active.document_id, "d1");
    let doc = Document::parse(&active.snapshot()).unwrap();
    assert_eq!(doc.node_count(), 1);
}

//! One open diagram: engine, phase machine, snapshot store, observer,
//! reconciler, debouncer and channel route, wired together.
//!
//! ```text
//!  local edit ──► engine ──► ChangeObserver ──┬──► PersistenceDebouncer ──► DiagramStore
//!                   ▲                         └──► RealtimeChannel ──► relay
//!                   │
//!  relay ──► RealtimeChannel ──► RemoteReconciler
//! ```

use diagram_core::{DiagramEngine, Document, MemoryEngine, ModelError};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::channel::RealtimeChannel;
use crate::config::SyncConfig;
use crate::debounce::{DebounceStats, DebouncerHandle, PersistenceDebouncer};
use crate::identity::ClientIdentity;
use crate::observer::{AcceptedChange, ChangeObserver, Observation};
use crate::phase::{PhaseError, PhaseMachine, SyncPhase};
use crate::protocol::ChangedPayload;
use crate::reconciler::{ReconcileOutcome, RemoteReconciler};
use crate::registry::SessionContext;
use crate::remote::DiagramStore;
use crate::snapshot_store::{ModelSnapshotStore, Snapshot};

/// Where accepted local changes go.
struct Outbox {
    document_id: Option<String>,
    debouncer: DebouncerHandle,
    channel: Option<Arc<RealtimeChannel>>,
}

impl Outbox {
    fn publish(&self, change: &AcceptedChange, ai_run_id: Option<&str>) {
        match ai_run_id {
            Some(run) => self.debouncer.schedule_tagged(change.snapshot.clone(), run),
            None => self.debouncer.schedule(change.snapshot.clone()),
        }
        if let (Some(channel), Some(document_id)) = (&self.channel, &self.document_id) {
            if let Err(e) = channel.emit_change(document_id, change) {
                log::debug!("Change {:?} not broadcast: {e}", change.transaction);
            }
        }
    }
}

pub struct DiagramSession<E: DiagramEngine> {
    engine: E,
    phase: PhaseMachine,
    snapshots: ModelSnapshotStore,
    observer: ChangeObserver,
    reconciler: RemoteReconciler,
    outbox: Outbox,
    remote_rx: Option<mpsc::Receiver<ChangedPayload>>,
    identity: ClientIdentity,
}

impl<E: DiagramEngine> DiagramSession<E> {
    /// Load `document_id` into `engine` and start syncing it.
    ///
    /// A missing id opens a new, unsaved diagram: nothing is fetched,
    /// persisted or broadcast. A failed fetch opens an empty diagram. A
    /// stored model that cannot be read opens read-only: the session stays
    /// in [`SyncPhase::Loading`] and never joins the room, so nothing can
    /// be written over the stored copy.
    pub async fn open(
        mut engine: E,
        document_id: Option<String>,
        store: Arc<dyn DiagramStore>,
        channel: Option<Arc<RealtimeChannel>>,
        config: &SyncConfig,
    ) -> Self {
        let mut phase = PhaseMachine::new();

        let mut readable = true;
        let document = match document_id.as_deref() {
            Some(id) => match store.fetch(id).await {
                Ok(record) => Document::from_value(record.model).unwrap_or_else(|e| {
                    log::error!("Stored model for {id} is unreadable, opening read-only: {e}");
                    readable = false;
                    Document::new()
                }),
                Err(e) => {
                    log::warn!("Failed to fetch diagram {id}, opening empty: {e}");
                    Document::new()
                }
            },
            None => Document::new(),
        };

        let snapshot = Self::load(&mut engine, &document);
        let mut snapshots = ModelSnapshotStore::new(snapshot.clone());
        snapshots.mark_applied(&*snapshot);
        if readable {
            if let Err(e) = phase.finish_loading() {
                log::warn!("{e}");
            }
        }
        if !document.is_empty() {
            engine.zoom_to_fit();
        }

        let debouncer = PersistenceDebouncer::spawn(store, document_id.clone(), config.debounce);
        let identity = channel
            .as_ref()
            .map(|c| c.identity())
            .unwrap_or_else(ClientIdentity::generate);
        let remote_rx = match (&channel, &document_id) {
            (Some(channel), Some(id)) if readable => Some(channel.join(id, &config.user_id)),
            _ => None,
        };

        log::info!(
            "Opened diagram {} ({} nodes, {} links)",
            document_id.as_deref().unwrap_or("<new>"),
            document.node_count(),
            document.link_count()
        );

        Self {
            engine,
            phase,
            snapshots,
            observer: ChangeObserver::new(),
            reconciler: RemoteReconciler::new(),
            outbox: Outbox {
                document_id,
                debouncer,
                channel,
            },
            remote_rx,
            identity,
        }
    }

    /// Replace the engine's model without raising events. Returns the
    /// canonical snapshot now in the engine.
    fn load(engine: &mut E, document: &Document) -> Snapshot {
        let json = match document.to_json() {
            Ok(json) => json,
            Err(e) => {
                log::warn!("Cannot serialize loaded document: {e}");
                return Arc::from("");
            }
        };
        let skipped = engine.skips_events();
        engine.set_skips_events(true);
        if let Err(e) = engine.from_snapshot(&json) {
            log::warn!("Engine rejected loaded document: {e}");
        }
        engine.set_skips_events(skipped);
        engine.drain_events();
        Arc::from(engine.to_snapshot().unwrap_or(json))
    }

    fn observe_events(
        engine: &mut E,
        phase: &PhaseMachine,
        snapshots: &mut ModelSnapshotStore,
        observer: &mut ChangeObserver,
    ) -> Vec<AcceptedChange> {
        let events = engine.drain_events();
        events
            .iter()
            .filter_map(|event| match observer.observe(&*engine, phase, snapshots, event) {
                Observation::Accepted(change) => Some(change),
                Observation::Ignored(reason) => {
                    log::trace!("Event {:?} ignored: {reason:?}", event.name);
                    None
                }
            })
            .collect()
    }

    /// Observe whatever the engine raised since the last call, then persist
    /// and broadcast the accepted changes. Returns how many were accepted.
    pub fn process_local_events(&mut self) -> usize {
        let accepted = Self::observe_events(
            &mut self.engine,
            &self.phase,
            &mut self.snapshots,
            &mut self.observer,
        );
        for change in &accepted {
            self.outbox.publish(change, None);
        }
        accepted.len()
    }

    /// Load a diagram from a file into this session. The model replaces the
    /// current one but is neither persisted nor broadcast.
    pub fn import_snapshot(&mut self, raw: &str) -> Result<(), ModelError> {
        let document = Document::parse(raw)?;
        self.process_local_events();
        self.phase.begin_loading();
        let snapshot = Self::load(&mut self.engine, &document);
        self.snapshots.set(snapshot.clone());
        self.snapshots.mark_applied(&*snapshot);
        if let Err(e) = self.phase.finish_loading() {
            log::warn!("{e}");
        }
        if !document.is_empty() {
            self.engine.zoom_to_fit();
        }
        Ok(())
    }

    /// Apply one peer change.
    pub fn apply_remote(&mut self, payload: &ChangedPayload) -> ReconcileOutcome {
        // Local events still queued would be swallowed by the remote apply.
        self.process_local_events();
        let incoming = match payload.incoming() {
            Ok(incoming) => incoming,
            Err(e) => {
                log::warn!("Discarding remote change for {}: {e}", payload.document_id);
                return ReconcileOutcome::Failed(e.to_string());
            }
        };
        self.reconciler.apply(
            &mut self.engine,
            &mut self.phase,
            &mut self.snapshots,
            &incoming,
        )
    }

    /// Wait for and apply the next peer change. `None` once the route is
    /// closed or when the session has no channel.
    pub async fn process_next_remote(&mut self) -> Option<ReconcileOutcome> {
        let payload = self.remote_rx.as_mut()?.recv().await?;
        Some(self.apply_remote(&payload))
    }

    /// Apply every peer change already received, without waiting.
    pub fn process_pending_remote(&mut self) -> Vec<ReconcileOutcome> {
        let mut outcomes = Vec::new();
        while let Some(payload) = self.remote_rx.as_mut().and_then(|rx| rx.try_recv().ok()) {
            outcomes.push(self.apply_remote(&payload));
        }
        outcomes
    }

    /// Leave the realtime room and write any pending snapshot.
    pub async fn close(mut self) -> E {
        self.process_local_events();
        if let (Some(channel), Some(id), Some(_)) =
            (&self.outbox.channel, &self.outbox.document_id, &self.remote_rx)
        {
            channel.leave(id);
        }
        self.outbox.debouncer.flush().await;
        log::info!(
            "Closed diagram {}",
            self.outbox.document_id.as_deref().unwrap_or("<new>")
        );
        self.engine
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Direct engine access for callers driving their own transactions;
    /// follow with [`DiagramSession::process_local_events`].
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase.phase()
    }

    pub fn document_id(&self) -> Option<&str> {
        self.outbox.document_id.as_deref()
    }

    pub fn identity(&self) -> ClientIdentity {
        self.identity
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.get()
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.subscribe()
    }

    pub fn debounce_stats(&self) -> DebounceStats {
        self.outbox.debouncer.stats()
    }

    /// Force the pending persistence write now.
    pub async fn flush(&self) {
        self.outbox.debouncer.flush().await;
    }

    /// Registry handle; `None` for unsaved diagrams.
    pub fn context(&self) -> Option<SessionContext> {
        let document_id = self.outbox.document_id.clone()?;
        Some(SessionContext::new(
            document_id,
            self.identity,
            self.snapshots.subscribe(),
        ))
    }
}

impl DiagramSession<MemoryEngine> {
    /// Run `edit` as one local transaction and publish the result.
    pub fn edit<R>(
        &mut self,
        name: &str,
        edit: impl FnOnce(&mut Document) -> R,
    ) -> Result<R, PhaseError> {
        self.commit(name, edit, None)
    }

    /// Like [`DiagramSession::edit`], for changes produced by an AI
    /// generation run. The save carries `ai_run_id`.
    pub fn apply_generated<R>(
        &mut self,
        ai_run_id: &str,
        edit: impl FnOnce(&mut Document) -> R,
    ) -> Result<R, PhaseError> {
        self.commit("ai generation", edit, Some(ai_run_id))
    }

    fn commit<R>(
        &mut self,
        name: &str,
        edit: impl FnOnce(&mut Document) -> R,
        ai_run_id: Option<&str>,
    ) -> Result<R, PhaseError> {
        let (result, accepted) = {
            let guard = self.phase.begin_edit()?;
            let result = self.engine.transact(name, edit);
            let accepted = Self::observe_events(
                &mut self.engine,
                &guard,
                &mut self.snapshots,
                &mut self.observer,
            );
            (result, accepted)
        };
        for change in &accepted {
            self.outbox.publish(change, ai_run_id);
        }
        Ok(result)
    }

    pub fn undo(&mut self) -> bool {
        let undone = self.engine.undo();
        self.process_local_events();
        undone
    }

    pub fn redo(&mut self) -> bool {
        let redone = self.engine.redo();
        self.process_local_events();
        redone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryDiagramStore;
    use diagram_core::{Node, Point};
    use serde_json::json;
    use std::time::Duration;

    fn config() -> SyncConfig {
        SyncConfig {
            debounce: Duration::from_millis(300),
            user_id: "tester".into(),
            ..SyncConfig::default()
        }
    }

    #[tokio::test]
    async fn test_open_normalizes_stored_model() {
        let store = Arc::new(MemoryDiagramStore::new());
        let stored = json!({"nodeDataArray": [{"key": "User", "name": "User"}]}).to_string();
        store.insert("d1", json!(stored));

        let mut session =
            DiagramSession::open(MemoryEngine::new(), Some("d1".into()), store, None, &config()).await;

        assert_eq!(session.phase(), SyncPhase::Idle);
        assert_eq!(session.engine().document().node_count(), 1);
        assert_eq!(session.engine().fit_count(), 1);
        assert!(session.engine_mut().drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_open_missing_document_is_empty() {
        let store = Arc::new(MemoryDiagramStore::new());
        let session =
            DiagramSession::open(MemoryEngine::new(), Some("nope".into()), store, None, &config()).await;
        assert!(session.engine().document().is_empty());
        assert_eq!(session.phase(), SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_open_accepts_engine_assigned_link_keys() {
        let store = Arc::new(MemoryDiagramStore::new());
        store.insert(
            "d1",
            json!({
                "class": "GraphLinksModel",
                "nodeDataArray": [
                    {"key": "User", "name": "User", "loc": "NaN NaN"},
                    {"key": "Order", "name": "Order", "loc": "200 0"}
                ],
                "linkDataArray": [{"key": -1, "from": "User", "to": "Order", "category": "association"}]
            }),
        );

        let session =
            DiagramSession::open(MemoryEngine::new(), Some("d1".into()), store, None, &config()).await;
        assert_eq!(session.phase(), SyncPhase::Idle);
        let doc = session.engine().document();
        assert_eq!(doc.node_count(), 2);
        assert!(doc.link("User->Order:association").is_some());
    }

    #[tokio::test]
    async fn test_unreadable_stored_model_is_never_overwritten() {
        let store = Arc::new(MemoryDiagramStore::new());
        let stored = json!({"nodeDataArray": [{"name": "NoKey"}, {"key": "User"}]});
        store.insert("d1", stored.clone());

        let mut session =
            DiagramSession::open(MemoryEngine::new(), Some("d1".into()), store.clone(), None, &config()).await;
        assert_eq!(session.phase(), SyncPhase::Loading);
        assert!(session
            .edit("add", |doc| doc.upsert_node(Node::class("Invoice", "Invoice")))
            .is_err());

        session.flush().await;
        assert!(store.saves().is_empty());
        assert_eq!(store.model("d1"), Some(stored));
    }

    #[tokio::test]
    async fn test_generated_edit_tags_save() {
        let store = Arc::new(MemoryDiagramStore::new());
        let mut session =
            DiagramSession::open(MemoryEngine::new(), Some("d1".into()), store.clone(), None, &config()).await;

        session
            .apply_generated("run-7", |doc| doc.upsert_node(Node::class("User", "User")))
            .unwrap();
        session.flush().await;
        let saves = store.saves();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].1.ai_run_id.as_deref(), Some("run-7"));
    }

    #[tokio::test]
    async fn test_edit_publishes_snapshot() {
        let store = Arc::new(MemoryDiagramStore::new());
        let mut session =
            DiagramSession::open(MemoryEngine::new(), Some("d1".into()), store.clone(), None, &config()).await;

        session
            .edit("add", |doc| doc.upsert_node(Node::class("User", "User").at(120.0, 80.0)))
            .unwrap();
        assert_eq!(session.phase(), SyncPhase::Idle);
        let doc = Document::parse(&session.snapshot()).unwrap();
        assert_eq!(doc.node("User").unwrap().loc, Some(Point::new(120.0, 80.0)));

        session.flush().await;
        assert_eq!(store.saves().len(), 1);
    }

    #[tokio::test]
    async fn test_import_is_not_persisted() {
        let store = Arc::new(MemoryDiagramStore::new());
        let mut session =
            DiagramSession::open(MemoryEngine::new(), Some("d1".into()), store.clone(), None, &config()).await;

        let mut doc = Document::new();
        doc.upsert_node(Node::class("Imported", "Imported"));
        session.import_snapshot(&doc.to_json().unwrap()).unwrap();
        assert_eq!(session.engine().document().node_count(), 1);
        assert_eq!(session.phase(), SyncPhase::Idle);

        session.flush().await;
        assert!(store.saves().is_empty());
        assert!(session.import_snapshot("{broken").is_err());
        assert_eq!(session.engine().document().node_count(), 1);
    }

    #[tokio::test]
    async fn test_unsaved_diagram_never_writes() {
        let store = Arc::new(MemoryDiagramStore::new());
        let mut session = DiagramSession::open(MemoryEngine::new(), None, store.clone(), None, &config()).await;
        session.edit("add", |doc| doc.upsert_node(Node::class("A", "A"))).unwrap();
        session.flush().await;
        assert!(store.saves().is_empty());
        assert_eq!(session.debounce_stats().skipped, 1);
        assert!(session.context().is_none());
    }

    #[tokio::test]
    async fn test_undo_is_not_published() {
        let store = Arc::new(MemoryDiagramStore::new());
        let mut session =
            DiagramSession::open(MemoryEngine::new(), Some("d1".into()), store.clone(), None, &config()).await;
        session.edit("add", |doc| doc.upsert_node(Node::class("A", "A"))).unwrap();
        let published = session.snapshot();

        assert!(session.undo());
        assert!(session.engine().document().is_empty());
        assert_eq!(session.snapshot(), published);
    }
}

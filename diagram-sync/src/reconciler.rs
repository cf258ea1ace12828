//! Remote Change Reconciler: applies peers' changes to the local engine
//! without them being observed as local edits.

use diagram_core::{DiagramEngine, Document};
use std::sync::Arc;

use crate::phase::{PhaseError, PhaseMachine};
use crate::protocol::Incoming;
use crate::snapshot_store::ModelSnapshotStore;

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Applied,
    /// Identical to the last applied payload
    AlreadyApplied,
    /// Empty snapshot would replace a non-empty document
    EmptyOverwrite,
    /// Session not idle (still loading)
    NotReady(PhaseError),
    /// Apply failed; the local document is unchanged
    Failed(String),
}

#[derive(Debug, Default)]
pub struct RemoteReconciler {
    applied: u64,
    failed: u64,
}

impl RemoteReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply<E: DiagramEngine + ?Sized>(
        &mut self,
        engine: &mut E,
        phase: &mut PhaseMachine,
        store: &mut ModelSnapshotStore,
        incoming: &Incoming,
    ) -> ReconcileOutcome {
        let payload = match incoming {
            Incoming::Delta(delta) => serde_json::to_string(delta).map_err(|e| e.to_string()),
            Incoming::Snapshot(doc) => doc.to_json().map_err(|e| e.to_string()),
        };
        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                self.failed += 1;
                log::warn!("Discarding remote change that cannot be serialized: {e}");
                return ReconcileOutcome::Failed(e);
            }
        };
        if store.is_last_applied(&payload) {
            log::debug!("Remote change already applied");
            return ReconcileOutcome::AlreadyApplied;
        }
        if let Incoming::Snapshot(doc) = incoming {
            if doc.is_empty() && Self::has_local_data(engine, store) {
                log::warn!("Refusing empty remote snapshot over a non-empty document");
                return ReconcileOutcome::EmptyOverwrite;
            }
        }

        let _guard = match phase.begin_remote() {
            Ok(guard) => guard,
            Err(e) => {
                log::warn!("Dropping remote change: {e}");
                return ReconcileOutcome::NotReady(e);
            }
        };

        let animation = engine.set_animation_enabled(false);
        let result = match incoming {
            Incoming::Delta(delta) => engine.apply_delta(delta).map_err(|e| e.to_string()),
            Incoming::Snapshot(_) => engine.from_snapshot(&payload).map_err(|e| e.to_string()),
        };
        engine.set_animation_enabled(animation);

        let suppressed = engine.drain_events().len();
        if suppressed > 0 {
            log::debug!("Suppressed {suppressed} engine events raised by remote apply");
        }

        if let Err(e) = result {
            self.failed += 1;
            log::warn!("Failed to apply remote change: {e}");
            return ReconcileOutcome::Failed(e);
        }

        if engine.visible_part_count() > 0 {
            engine.zoom_to_fit();
        }
        match engine.to_snapshot() {
            Ok(snapshot) => store.set(Arc::<str>::from(snapshot)),
            Err(e) => log::warn!("Applied remote change but could not publish snapshot: {e}"),
        }
        store.mark_applied(payload);
        self.applied += 1;
        ReconcileOutcome::Applied
    }

    fn has_local_data<E: DiagramEngine + ?Sized>(engine: &E, store: &ModelSnapshotStore) -> bool {
        engine.visible_part_count() > 0
            || Document::parse(&store.get())
                .map(|doc| !doc.is_empty())
                .unwrap_or(false)
    }

    pub fn applied_count(&self) -> u64 {
        self.applied
    }

    pub fn failed_count(&self) -> u64 {
        self.failed
    }
}

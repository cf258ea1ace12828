//! Change Observer: turns finished engine transactions into publishable
//! changes.
//!
//! Called from the engine's event path, so it never returns an error: every
//! outcome is an [`Observation`], and rejected events are logged and dropped.

use diagram_core::{Delta, DiagramEngine, Document, TransactionEvent};
use std::sync::Arc;

use crate::phase::{PhaseMachine, SyncPhase};
use crate::snapshot_store::{ModelSnapshotStore, Snapshot};

/// A local change cleared for persistence and broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedChange {
    pub transaction: String,
    pub snapshot: Snapshot,
    /// Absent when the engine had no change tracking for the transaction.
    pub delta: Option<Delta>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Not the last event of its transaction
    Unfinished,
    /// Raised by undo/redo replay
    UndoRedo,
    /// Raised while loading or applying a remote change
    Suppressed(SyncPhase),
    /// Empty model would overwrite a non-empty one
    EmptyOverwrite,
    /// Model identical to the published snapshot
    Unchanged,
    /// Engine could not serialize its model at all
    SerializationFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Accepted(AcceptedChange),
    Ignored(IgnoreReason),
}

impl Observation {
    pub fn accepted(self) -> Option<AcceptedChange> {
        match self {
            Observation::Accepted(change) => Some(change),
            Observation::Ignored(_) => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ChangeObserver {
    accepted: u64,
    discarded_empty: u64,
}

impl ChangeObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe<E: DiagramEngine + ?Sized>(
        &mut self,
        engine: &E,
        phase: &PhaseMachine,
        store: &mut ModelSnapshotStore,
        event: &TransactionEvent,
    ) -> Observation {
        if !event.is_transaction_finished {
            return Observation::Ignored(IgnoreReason::Unfinished);
        }
        if event.is_undo_redo || engine.is_undoing_redoing() {
            log::debug!("Ignoring undo/redo replay of {:?}", event.name);
            return Observation::Ignored(IgnoreReason::UndoRedo);
        }
        if !phase.observes_local_changes() {
            log::debug!("Ignoring {:?} while {}", event.name, phase.phase());
            return Observation::Ignored(IgnoreReason::Suppressed(phase.phase()));
        }

        let raw = match engine.to_snapshot() {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("Engine failed to serialize after {:?}: {e}", event.name);
                return Observation::Ignored(IgnoreReason::SerializationFailed);
            }
        };

        // Re-parse to validate; on failure publish the raw string as-is.
        let (canonical, is_empty) = match Document::parse(&raw).and_then(|doc| {
            let json = doc.to_json()?;
            Ok((json, doc.is_empty()))
        }) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::warn!("Publishing unvalidated snapshot after {:?}: {e}", event.name);
                (raw, false)
            }
        };

        if is_empty {
            let visible = engine.visible_part_count();
            let previous_had_data = Document::parse(&store.get())
                .map(|doc| !doc.is_empty())
                .unwrap_or(false);
            if visible > 0 || previous_had_data {
                self.discarded_empty += 1;
                log::debug!(
                    "Discarding empty snapshot from {:?} ({visible} parts visible, previous had data: {previous_had_data})",
                    event.name
                );
                return Observation::Ignored(IgnoreReason::EmptyOverwrite);
            }
        }

        if *store.get() == *canonical {
            return Observation::Ignored(IgnoreReason::Unchanged);
        }

        let snapshot: Snapshot = Arc::from(canonical);
        store.set(snapshot.clone());
        store.mark_applied(&*snapshot);
        self.accepted += 1;

        Observation::Accepted(AcceptedChange {
            transaction: event.name.clone(),
            snapshot,
            delta: engine.to_delta(event),
        })
    }

    pub fn accepted_count(&self) -> u64 {
        self.accepted
    }

    pub fn discarded_empty_count(&self) -> u64 {
        self.discarded_empty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diagram_core::{Link, LinkCategory, MemoryEngine, Node};

    fn ready() -> (MemoryEngine, PhaseMachine, ModelSnapshotStore, ChangeObserver) {
        let engine = MemoryEngine::new();
        let mut phase = PhaseMachine::new();
        phase.finish_loading().unwrap();
        let store = ModelSnapshotStore::new(engine.to_snapshot().unwrap());
        (engine, phase, store, ChangeObserver::new())
    }

    fn observe_all(
        engine: &mut MemoryEngine,
        phase: &PhaseMachine,
        store: &mut ModelSnapshotStore,
        observer: &mut ChangeObserver,
    ) -> Vec<Observation> {
        engine
            .drain_events()
            .iter()
            .map(|event| observer.observe(&*engine, phase, store, event))
            .collect()
    }

    #[test]
    fn test_accepts_finished_local_transaction() {
        let (mut engine, phase, mut store, mut observer) = ready();
        engine.transact("add", |doc| doc.upsert_node(Node::class("User", "User")));

        let observations = observe_all(&mut engine, &phase, &mut store, &mut observer);
        assert_eq!(observations[0], Observation::Ignored(IgnoreReason::Unfinished));
        let change = observations[1].clone().accepted().unwrap();
        assert_eq!(change.transaction, "add");
        assert!(change.delta.is_some());
        assert_eq!(store.get(), change.snapshot);
        assert!(store.is_last_applied(&change.snapshot));
    }

    #[test]
    fn test_ignores_undo_redo() {
        let (mut engine, phase, mut store, mut observer) = ready();
        engine.transact("add", |doc| doc.upsert_node(Node::class("User", "User")));
        observe_all(&mut engine, &phase, &mut store, &mut observer);
        let published = store.get();

        engine.undo();
        let observations = observe_all(&mut engine, &phase, &mut store, &mut observer);
        assert_eq!(observations, vec![Observation::Ignored(IgnoreReason::UndoRedo)]);
        assert_eq!(store.get(), published);
    }

    #[test]
    fn test_ignores_while_loading_or_applying_remote() {
        let mut engine = MemoryEngine::new();
        let mut phase = PhaseMachine::new();
        let mut store = ModelSnapshotStore::new("");
        let mut observer = ChangeObserver::new();

        engine.transact("load", |doc| doc.upsert_node(Node::class("A", "A")));
        let observations = observe_all(&mut engine, &phase, &mut store, &mut observer);
        assert_eq!(
            observations[1],
            Observation::Ignored(IgnoreReason::Suppressed(SyncPhase::Loading))
        );

        phase.finish_loading().unwrap();
        let guard = phase.begin_remote().unwrap();
        engine.transact("remote", |doc| doc.upsert_node(Node::class("B", "B")));
        let observations = observe_all(&mut engine, &guard, &mut store, &mut observer);
        assert_eq!(
            observations[1],
            Observation::Ignored(IgnoreReason::Suppressed(SyncPhase::ApplyingRemote))
        );
        assert_eq!(observer.accepted_count(), 0);
    }

    #[test]
    fn test_rejects_empty_overwrite_for_any_size() {
        for n in 1..=6 {
            let (mut engine, phase, mut store, mut observer) = ready();
            engine.transact("populate", |doc| {
                for i in 0..n {
                    doc.upsert_node(Node::class(format!("N{i}"), format!("N{i}")));
                }
            });
            observe_all(&mut engine, &phase, &mut store, &mut observer);
            let published = store.get();

            // Transient empty model while parts are still on screen.
            engine.detach_model();
            let observations = observe_all(&mut engine, &phase, &mut store, &mut observer);
            assert_eq!(
                observations,
                vec![Observation::Ignored(IgnoreReason::EmptyOverwrite)],
                "n = {n}"
            );

            // Empty model after everything was deleted and re-rendered:
            // the previous snapshot still had data.
            engine.transact("clear", |doc| *doc = Default::default());
            let observations = observe_all(&mut engine, &phase, &mut store, &mut observer);
            assert_eq!(observations[1], Observation::Ignored(IgnoreReason::EmptyOverwrite));
            assert_eq!(store.get(), published);
        }
    }

    #[test]
    fn test_empty_allowed_when_nothing_to_lose() {
        let (mut engine, phase, mut store, mut observer) = ready();
        engine.transact("select", |_doc| {});
        let observations = observe_all(&mut engine, &phase, &mut store, &mut observer);
        assert_eq!(observations[1], Observation::Ignored(IgnoreReason::Unchanged));
    }

    #[test]
    fn test_link_edit_publishes_canonical_json() {
        let (mut engine, phase, mut store, mut observer) = ready();
        engine.transact("classes", |doc| {
            doc.upsert_node(Node::class("User", "User"));
            doc.upsert_node(Node::class("Order", "Order"));
        });
        engine.transact("relate", |doc| {
            doc.add_link(Link::new("User", "Order", LinkCategory::Association));
        });
        let accepted: Vec<_> = observe_all(&mut engine, &phase, &mut store, &mut observer)
            .into_iter()
            .filter_map(Observation::accepted)
            .collect();
        assert_eq!(accepted.len(), 2);
        let doc = Document::parse(&accepted[1].snapshot).unwrap();
        assert_eq!(doc.link_data_array[0].key, "User->Order:association");
    }
}

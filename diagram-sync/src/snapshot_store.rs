//! Model Snapshot Store: latest canonical snapshot of the open document.
//!
//! The engine owns the document; this is a read projection of it for the
//! persistence and network layers and any out-of-band reader (exporters,
//! side editors). Backed by a `watch` channel so readers can either poll
//! the current value or await the next one.

use std::sync::Arc;
use tokio::sync::watch;

/// Canonical JSON snapshot (shared, cheap to clone).
pub type Snapshot = Arc<str>;

#[derive(Debug)]
pub struct ModelSnapshotStore {
    latest: watch::Sender<Snapshot>,
    /// Payload most recently applied to the engine, local or remote.
    last_applied: String,
}

impl ModelSnapshotStore {
    pub fn new(initial: impl Into<Snapshot>) -> Self {
        let (latest, _) = watch::channel(initial.into());
        Self {
            latest,
            last_applied: String::new(),
        }
    }

    pub fn set(&self, snapshot: impl Into<Snapshot>) {
        self.latest.send_replace(snapshot.into());
    }

    pub fn get(&self) -> Snapshot {
        self.latest.borrow().clone()
    }

    /// Reader handle that outlives borrows of the store.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.latest.subscribe()
    }

    pub fn last_applied(&self) -> &str {
        &self.last_applied
    }

    pub fn mark_applied(&mut self, payload: impl Into<String>) {
        self.last_applied = payload.into();
    }

    /// String-equality short-circuit for payloads already in place.
    pub fn is_last_applied(&self, payload: &str) -> bool {
        !self.last_applied.is_empty() && self.last_applied == payload
    }
}

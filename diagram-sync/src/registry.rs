//! Open sessions, keyed by document id.
//!
//! Out-of-band features (export, print, side editors) look up the active
//! session here instead of reaching for a global canvas pointer.

use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::watch;

use crate::identity::ClientIdentity;
use crate::snapshot_store::Snapshot;

/// Read-only handle to one open session.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub document_id: String,
    pub identity: ClientIdentity,
    snapshots: watch::Receiver<Snapshot>,
}

impl SessionContext {
    pub fn new(
        document_id: impl Into<String>,
        identity: ClientIdentity,
        snapshots: watch::Receiver<Snapshot>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            identity,
            snapshots,
        }
    }

    /// Latest canonical snapshot of the session's document.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionContext>>,
    active: RwLock<Option<String>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a session and make it the active one.
    pub fn register(&self, context: SessionContext) {
        let document_id = context.document_id.clone();
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(document_id.clone(), context);
        }
        if let Ok(mut active) = self.active.write() {
            *active = Some(document_id);
        }
    }

    pub fn unregister(&self, document_id: &str) -> Option<SessionContext> {
        let removed = self.sessions.write().ok()?.remove(document_id);
        if let Ok(mut active) = self.active.write() {
            if active.as_deref() == Some(document_id) {
                *active = None;
            }
        }
        removed
    }

    pub fn get(&self, document_id: &str) -> Option<SessionContext> {
        self.sessions.read().ok()?.get(document_id).cloned()
    }

    pub fn active(&self) -> Option<SessionContext> {
        let active = self.active.read().ok()?.clone()?;
        self.get(&active)
    }

    /// Returns false when no session is registered for `document_id`.
    pub fn set_active(&self, document_id: &str) -> bool {
        let known = self
            .sessions
            .read()
            .map(|s| s.contains_key(document_id))
            .unwrap_or(false);
        if known {
            if let Ok(mut active) = self.active.write() {
                *active = Some(document_id.to_string());
            }
        }
        known
    }

    pub fn len(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

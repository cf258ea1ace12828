//! Per-session client identity used to recognize echoed changes.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Random token distinguishing this session's own changes from peers'.
///
/// Lives as long as the open document session; never persisted and never
/// used for authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientIdentity(Uuid);

impl ClientIdentity {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create with an explicit id (for testing)
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self::generate()
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

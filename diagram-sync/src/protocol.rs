//! Realtime wire protocol.
//!
//! Frames are JSON text, one message per WebSocket frame:
//! ```text
//! { "event": "join",     "data": { "documentId", "userId", "source"?, "snapshot"? } }
//! { "event": "leave",    "data": { "documentId" } }
//! { "event": "change",   "data": { "documentId", "delta"?, "snapshot"?, "clientVersion", "source" } }
//! { "event": "changed",  "data": { "documentId", "delta"?, "snapshot"?, "source"? } }
//! { "event": "presence", "data": { "documentId", "peers": [{ "userId", "source"? }] } }
//! ```
//!
//! Clients emit `join`/`leave`/`change`; the relay emits `changed`/`presence`.
//! `delta` and `snapshot` stay as raw JSON until [`ChangedPayload::incoming`]
//! validates them, so a malformed model never fails the whole frame.

use diagram_core::{Delta, Document, ModelError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::ClientIdentity;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub document_id: String,
    /// Display token for presence lists
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ClientIdentity>,
    /// Local state the relay never saw, sent when re-joining after edits
    /// made while disconnected. The relay adopts it instead of resyncing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeavePayload {
    pub document_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePayload {
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Value>,
    /// Client-local, strictly increasing
    pub client_version: u64,
    pub source: ClientIdentity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangedPayload {
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Value>,
    /// Absent on relay-originated resyncs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ClientIdentity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePeer {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ClientIdentity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub document_id: String,
    pub peers: Vec<PresencePeer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum SyncMessage {
    Join(JoinPayload),
    Leave(LeavePayload),
    Change(ChangePayload),
    Changed(ChangedPayload),
    Presence(PresencePayload),
}

/// A validated remote change, ready for the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Delta(Delta),
    Snapshot(Document),
}

impl ChangedPayload {
    /// Full-snapshot resync sent by the relay on join.
    pub fn resync(document_id: impl Into<String>, snapshot: Value) -> Self {
        Self {
            document_id: document_id.into(),
            delta: None,
            snapshot: Some(snapshot),
            source: None,
        }
    }

    /// Validate the payload. A delta wins over a snapshot when both are present.
    pub fn incoming(&self) -> Result<Incoming, ProtocolError> {
        if let Some(delta) = &self.delta {
            let delta = Delta::deserialize(delta)
                .map_err(|e| ProtocolError::InvalidPayload(format!("delta: {e}")))?;
            return Ok(Incoming::Delta(delta));
        }
        if let Some(snapshot) = &self.snapshot {
            let document = Document::from_value(snapshot.clone())?;
            return Ok(Incoming::Snapshot(document));
        }
        Err(ProtocolError::InvalidPayload(
            "changed event carries neither delta nor snapshot".to_string(),
        ))
    }
}

impl From<ChangePayload> for ChangedPayload {
    fn from(change: ChangePayload) -> Self {
        Self {
            document_id: change.document_id,
            delta: change.delta,
            snapshot: change.snapshot,
            source: Some(change.source),
        }
    }
}

impl SyncMessage {
    pub fn join(
        document_id: impl Into<String>,
        user_id: impl Into<String>,
        source: ClientIdentity,
    ) -> Self {
        Self::Join(JoinPayload {
            document_id: document_id.into(),
            user_id: user_id.into(),
            source: Some(source),
            snapshot: None,
        })
    }

    /// Join carrying the client's unbroadcast snapshot.
    pub fn rejoin(
        document_id: impl Into<String>,
        user_id: impl Into<String>,
        source: ClientIdentity,
        snapshot: &str,
    ) -> Result<Self, ProtocolError> {
        let snapshot = serde_json::from_str::<Value>(snapshot)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self::Join(JoinPayload {
            document_id: document_id.into(),
            user_id: user_id.into(),
            source: Some(source),
            snapshot: Some(snapshot),
        }))
    }

    pub fn leave(document_id: impl Into<String>) -> Self {
        Self::Leave(LeavePayload {
            document_id: document_id.into(),
        })
    }

    /// Outgoing local change. The snapshot is embedded as a JSON object.
    pub fn change(
        document_id: impl Into<String>,
        delta: Option<&Delta>,
        snapshot: Option<&str>,
        client_version: u64,
        source: ClientIdentity,
    ) -> Result<Self, ProtocolError> {
        let delta = delta
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        let snapshot = snapshot
            .map(serde_json::from_str::<Value>)
            .transpose()
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self::Change(ChangePayload {
            document_id: document_id.into(),
            delta,
            snapshot,
            client_version,
            source,
        }))
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Join(_) => "join",
            Self::Leave(_) => "leave",
            Self::Change(_) => "change",
            Self::Changed(_) => "changed",
            Self::Presence(_) => "presence",
        }
    }

    pub fn document_id(&self) -> &str {
        match self {
            Self::Join(p) => &p.document_id,
            Self::Leave(p) => &p.document_id,
            Self::Change(p) => &p.document_id,
            Self::Changed(p) => &p.document_id,
            Self::Presence(p) => &p.document_id,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// Frame parsed but its model payload did not
    InvalidPayload(String),
    ConnectFailed(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidPayload(e) => write!(f, "Invalid payload: {e}"),
            Self::ConnectFailed(e) => write!(f, "Connect failed: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<ModelError> for ProtocolError {
    fn from(e: ModelError) -> Self {
        Self::InvalidPayload(e.to_string())
    }
}

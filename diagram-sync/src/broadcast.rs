//! Per-document fan-out for the relay.
//!
//! Every room owns one tokio broadcast channel. Frames are encoded once and
//! shared as `Arc<RoomFrame>`; each connection filters out frames it
//! originated itself, so a change reaches the N-1 other peers only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, MutexGuard, RwLock};
use uuid::Uuid;

use diagram_core::Document;

use crate::protocol::{PresencePayload, PresencePeer, ProtocolError, SyncMessage};

/// One encoded frame plus the connection that caused it.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomFrame {
    /// `None` for relay-originated frames (presence), which go to everyone
    pub origin: Option<Uuid>,
    pub text: String,
}

impl RoomFrame {
    pub fn is_from(&self, connection: Uuid) -> bool {
        self.origin == Some(connection)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Counters touched on the send path without taking a lock.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RoomFrame>>,
    peers: RwLock<HashMap<Uuid, PresencePeer>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per receiver before a slow peer lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    pub async fn add_peer(
        &self,
        connection: Uuid,
        peer: PresencePeer,
    ) -> broadcast::Receiver<Arc<RoomFrame>> {
        self.peers.write().await.insert(connection, peer);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, connection: &Uuid) -> Option<PresencePeer> {
        self.peers.write().await.remove(connection)
    }

    /// Encode once and fan out. Returns the number of receivers reached.
    pub fn broadcast(&self, origin: Option<Uuid>, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let text = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(RoomFrame { origin, text })))
    }

    pub fn broadcast_raw(&self, frame: Arc<RoomFrame>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Connected peers, ordered by user id.
    pub async fn peers(&self) -> Vec<PresencePeer> {
        let mut peers: Vec<PresencePeer> = self.peers.read().await.values().cloned().collect();
        peers.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        peers
    }

    pub async fn has_peer(&self, connection: &Uuid) -> bool {
        self.peers.read().await.contains_key(connection)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A relay room: fan-out group plus the relay's copy of the document.
pub struct DocumentRoom {
    document_id: String,
    group: BroadcastGroup,
    /// `None` until the first caller loads it from storage
    document: Mutex<Option<Document>>,
}

impl DocumentRoom {
    fn new(document_id: String, capacity: usize) -> Self {
        Self {
            document_id,
            group: BroadcastGroup::new(capacity),
            document: Mutex::new(None),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn group(&self) -> &BroadcastGroup {
        &self.group
    }

    pub async fn document(&self) -> MutexGuard<'_, Option<Document>> {
        self.document.lock().await
    }

    /// Current presence list for this room.
    pub async fn presence(&self) -> SyncMessage {
        SyncMessage::Presence(PresencePayload {
            document_id: self.document_id.clone(),
            peers: self.group.peers().await,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoomError {
    Full { document_id: String, max_peers: usize },
}

impl std::fmt::Display for RoomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoomError::Full { document_id, max_peers } => {
                write!(f, "Room {document_id} is full ({max_peers} peers)")
            }
        }
    }
}

impl std::error::Error for RoomError {}

pub struct RoomJoin {
    pub room: Arc<DocumentRoom>,
    pub receiver: broadcast::Receiver<Arc<RoomFrame>>,
    /// The room did not exist before this join
    pub created: bool,
}

pub struct RoomLeave {
    pub room: Arc<DocumentRoom>,
    pub peer: Option<PresencePeer>,
    /// The last peer left and the room was dropped
    pub emptied: bool,
}

/// Rooms by document id. Join and leave hold the map's write lock for their
/// whole duration, so a room is never dropped while someone is joining it.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<DocumentRoom>>>,
    default_capacity: usize,
    max_peers: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize, max_peers: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
            max_peers,
        }
    }

    pub async fn join(
        &self,
        document_id: &str,
        connection: Uuid,
        peer: PresencePeer,
    ) -> Result<RoomJoin, RoomError> {
        let mut rooms = self.rooms.write().await;
        let created = !rooms.contains_key(document_id);
        let room = rooms
            .entry(document_id.to_string())
            .or_insert_with(|| {
                Arc::new(DocumentRoom::new(document_id.to_string(), self.default_capacity))
            })
            .clone();

        if !room.group.has_peer(&connection).await && room.group.peer_count().await >= self.max_peers {
            if created {
                rooms.remove(document_id);
            }
            return Err(RoomError::Full {
                document_id: document_id.to_string(),
                max_peers: self.max_peers,
            });
        }

        let receiver = room.group.add_peer(connection, peer).await;
        Ok(RoomJoin {
            room,
            receiver,
            created,
        })
    }

    /// Remove a peer. When the room empties, `on_emptied` runs with the
    /// room's document (if loaded) before the room is dropped from the map.
    pub async fn leave<F>(&self, document_id: &str, connection: Uuid, on_emptied: F) -> Option<RoomLeave>
    where
        F: FnOnce(&str, &Document),
    {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get(document_id)?.clone();
        let peer = room.group.remove_peer(&connection).await;

        let emptied = room.group.peer_count().await == 0;
        if emptied {
            if let Some(document) = room.document().await.as_ref() {
                on_emptied(document_id, document);
            }
            rooms.remove(document_id);
        }

        Some(RoomLeave { room, peer, emptied })
    }

    pub async fn get(&self, document_id: &str) -> Option<Arc<DocumentRoom>> {
        self.rooms.read().await.get(document_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Every room whose document has been loaded.
    pub async fn rooms(&self) -> Vec<Arc<DocumentRoom>> {
        self.rooms.read().await.values().cloned().collect()
    }
}

//! Relay server: room-based routing of diagram changes.
//!
//! ```text
//! Client A ──┐                      ┌── Document (relay copy)
//!            ├── Room (document id) ┤
//! Client B ──┘                      └── BroadcastGroup ──► Client A, B, C
//!                                          │
//!                                          └── DocumentStore (RocksDB)
//! ```
//!
//! A connection may join any number of rooms. For each room it gets a
//! forwarder task that copies room frames into the connection's outbox,
//! skipping frames the connection sent itself. The relay keeps its own copy
//! of each document so late joiners can be resynced, and persists it when
//! the last peer leaves. A client re-joining with edits made offline sends
//! its snapshot along, which replaces the relay's copy.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use diagram_core::{Delta, Document};
use serde::Deserialize;
use serde_json::Value;

use crate::broadcast::{DocumentRoom, RoomFrame, RoomManager};
use crate::protocol::{ChangePayload, ChangedPayload, JoinPayload, PresencePeer, SyncMessage};
use crate::storage::{DocumentStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_peers_per_room: usize,
    /// Frames buffered per peer before it lags
    pub broadcast_capacity: usize,
    /// WebSocket ping interval in seconds (0 disables)
    pub heartbeat_interval_secs: u64,
    /// `None` keeps rooms in memory only
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub changes_relayed: u64,
    pub changes_rejected: u64,
    pub persisted_snapshots: u64,
}

/// State shared by every connection task.
struct Relay {
    config: ServerConfig,
    rooms: RoomManager,
    stats: RwLock<ServerStats>,
    store: Option<Arc<DocumentStore>>,
}

/// Per-connection bookkeeping.
struct Connection {
    id: Uuid,
    addr: SocketAddr,
    outbox: mpsc::Sender<String>,
    forwarders: HashMap<String, JoinHandle<()>>,
}

pub struct SyncServer {
    relay: Arc<Relay>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = match &config.storage_path {
            Some(path) => Some(Arc::new(DocumentStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?)),
            None => None,
        };
        Ok(Self::with_store(config, store))
    }

    /// In-memory relay with default settings.
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), None)
    }

    pub fn with_storage(
        bind_addr: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    fn with_store(config: ServerConfig, store: Option<Arc<DocumentStore>>) -> Self {
        let rooms = RoomManager::new(config.broadcast_capacity, config.max_peers_per_room);
        Self {
            relay: Arc::new(Relay {
                config,
                rooms,
                stats: RwLock::new(ServerStats::default()),
                store,
            }),
        }
    }

    /// Ids of documents persisted by earlier runs. Rooms load them on first join.
    pub fn stored_documents(&self) -> Result<Vec<String>, StoreError> {
        match &self.relay.store {
            Some(store) => store.list_documents(),
            None => Ok(Vec::new()),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let stored = self.stored_documents()?;
        if !stored.is_empty() {
            log::info!("{} documents available from persistent storage", stored.len());
        }

        let listener = TcpListener::bind(&self.relay.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.relay.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let relay = self.relay.clone();
            tokio::spawn(async move {
                if let Err(e) = relay.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Persist every loaded room. Returns how many were written.
    pub async fn persist_all(&self) -> usize {
        let mut written = 0;
        for room in self.relay.rooms.rooms().await {
            if let Some(document) = room.document().await.as_ref() {
                if self.relay.persist(room.document_id(), document) {
                    written += 1;
                }
            }
        }
        if written > 0 {
            self.relay.stats.write().await.persisted_snapshots += written as u64;
        }
        if let Some(store) = &self.relay.store {
            if let Err(e) = store.sync() {
                log::error!("Failed to flush document store: {e}");
            }
        }
        written
    }

    pub async fn stats(&self) -> ServerStats {
        self.relay.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.relay.config.bind_addr
    }

    pub fn room_manager(&self) -> &RoomManager {
        &self.relay.rooms
    }

    pub fn store(&self) -> Option<&DocumentStore> {
        self.relay.store.as_deref()
    }
}

impl Relay {
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (outbox, mut outbox_rx) = mpsc::channel::<String>(self.config.broadcast_capacity.max(1));
        let mut conn = Connection {
            id: Uuid::new_v4(),
            addr,
            outbox,
            forwarders: HashMap::new(),
        };

        let heartbeat_secs = self.config.heartbeat_interval_secs;
        let mut heartbeat = tokio::time::interval(Duration::from_secs(heartbeat_secs.max(1)));
        heartbeat.tick().await;

        let result: Result<(), BoxError> = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = self.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            match SyncMessage::decode(text.as_str()) {
                                Ok(message) => {
                                    if let Some(reply) = self.handle_message(&mut conn, message).await {
                                        if let Err(e) = ws_sender.send(Message::Text(reply.into())).await {
                                            break Err(e.into());
                                        }
                                    }
                                }
                                Err(e) => log::warn!("Failed to decode frame from {addr}: {e}"),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break Ok(());
                        }
                        Some(Err(e)) => break Err(e.into()),
                        Some(Ok(_)) => {}
                    }
                }

                Some(text) = outbox_rx.recv() => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        break Err(e.into());
                    }
                }

                _ = heartbeat.tick(), if heartbeat_secs > 0 => {
                    if let Err(e) = ws_sender.send(Message::Ping(Default::default())).await {
                        break Err(e.into());
                    }
                }
            }
        };

        for (document_id, forwarder) in conn.forwarders.drain() {
            forwarder.abort();
            self.leave_room(&document_id, conn.id).await;
        }

        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = self.rooms.room_count().await;
        }

        result
    }

    /// Returns a frame to send straight back to this connection, if any.
    async fn handle_message(&self, conn: &mut Connection, message: SyncMessage) -> Option<String> {
        match message {
            SyncMessage::Join(join) => self.join_room(conn, join).await,
            SyncMessage::Leave(leave) => {
                if let Some(forwarder) = conn.forwarders.remove(&leave.document_id) {
                    forwarder.abort();
                    self.leave_room(&leave.document_id, conn.id).await;
                }
                None
            }
            SyncMessage::Change(change) => {
                if conn.forwarders.contains_key(&change.document_id) {
                    self.relay_change(conn.id, change).await;
                } else {
                    log::warn!(
                        "Dropping change for {} from {}: not joined",
                        change.document_id,
                        conn.addr
                    );
                }
                None
            }
            other => {
                log::debug!("Ignoring client-sent {} event from {}", other.event_name(), conn.addr);
                None
            }
        }
    }

    async fn join_room(&self, conn: &mut Connection, join: JoinPayload) -> Option<String> {
        let peer = PresencePeer {
            user_id: join.user_id.clone(),
            source: join.source,
        };
        let joined = match self.rooms.join(&join.document_id, conn.id, peer).await {
            Ok(joined) => joined,
            Err(e) => {
                log::warn!("Join from {} refused: {e}", conn.addr);
                return None;
            }
        };
        if joined.created {
            log::info!("Room {} created", join.document_id);
        }

        let forwarder = spawn_forwarder(
            joined.room.clone(),
            conn.id,
            joined.receiver,
            conn.outbox.clone(),
            self.store.clone(),
        );
        if let Some(previous) = conn.forwarders.insert(join.document_id.clone(), forwarder) {
            previous.abort();
        }

        // A joiner back from offline edits brings the newer copy. Everyone
        // else gets the room's document, unless it is empty.
        let adopted = match join.snapshot.clone() {
            Some(snapshot) => self.adopt_snapshot(&joined.room, conn.id, &join, snapshot).await,
            None => false,
        };
        let resync = if adopted {
            None
        } else {
            resync_frame(&joined.room, self.store.as_deref()).await
        };

        if let Err(e) = joined.room.group().broadcast(None, &joined.room.presence().await) {
            log::warn!("Failed to broadcast presence for {}: {e}", join.document_id);
        }
        self.stats.write().await.active_rooms = self.rooms.room_count().await;
        log::info!("{} joined {} from {}", join.user_id, join.document_id, conn.addr);
        resync
    }

    /// Replace the room's document with a re-joining client's offline
    /// state and pass it on to the other peers.
    async fn adopt_snapshot(
        &self,
        room: &DocumentRoom,
        origin: Uuid,
        join: &JoinPayload,
        snapshot: Value,
    ) -> bool {
        let replacement = match Document::from_value(snapshot) {
            Ok(document) => document,
            Err(e) => {
                log::warn!("Rejected offline snapshot for {} from {}: {e}", join.document_id, join.user_id);
                self.stats.write().await.changes_rejected += 1;
                return false;
            }
        };
        let frame = match replacement.to_value() {
            Ok(value) => SyncMessage::Changed(ChangedPayload {
                document_id: join.document_id.clone(),
                delta: None,
                snapshot: Some(value),
                source: join.source,
            }),
            Err(e) => {
                log::error!("Failed to encode offline snapshot for {}: {e}", join.document_id);
                return false;
            }
        };

        let mut slot = room.document().await;
        *slot = Some(replacement);
        if let Err(e) = room.group().broadcast(Some(origin), &frame) {
            log::error!("Failed to broadcast offline snapshot for {}: {e}", join.document_id);
        }
        drop(slot);
        log::info!("Adopted offline edits of {} for {}", join.user_id, join.document_id);
        self.stats.write().await.changes_relayed += 1;
        true
    }

    async fn relay_change(&self, origin: Uuid, change: ChangePayload) {
        let Some(room) = self.rooms.get(&change.document_id).await else {
            return;
        };

        let mut slot = room.document().await;
        let document = loaded(&mut slot, room.document_id(), self.store.as_deref());
        if let Err(reason) = apply_change(document, &change) {
            log::warn!("Rejected change for {} from {}: {reason}", change.document_id, change.source);
            self.stats.write().await.changes_rejected += 1;
            return;
        }

        // Broadcast under the document lock so frame order matches apply order.
        let message = SyncMessage::Changed(ChangedPayload::from(change));
        match room.group().broadcast(Some(origin), &message) {
            Ok(receivers) => {
                log::trace!("Relayed change in {} to {receivers} receivers", room.document_id());
                self.stats.write().await.changes_relayed += 1;
            }
            Err(e) => log::error!("Failed to encode change for {}: {e}", room.document_id()),
        }
        drop(slot);
    }

    async fn leave_room(&self, document_id: &str, connection: Uuid) {
        let mut persisted = false;
        let left = self
            .rooms
            .leave(document_id, connection, |id, document| {
                persisted = self.persist(id, document);
            })
            .await;
        let Some(left) = left else {
            return;
        };

        if left.emptied {
            log::info!("Room {document_id} removed (empty)");
        } else if let Err(e) = left.room.group().broadcast(None, &left.room.presence().await) {
            log::warn!("Failed to broadcast presence for {document_id}: {e}");
        }

        let mut s = self.stats.write().await;
        if persisted {
            s.persisted_snapshots += 1;
        }
        s.active_rooms = self.rooms.room_count().await;
    }

    /// Save a room's document. Empty documents that were never stored are skipped.
    fn persist(&self, document_id: &str, document: &Document) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        if document.is_empty() && !store.document_exists(document_id).unwrap_or(false) {
            return false;
        }
        let json = match document.to_json() {
            Ok(json) => json,
            Err(e) => {
                log::error!("Failed to serialize {document_id}: {e}");
                return false;
            }
        };
        match store.save_snapshot(document_id, &json) {
            Ok(meta) => {
                log::info!("Persisted {document_id} v{} ({} bytes)", meta.version, meta.compressed_size);
                true
            }
            Err(e) => {
                log::error!("Failed to persist {document_id}: {e}");
                false
            }
        }
    }
}

/// The room's document, loading it from storage on first use.
fn loaded<'a>(
    slot: &'a mut Option<Document>,
    document_id: &str,
    store: Option<&DocumentStore>,
) -> &'a mut Document {
    slot.get_or_insert_with(|| {
        let Some(store) = store else {
            return Document::new();
        };
        match store.load_snapshot(document_id).map(|json| Document::parse(&json)) {
            Ok(Ok(document)) => {
                log::info!("Loaded persisted snapshot for {document_id}");
                document
            }
            Ok(Err(e)) => {
                log::error!("Stored snapshot for {document_id} is invalid: {e}");
                Document::new()
            }
            Err(StoreError::NotFound(_)) => Document::new(),
            Err(e) => {
                log::error!("Failed to load {document_id}: {e}");
                Document::new()
            }
        }
    })
}

/// Apply a client change to the relay's copy. The delta is tried first;
/// the snapshot covers clients whose delta no longer applies.
fn apply_change(document: &mut Document, change: &ChangePayload) -> Result<(), String> {
    let mut reason = String::from("change carries neither delta nor snapshot");

    if let Some(delta) = &change.delta {
        match Delta::deserialize(delta) {
            Ok(delta) => match delta.apply_to(document) {
                Ok(()) => return Ok(()),
                Err(e) => reason = format!("delta: {e}"),
            },
            Err(e) => reason = format!("delta: {e}"),
        }
    }

    if let Some(snapshot) = &change.snapshot {
        match Document::from_value(snapshot.clone()) {
            Ok(replacement) => {
                *document = replacement;
                return Ok(());
            }
            Err(e) => reason = format!("snapshot: {e}"),
        }
    }

    Err(reason)
}

/// Snapshot frame for a joiner, or `None` when the room has no content.
async fn resync_frame(room: &DocumentRoom, store: Option<&DocumentStore>) -> Option<String> {
    let mut slot = room.document().await;
    let document = loaded(&mut slot, room.document_id(), store);
    if document.is_empty() {
        return None;
    }
    let snapshot = document.to_value().ok()?;
    SyncMessage::Changed(ChangedPayload::resync(room.document_id(), snapshot))
        .encode()
        .ok()
}

fn spawn_forwarder(
    room: Arc<DocumentRoom>,
    connection: Uuid,
    mut receiver: broadcast::Receiver<Arc<RoomFrame>>,
    outbox: mpsc::Sender<String>,
    store: Option<Arc<DocumentStore>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(frame) => {
                    if frame.is_from(connection) {
                        continue;
                    }
                    if outbox.send(frame.text.clone()).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Peer {connection} lagged by {skipped} frames in {}", room.document_id());
                    room.group().record_dropped(skipped);
                    // Skipped changes are unrecoverable; send the whole document.
                    if let Some(text) = resync_frame(&room, store.as_deref()).await {
                        if outbox.send(text).await.is_err() {
                            break;
                        }
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

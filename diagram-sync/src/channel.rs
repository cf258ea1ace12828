//! Realtime Channel: one shared WebSocket connection carrying every open
//! document's events.
//!
//! Incoming `changed` events are routed to the receiver registered by
//! [`RealtimeChannel::join`] for their document, after dropping echoes of
//! this client's own changes. Delivery is at-most-once: individual changes
//! are not queued while disconnected. Instead each document remembers the
//! latest snapshot it failed to send, and [`RealtimeChannel::reconnect`]
//! re-joins with it so the relay adopts the offline edits. Documents without
//! offline edits re-join plainly and the relay answers with its snapshot.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;

use crate::clock::VersionClock;
use crate::identity::ClientIdentity;
use crate::observer::AcceptedChange;
use crate::protocol::{ChangedPayload, PresencePayload, ProtocolError, SyncMessage};
use crate::snapshot_store::Snapshot;

const ROUTE_CAPACITY: usize = 256;
const OUTGOING_CAPACITY: usize = 256;

/// Connection lifecycle and presence notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected,
    Presence(PresencePayload),
}

struct Route {
    user_id: String,
    tx: mpsc::Sender<ChangedPayload>,
    /// Latest local snapshot that never reached the relay.
    unsent: Option<Snapshot>,
}

/// State shared with the connection's reader task.
struct Router {
    identity: ClientIdentity,
    routes: Mutex<HashMap<String, Route>>,
    /// Writer for the current connection, tagged with its generation.
    outgoing: Mutex<Option<(u64, mpsc::Sender<String>)>>,
    generations: AtomicU64,
    events: broadcast::Sender<ChannelEvent>,
    echoes_dropped: AtomicU64,
}

impl Router {
    fn route_frame(&self, text: &str) {
        let msg = match SyncMessage::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Discarding undecodable frame: {e}");
                return;
            }
        };
        match msg {
            SyncMessage::Changed(payload) => {
                if payload.source == Some(self.identity) {
                    self.echoes_dropped.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Dropped echo for {}", payload.document_id);
                    return;
                }
                let Ok(routes) = self.routes.lock() else {
                    return;
                };
                match routes.get(&payload.document_id) {
                    Some(route) => {
                        if let Err(e) = route.tx.try_send(payload) {
                            log::warn!("Dropping remote change: {e}");
                        }
                    }
                    None => log::debug!("No session for {}", payload.document_id),
                }
            }
            SyncMessage::Presence(presence) => {
                let _ = self.events.send(ChannelEvent::Presence(presence));
            }
            other => log::debug!("Ignoring client-side {} event", other.event_name()),
        }
    }

    fn send(&self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        let text = msg.encode()?;
        let outgoing = self.outgoing.lock().map_err(|_| ProtocolError::ConnectionClosed)?;
        let Some((_, tx)) = outgoing.as_ref() else {
            return Err(ProtocolError::ConnectionClosed);
        };
        tx.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                log::warn!("Outgoing queue full; dropping {} event", msg.event_name());
                ProtocolError::ConnectionClosed
            }
            mpsc::error::TrySendError::Closed(_) => ProtocolError::ConnectionClosed,
        })
    }

    /// Install a new writer and return its generation.
    fn attach(&self, tx: mpsc::Sender<String>) -> u64 {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        if let Ok(mut outgoing) = self.outgoing.lock() {
            *outgoing = Some((generation, tx));
        }
        generation
    }

    fn detach(&self, generation: u64) {
        if let Ok(mut outgoing) = self.outgoing.lock() {
            if matches!(outgoing.as_ref(), Some((g, _)) if *g == generation) {
                *outgoing = None;
            }
        }
    }

    fn hold_unsent(&self, document_id: &str, snapshot: Snapshot) {
        if let Ok(mut routes) = self.routes.lock() {
            if let Some(route) = routes.get_mut(document_id) {
                route.unsent = Some(snapshot);
            }
        }
    }

    /// Join frames for every routed document, carrying unsent snapshots.
    fn joins(&self) -> Vec<(String, SyncMessage)> {
        let Ok(routes) = self.routes.lock() else {
            return Vec::new();
        };
        routes
            .iter()
            .map(|(doc, route)| {
                let plain = || SyncMessage::join(doc.as_str(), route.user_id.as_str(), self.identity);
                let join = match &route.unsent {
                    Some(snapshot) => SyncMessage::rejoin(
                        doc.as_str(),
                        route.user_id.as_str(),
                        self.identity,
                        snapshot,
                    )
                    .unwrap_or_else(|e| {
                        log::warn!("Unsent snapshot for {doc} dropped: {e}");
                        plain()
                    }),
                    None => plain(),
                };
                (doc.clone(), join)
            })
            .collect()
    }

    fn rejoin_all(&self) -> Result<(), ProtocolError> {
        for (document_id, join) in self.joins() {
            self.send(&join)?;
            if let Ok(mut routes) = self.routes.lock() {
                if let Some(route) = routes.get_mut(&document_id) {
                    route.unsent = None;
                }
            }
        }
        Ok(())
    }
}

pub struct RealtimeChannel {
    router: Arc<Router>,
    clock: Mutex<VersionClock>,
    url: Option<String>,
}

impl RealtimeChannel {
    fn with_url(identity: ClientIdentity, url: Option<String>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            router: Arc::new(Router {
                identity,
                routes: Mutex::new(HashMap::new()),
                outgoing: Mutex::new(None),
                generations: AtomicU64::new(0),
                events,
                echoes_dropped: AtomicU64::new(0),
            }),
            clock: Mutex::new(VersionClock::new()),
            url,
        }
    }

    /// Open the shared connection.
    pub async fn connect(url: impl Into<String>, identity: ClientIdentity) -> Result<Self, ProtocolError> {
        let channel = Self::with_url(identity, Some(url.into()));
        channel.open().await?;
        Ok(channel)
    }

    /// Unconnected channel whose outgoing frames land in the returned
    /// receiver. Incoming frames are fed with [`RealtimeChannel::deliver`].
    pub fn loopback(identity: ClientIdentity) -> (Self, mpsc::Receiver<String>) {
        let channel = Self::with_url(identity, None);
        let (tx, rx) = mpsc::channel(OUTGOING_CAPACITY);
        channel.router.attach(tx);
        (channel, rx)
    }

    async fn open(&self) -> Result<(), ProtocolError> {
        let Some(url) = self.url.as_deref() else {
            return Err(ProtocolError::ConnectFailed("loopback channel has no url".into()));
        };
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ProtocolError::ConnectFailed(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTGOING_CAPACITY);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let generation = self.router.attach(out_tx);
        log::info!("Connected to {url}");
        let _ = self.router.events.send(ChannelEvent::Connected);

        // Re-join anything routed before this connection existed.
        self.router.rejoin_all()?;

        let router = self.router.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => router.route_frame(text.as_str()),
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            router.detach(generation);
            log::info!("Realtime connection closed");
            let _ = router.events.send(ChannelEvent::Disconnected);
        });

        Ok(())
    }

    /// Open a fresh connection and re-join every routed document.
    pub async fn reconnect(&self) -> Result<(), ProtocolError> {
        self.open().await
    }

    /// Close the current connection. Routes stay registered for
    /// [`RealtimeChannel::reconnect`].
    pub fn disconnect(&self) {
        let writer = self.router.outgoing.lock().ok().and_then(|mut o| o.take());
        if writer.is_some() {
            log::info!("Disconnecting realtime channel");
        }
    }

    pub fn identity(&self) -> ClientIdentity {
        self.router.identity
    }

    pub fn is_connected(&self) -> bool {
        self.router
            .outgoing
            .lock()
            .map(|o| o.as_ref().is_some_and(|(_, tx)| !tx.is_closed()))
            .unwrap_or(false)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.router.events.subscribe()
    }

    /// Register `document_id` and announce it to the relay.
    ///
    /// The returned receiver yields peers' changes for that document. A later
    /// join for the same document replaces the earlier route.
    pub fn join(&self, document_id: &str, user_id: &str) -> mpsc::Receiver<ChangedPayload> {
        let (tx, rx) = mpsc::channel(ROUTE_CAPACITY);
        if let Ok(mut routes) = self.router.routes.lock() {
            routes.insert(
                document_id.to_string(),
                Route {
                    user_id: user_id.to_string(),
                    tx,
                    unsent: None,
                },
            );
        }
        if let Err(e) = self
            .router
            .send(&SyncMessage::join(document_id, user_id, self.router.identity))
        {
            log::warn!("Join for {document_id} not sent: {e}");
        }
        rx
    }

    pub fn leave(&self, document_id: &str) {
        let removed = self
            .router
            .routes
            .lock()
            .map(|mut routes| routes.remove(document_id).is_some())
            .unwrap_or(false);
        if removed {
            if let Err(e) = self.router.send(&SyncMessage::leave(document_id)) {
                log::debug!("Leave for {document_id} not sent: {e}");
            }
        }
    }

    /// Broadcast an accepted local change. Never blocks. When disconnected
    /// the snapshot is held for the next re-join.
    pub fn emit_change(&self, document_id: &str, change: &AcceptedChange) -> Result<(), ProtocolError> {
        let version = self
            .clock
            .lock()
            .map(|mut clock| clock.tick())
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        let msg = SyncMessage::change(
            document_id,
            change.delta.as_ref(),
            Some(&*change.snapshot),
            version,
            self.router.identity,
        )?;
        let sent = self.router.send(&msg);
        if sent.is_err() {
            self.router.hold_unsent(document_id, change.snapshot.clone());
        }
        sent
    }

    /// Feed one incoming frame, as the connection's reader does.
    pub fn deliver(&self, text: &str) {
        self.router.route_frame(text);
    }

    pub fn echoes_dropped(&self) -> u64 {
        self.router.echoes_dropped.load(Ordering::Relaxed)
    }
}

//! # diagram-sync: collaborative synchronization for UML class diagrams
//!
//! Keeps one diagram consistent across the local editor engine, a REST
//! document store and other clients connected through a WebSocket relay.
//!
//! ## Architecture
//!
//! ```text
//!  engine events            ┌──────────────┐   debounced PUT   ┌──────────────┐
//! ───────────────► Observer │ SnapshotStore│ ────────────────► │ DiagramStore │
//!                    │      └──────────────┘                   │ (REST)       │
//!                    │ change{delta, snapshot}                 └──────────────┘
//!                    ▼
//!           ┌─────────────────┐   WebSocket   ┌─────────────┐
//!           │ RealtimeChannel │ ◄───────────► │ SyncServer  │──► RocksDB
//!           └────────┬────────┘               │ (relay)     │
//!                    │ changed                └─────────────┘
//!                    ▼
//!               Reconciler ──► engine (phase = ApplyingRemote, events discarded)
//! ```
//!
//! ## Modules
//!
//! - [`session`]: one open diagram wiring every piece together
//! - [`observer`] / [`reconciler`]: outbound and inbound halves of the loop
//! - [`phase`]: Loading / Idle / Editing / ApplyingRemote state machine
//! - [`snapshot_store`]: canonical snapshot cell with change notification
//! - [`debounce`]: trailing-edge persistence with one write in flight
//! - [`remote`]: REST document store client
//! - [`protocol`] / [`channel`]: realtime wire format and client transport
//! - [`broadcast`] / [`server`] / [`storage`]: the relay
//! - [`registry`]: lookup of open sessions by document id

pub mod broadcast;
pub mod channel;
pub mod clock;
pub mod config;
pub mod debounce;
pub mod identity;
pub mod observer;
pub mod phase;
pub mod protocol;
pub mod reconciler;
pub mod registry;
pub mod remote;
pub mod server;
pub mod session;
pub mod snapshot_store;
pub mod storage;

pub use broadcast::{BroadcastGroup, BroadcastStats, DocumentRoom, RoomError, RoomFrame, RoomManager};
pub use channel::{ChannelEvent, RealtimeChannel};
pub use clock::VersionClock;
pub use config::SyncConfig;
pub use debounce::{DebounceStats, DebouncerHandle, PersistenceDebouncer, DEFAULT_DEBOUNCE};
pub use identity::ClientIdentity;
pub use observer::{AcceptedChange, ChangeObserver, IgnoreReason, Observation};
pub use phase::{PhaseError, PhaseGuard, PhaseMachine, SyncPhase};
pub use protocol::{
    ChangePayload, ChangedPayload, Incoming, JoinPayload, LeavePayload, PresencePayload,
    PresencePeer, ProtocolError, SyncMessage,
};
pub use reconciler::{ReconcileOutcome, RemoteReconciler};
pub use registry::{SessionContext, SessionRegistry};
pub use remote::{
    api_url, DiagramRecord, DiagramStore, HttpDiagramStore, MemoryDiagramStore, RemoteStoreError,
    SaveRequest,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::DiagramSession;
pub use snapshot_store::{ModelSnapshotStore, Snapshot};
pub use storage::{DocumentMetadata, DocumentStore, StoreConfig, StoreError};

//! Relay persistence.
//!
//! ```text
//! ┌─────────────┐  room emptied   ┌───────────────┐
//! │ SyncServer  │ ──────────────► │ DocumentStore │
//! │ (rooms)     │ ◄────────────── │ (RocksDB)     │
//! └─────────────┘  first join     └──────┬────────┘
//!                                        │
//!                     CF "documents": LZ4 JSON snapshots
//!                     CF "metadata": version, counts, sizes
//! ```

pub mod rocks;

pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig, StoreError};

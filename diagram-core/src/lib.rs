//! # diagram-core: Class-diagram model for collaborative editing
//!
//! Holds the canonical document shared by the canvas engine, the persistence
//! layer and the network layer.
//!
//! ```text
//! ┌──────────────┐  transact()   ┌──────────────┐  Delta::between  ┌─────────┐
//! │ user gesture │ ────────────► │ DiagramEngine│ ───────────────► │  Delta  │
//! └──────────────┘               │  (Document)  │ ◄─────────────── │ (JSON)  │
//!                                └──────────────┘   apply_delta    └─────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`]: Document, Node, Link, normalization and relation dedup
//! - [`geometry`]: `"x y"` encoded points and sizes
//! - [`delta`]: Per-transaction change lists (diff + atomic apply)
//! - [`engine`]: Engine seam and the headless `MemoryEngine`

pub mod delta;
pub mod engine;
pub mod geometry;
pub mod model;

pub use delta::{Delta, DeltaError, ModelChange};
pub use engine::{DiagramEngine, MemoryEngine, TransactionEvent};
pub use geometry::{Point, Size};
pub use model::{
    Attribute, Document, Link, LinkCategory, ModelError, Node, Operation, GRAPH_LINKS_MODEL,
};

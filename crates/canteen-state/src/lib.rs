//! canteen-state — domain types and embedded state for a Canteen node.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for the node's identity, container records, deployment request
//! outcomes, the ledger sync cursor, and (for the development ledger) the
//! append-only event log itself.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Ledger events are keyed by a zero-padded sequence number so that a plain
//! range scan yields them in order.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;

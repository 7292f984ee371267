//! canteen-ledger — the node's view of the external registry.
//!
//! The ledger is the source of deployment requests and the total order for
//! assignment finality: an outcome only takes effect once its commitment is
//! anchored, and the first anchor for a request wins.
//!
//! - [`client`]: the [`LedgerClient`] contract and the redb-backed [`StoreLedger`]
//! - [`http`]: `/ledger/*` routes over a `StoreLedger` and the [`HttpLedger`] client
//! - [`retry`]: bounded exponential backoff for RPCs
//! - [`sync`]: cursor-based event polling with commit/release, anchoring,
//!   degraded status

pub mod client;
pub mod error;
pub mod http;
pub mod retry;
pub mod sync;

pub use client::{LedgerClient, StoreLedger, anchor_key};
pub use error::{LedgerError, LedgerResult};
pub use http::{HttpLedger, ledger_router};
pub use retry::RetryConfig;
pub use sync::{AnchorReceipt, LedgerHealth, LedgerSync, SyncConfig};

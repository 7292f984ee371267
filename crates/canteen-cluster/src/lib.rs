//! canteen-cluster — SWIM-style membership for Canteen nodes.
//!
//! Every node keeps its own eventually-consistent Cluster View. Liveness is
//! established by periodic probing and spread by bounded-fanout gossip
//! piggybacked on probe traffic; the same channel carries encrypted
//! telemetry, container status, and assignment notices.
//!
//! # Architecture
//!
//! ```text
//! SwimHandle (cloneable)
//!   ├── join / probe / current_view / publish / leave
//!   └── commands ──► swim actor (single owner)
//!                     ├── Membership core
//!                     │   ├── merge rule: incarnation, then DEAD > SUSPECT > ALIVE
//!                     │   ├── suspicion timer (K rounds → DEAD)
//!                     │   └── DisseminationQueue (retransmit mult·log n)
//!                     ├── probe workers (Semaphore-bounded)
//!                     │   └── ping → ping-req via k helpers
//!                     └── watch<ClusterView>, broadcast<GossipEvent>
//!
//! GossipTransport
//!   ├── HttpTransport  ── POST /gossip (server::gossip_router)
//!   └── MemoryNetwork  ── in-process, loss / partition injection
//! ```

pub mod dissemination;
pub mod error;
pub mod http_client;
pub mod membership;
pub mod message;
pub mod server;
pub mod swim;
pub mod transport;

pub use error::{ClusterError, ClusterResult};
pub use membership::{Membership, MembershipConfig, generate_node_id};
pub use message::{Envelope, MemberUpdate, MessageKind, Piggyback};
pub use server::gossip_router;
pub use swim::{GossipEvent, SwimConfig, SwimHandle};
pub use transport::{GossipTransport, HttpTransport, MemoryNetwork};

//! canteen-enforcer — makes this node run what the ledger says it should.
//!
//! Released assignments become supervised container replicas. Each replica
//! walks the lifecycle in [`lifecycle`]; unhealthy replicas are restarted in
//! place a bounded number of times and then fail, which raises a
//! [`RescheduleSignal`] so the cluster can place the replica elsewhere.
//!
//! # Architecture
//!
//! ```text
//! EnforcerHandle ── apply / remove_image / list / shutdown ──► enforcer actor
//!                                                               ├── CONTAINERS table (owner)
//!                                                               ├── host port allocation
//!                                                               └── Supervisor task per replica
//!                                                                     pull ► start ► probe ► restart
//!                                                                     └── Report ──► actor
//! actor ──► StatusUpdate (gossip)   actor ──► RescheduleSignal (ledger)
//! ```

pub mod anchor;
pub mod checker;
pub mod enforcer;
pub mod error;
pub mod lifecycle;
pub mod runtime;
pub mod supervisor;

pub use anchor::run_status_anchor;
pub use enforcer::{EnforcerConfig, EnforcerHandle, RescheduleSignal, port_base, spawn};
pub use error::{EnforcerError, EnforcerResult};
pub use runtime::{ContainerRuntime, DockerRuntime, HttpCheck, MemoryRuntime, StartSpec};
pub use supervisor::SupervisorConfig;

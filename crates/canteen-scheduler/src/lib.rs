//! canteen-scheduler — telemetry and per-request scheduling for a node.
//!
//! # Architecture
//!
//! ```text
//! TelemetryPublisher ── every interval ──► encrypt(capacity, load, priority)
//!   │                                          ├── swim.publish(Telemetry)
//!   └──────────────────────────────────────────┴── coordinator.observe_telemetry
//!
//! Coordinator (single owner of telemetry table + request queue)
//!   ├── ledger events:  ImageAdded → queue, ImageDeployment → verify, record, enforce
//!   ├── watch<ClusterView>: leadership recomputed, lost evaluations aborted
//!   ├── gossip:  telemetry, container status, assignment notices
//!   ├── ImageScaled / ImageDeployment → scaling::surplus_slots → stop local surplus
//!   ├── enforcer: status → gossip, reschedule → ledger add_image → acknowledge
//!   └── evaluation task per led request
//!         precheck → spawn_blocking(evaluate_schedule) → release (timeout)
//!         → finalize → anchor → gossip notice
//! ```

pub mod coordinator;
pub mod error;
pub mod registration;
pub mod scaling;
pub mod telemetry;

pub use coordinator::{
    CoordinatorConfig, CoordinatorHandle, CoordinatorInputs, DeploymentsSnapshot, PendingRequest,
    SchedulingContext, spawn,
};
pub use error::{SchedulerError, SchedulerResult};
pub use registration::{NodeRegistration, RegistrationConfig};
pub use scaling::surplus_slots;
pub use telemetry::{TelemetryConfig, TelemetryPublisher, collect_local_metrics};

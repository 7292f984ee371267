//! canteen-placement — scheduling decisions evaluated over ciphertext.
//!
//! Given the freshest encrypted telemetry of every ALIVE node, the elected
//! leader for a request runs a least-loaded-first packing entirely under
//! encryption, producing an [`EncryptedAssignment`]. Only a
//! [`DecryptionAuthority`] can turn that into a plaintext placement, which is
//! then committed to by hash before being anchored on the ledger.
//!
//! - [`fhe`]: the opaque encrypted-arithmetic capability and a simulated backend
//! - [`packing`]: input selection and the oblivious packing evaluation
//! - [`authority`]: the release capability and outcome finalisation
//! - [`leader`]: deterministic per-request leader election
//! - [`commitment`]: commitment hashes over outcomes and status digests

pub mod authority;
pub mod commitment;
pub mod error;
pub mod fhe;
pub mod leader;
pub mod packing;

pub use authority::{DecryptionAuthority, KeyAuthority, ReleasedAssignment, finalize};
pub use error::{PlacementError, PlacementResult};
pub use fhe::{FheBackend, SchedulingKey, SimulatedFhe};
pub use leader::{elect_leader, is_leader};
pub use packing::{EncryptedAssignment, MAX_REPLICAS, evaluate_schedule, precheck, select_inputs};

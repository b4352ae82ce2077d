//! wpo-leader: one active operator per scope.
//!
//! Candidates compete for a `coordination.k8s.io/v1` Lease. The holder
//! renews it every retry period; anyone else may take it over once the
//! holder's renew time plus the lease duration has passed.
//!
//! # Architecture
//!
//! ```text
//! LeaderElector::gate(engine)
//!   ├── Candidate: try_acquire_or_renew() every retry period
//!   ├── Leader:    engine runs, lease renewed every retry period
//!   └── NotLeader: no successful renewal within the renew deadline
//!                  → engine cancelled, gate returns LostLease
//! ```
//!
//! The caller is expected to exit the process on `LostLease`; the engine's
//! in-memory indexes are not torn down in place.

pub mod elector;
pub mod error;
pub mod lease;

pub use elector::{LeaderElector, LeaderExit, LeaderState};
pub use error::{LeaderError, LeaderResult};
pub use lease::{LeaseConfig, LeaseRecord, lease_kind};

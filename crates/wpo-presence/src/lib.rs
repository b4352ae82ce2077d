//! wpo-presence: keeping objects alive and namespaces populated.
//!
//! # Architecture
//!
//! ```text
//! ExistenceGuard (one per singleton object)
//!   ├── ensure_exists() at start, under a busy/idle lock
//!   ├── watch task: deletion marker → recreate_when_gone()
//!   └── stop(): cancel, join watch task, wait for idle
//!
//! NamespacePopulationIndex (one per kind)
//!   ├── namespace → member names
//!   ├── populated callbacks (registration order)
//!   └── emptied callbacks (reverse registration order)
//!
//! NamespaceProvisioner
//!   └── per-namespace support objects, driven by a population index
//! ```
//!
//! A deletion marker precedes actual removal while finalizers run, so a
//! guard polls for true absence before recreating. An object that stays
//! marked past the retry budget is a fatal [`GuardError::Zombie`].

pub mod error;
pub mod guard;
pub mod population;
pub mod provisioner;

pub use error::{GuardError, GuardResult};
pub use guard::{Ensured, ExistenceGuard, GuardState, RecreatePolicy};
pub use population::{NamespaceCallback, NamespacePopulationIndex, Transitions};
pub use provisioner::NamespaceProvisioner;

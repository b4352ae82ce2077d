//! wpo-store: cluster object access for the WordPress operator.
//!
//! # Architecture
//!
//! Objects are handled as immutable JSON snapshots ([`ManagedObject`])
//! identified by kind plus `(namespace, name)`. The [`ResourceStore`]
//! trait is the only seam between operator logic and the cluster:
//!
//! - [`KubeStore`] speaks to a real API server through kube-rs.
//! - [`InMemoryStore`] mirrors the API server semantics in process and
//!   backs every test.
//!
//! Not-found and conflict responses surface as distinct
//! [`StoreError`] variants so callers can treat them as the idempotent
//! outcomes they usually are.

pub mod cluster;
pub mod error;
pub mod manifest;
pub mod store;
pub mod types;

pub use cluster::KubeStore;
pub use error::{StoreError, StoreResult};
pub use store::{InMemoryStore, ResourceStore, WatchStream, merge_patch, replacement_patch};
pub use types::*;

//! Placement error types.

use thiserror::Error;

/// Errors that can occur while placing a database.
#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("no database shard available in namespace {0}")]
    NoShardAvailable(String),

    #[error("database {0} does not reference a shard")]
    MissingShardRef(String),

    #[error("store error: {0}")]
    Store(#[from] wpo_store::StoreError),
}

pub type PlacementResult<T> = Result<T, PlacementError>;

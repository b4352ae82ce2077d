//! Error types for leader election.

use thiserror::Error;

use wpo_store::StoreError;

/// Result type alias for leader election.
pub type LeaderResult<T> = Result<T, LeaderError>;

#[derive(Debug, Error)]
pub enum LeaderError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid leader election settings: {0}")]
    Config(String),

    #[error("lease {lease} is malformed: {message}")]
    MalformedLease { lease: String, message: String },
}

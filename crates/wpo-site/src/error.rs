//! Error types for site reconciliation.

use thiserror::Error;

use wpo_placement::PlacementError;
use wpo_routing::RouteError;
use wpo_store::StoreError;

/// Result type alias for site reconciliation.
pub type SiteResult<T> = Result<T, SiteError>;

/// Result type alias for mutation executor calls.
pub type ExecResult<T> = Result<T, ExecError>;

/// Failures of the external mutation executor.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("cannot spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} failed (exit code {code:?}): {stderr}")]
    Failed {
        operation: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{operation} output lacks success marker {marker:?}")]
    MissingMarker { operation: String, marker: String },

    #[error("{0} is not supported by this executor")]
    Unsupported(String),

    #[error("cannot parse {operation} output: {message}")]
    BadOutput { operation: String, message: String },
}

/// Errors that can abort a reconciliation pass.
#[derive(Debug, Error)]
pub enum SiteError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("create {object} timed out or failed, last condition message: {message}")]
    NotReady { object: String, message: String },

    #[error(transparent)]
    Executor(#[from] ExecError),

    #[error("invalid site {site}: {message}")]
    InvalidSpec { site: String, message: String },

    #[error("secret {secret} has no usable key {key}")]
    MissingSecret { secret: String, key: String },

    #[error("cannot generate password: {0}")]
    Entropy(String),
}

impl SiteError {
    /// Fatal errors fail the pass and are logged as errors.
    pub fn is_fatal(&self) -> bool {
        match self {
            SiteError::NotReady { .. }
            | SiteError::Executor(_)
            | SiteError::InvalidSpec { .. }
            | SiteError::MissingSecret { .. } => true,
            SiteError::Placement(PlacementError::MissingShardRef(_)) => true,
            SiteError::Store(StoreError::Invalid(_)) => true,
            SiteError::Store(_) | SiteError::Placement(_) | SiteError::Route(_) | SiteError::Entropy(_) => false,
        }
    }

    /// Whether a resync of the unchanged site may try again. Executor
    /// failures leave status unpatched, so the next pass starts over.
    pub fn is_retryable(&self) -> bool {
        !self.is_fatal() || matches!(self, SiteError::Executor(_))
    }
}

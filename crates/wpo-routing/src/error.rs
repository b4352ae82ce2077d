//! Routing error types.

use thiserror::Error;

/// Errors that can occur while managing routes.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("store error: {0}")]
    Store(#[from] wpo_store::StoreError),
}

pub type RouteResult<T> = Result<T, RouteError>;

//! Existence guard error types.

use thiserror::Error;

/// Errors raised by an existence guard.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("store error: {0}")]
    Store(#[from] wpo_store::StoreError),

    #[error("zombie {object} won't die after {attempts} checks")]
    Zombie { object: String, attempts: u32 },
}

impl GuardError {
    /// Fatal errors cannot be fixed by retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GuardError::Zombie { .. })
    }
}

pub type GuardResult<T> = Result<T, GuardError>;

//! Error types for QETL.

use thiserror::Error;

use crate::job::JobState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn job_not_found(id: impl std::fmt::Display) -> Self {
        Error::NotFound(format!("job {}", id))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

//! Job domain error model.

use thiserror::Error;

use crate::job::JobState;

/// Result type used across the job domain layer.
pub type DomainResult<T> = Result<T, JobError>;

/// Job-level error.
///
/// Keep this focused on deterministic failures of the job model itself
/// (illegal transitions, undecodable records). Store and transport concerns
/// belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// A mutator was applied against an incompatible current state.
    ///
    /// This indicates a duplicate or late callback, not a request failure.
    #[error("invalid transition: cannot {action} a {from} job")]
    InvalidTransition { from: JobState, action: &'static str },

    /// A persisted record could not be decoded back into a `JobRecord`.
    #[error("corrupt job record: {0}")]
    Corrupt(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl JobError {
    pub fn invalid_transition(from: JobState, action: &'static str) -> Self {
        Self::InvalidTransition { from, action }
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

//! Error types for ABX Core
//!
//! Provides error handling for:
//! - Request validation (creation and update)
//! - Illegal lifecycle transitions
//! - Corrupt experiment records
//! - Repository, harness and publisher collaborators

use crate::types::{ExperimentId, ExperimentStatus};

/// Main engine error type
#[derive(Debug, thiserror::Error)]
pub enum ExperimentError {
    /// Bad request shape, rejected before any state is touched
    #[error("validation failed: {0}")]
    Validation(String),

    /// Operation not legal in the current lifecycle state
    #[error("cannot {action} experiment in state {current}")]
    IllegalTransition {
        /// Attempted operation
        action: String,
        /// State the experiment was in
        current: ExperimentStatus,
    },

    /// Persisted record breaks a structural invariant
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Experiment does not exist
    #[error("experiment not found: {0}")]
    NotFound(ExperimentId),

    /// Repository failure
    #[error("repository error: {0}")]
    Repository(RepositoryError),

    /// Winner publication failed
    #[error("publish error: {0}")]
    Publish(#[from] PublishError),

    /// Engine configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl ExperimentError {
    /// Shorthand for a validation error
    #[inline]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Shorthand for an illegal transition
    #[inline]
    pub fn illegal(action: impl Into<String>, current: ExperimentStatus) -> Self {
        Self::IllegalTransition {
            action: action.into(),
            current,
        }
    }

    /// Check if a fresh attempt may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Repository(RepositoryError::Conflict { .. } | RepositoryError::Storage(_))
                | Self::Publish(PublishError::Unavailable(_))
        )
    }

    /// Check if the experiment can no longer be driven
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation(_) | Self::NotFound(_))
    }
}

impl From<RepositoryError> for ExperimentError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::NotFound(id) => Self::NotFound(id),
            other => Self::Repository(other),
        }
    }
}

/// Per-sample execution harness errors
///
/// These never leave the batch runner: a failed sample is dropped from the batch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HarnessError {
    /// Provider call failed
    #[error("execution failed: {0}")]
    Failed(String),

    /// Call exceeded its time bound
    #[error("execution timed out after {duration_ms}ms")]
    Timeout {
        /// Bound that was exceeded
        duration_ms: u64,
    },

    /// Provider not reachable
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

/// Repository errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    /// No record under this id
    #[error("no record for {0}")]
    NotFound(ExperimentId),

    /// Stale write: the record changed since it was loaded
    #[error("revision conflict (expected {expected}, found {actual})")]
    Conflict {
        /// Revision the writer loaded
        expected: u64,
        /// Revision currently stored
        actual: u64,
    },

    /// Backend failure
    #[error("storage failure: {0}")]
    Storage(String),
}

/// Version-lifecycle publisher errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum PublishError {
    /// Publisher refused the configuration
    #[error("adoption rejected: {0}")]
    Rejected(String),

    /// Publisher not reachable
    #[error("publisher unavailable: {0}")]
    Unavailable(String),
}

//! Queue error types.

use thiserror::Error;

use tflow_models::{JobState, ModelError};
use tflow_storage::StorageError;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {job_id}: transition '{transition}' is not allowed from state {state}")]
    InvalidStateTransition {
        job_id: String,
        state: JobState,
        transition: &'static str,
    },

    #[error("Job {0} is being updated concurrently, giving up")]
    Contention(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl QueueError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn job_not_found(id: impl Into<String>) -> Self {
        Self::JobNotFound(id.into())
    }

    /// Whether the error means the job moved on before the caller got to it.
    pub fn is_lost_race(&self) -> bool {
        matches!(
            self,
            QueueError::InvalidStateTransition { .. } | QueueError::JobNotFound(_)
        )
    }

    /// Whether the same call may succeed if repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Storage(_) | QueueError::Contention(_))
    }
}

impl From<ModelError> for QueueError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::InvalidPriority(p) => {
                QueueError::Validation(format!("priority {} is outside 1..=10", p))
            }
            ModelError::Validation(msg) => QueueError::Validation(msg),
            ModelError::InvalidStateTransition {
                job_id,
                state,
                transition,
            } => QueueError::InvalidStateTransition {
                job_id,
                state,
                transition,
            },
        }
    }
}

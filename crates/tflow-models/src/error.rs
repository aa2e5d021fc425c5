//! Model validation and transition errors.

use thiserror::Error;

use crate::job::JobState;

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("Priority {0} is outside 1..=10")]
    InvalidPriority(u8),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Job {job_id}: transition '{transition}' is not allowed from state {state}")]
    InvalidStateTransition {
        job_id: String,
        state: JobState,
        transition: &'static str,
    },
}

impl ModelError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_transition(
        job_id: impl Into<String>,
        state: JobState,
        transition: &'static str,
    ) -> Self {
        Self::InvalidStateTransition {
            job_id: job_id.into(),
            state,
            transition,
        }
    }
}

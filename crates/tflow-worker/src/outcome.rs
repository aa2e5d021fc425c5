//! Outcome of one job attempt, consumed by the pool's retry logic.

use tflow_models::OutputDescriptor;

use crate::engine::EngineFailure;
use crate::error::WorkerError;

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success(OutputDescriptor),
    /// Retry if attempts remain
    TransientFailure(String),
    /// Fail without retry
    PermanentFailure(String),
    Cancelled,
    /// Stopped by worker shutdown; the job goes back to the queue with
    /// its attempt counted.
    Interrupted(String),
}

impl JobOutcome {
    /// Classify a worker error.
    pub fn from_error(err: &WorkerError) -> Self {
        if err.is_retryable() {
            JobOutcome::TransientFailure(err.to_string())
        } else {
            JobOutcome::PermanentFailure(err.to_string())
        }
    }

    /// Classify an engine failure. `cancel_requested` wins over the
    /// engine's own classification.
    pub fn from_engine_failure(failure: EngineFailure, cancel_requested: bool) -> Self {
        if cancel_requested || failure.is_cancelled() {
            return JobOutcome::Cancelled;
        }
        Self::from_error(&WorkerError::from(failure))
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Success(_) => "success",
            JobOutcome::TransientFailure(_) => "transient_failure",
            JobOutcome::PermanentFailure(_) => "permanent_failure",
            JobOutcome::Cancelled => "cancelled",
            JobOutcome::Interrupted(_) => "interrupted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_engine_failures_classify() {
        assert!(matches!(
            JobOutcome::from_engine_failure(EngineFailure::transient("io", "stall"), false),
            JobOutcome::TransientFailure(_)
        ));
        assert!(matches!(
            JobOutcome::from_engine_failure(EngineFailure::permanent("codec", "vp9"), false),
            JobOutcome::PermanentFailure(_)
        ));
        assert_eq!(
            JobOutcome::from_engine_failure(EngineFailure::transient("io", "stall"), true),
            JobOutcome::Cancelled
        );
        assert_eq!(
            JobOutcome::from_engine_failure(EngineFailure::cancelled(), false),
            JobOutcome::Cancelled
        );
    }

    #[test]
    fn test_timeout_is_transient() {
        let outcome = JobOutcome::from_error(&WorkerError::Timeout(Duration::from_secs(5)));
        assert!(matches!(outcome, JobOutcome::TransientFailure(msg) if msg.contains("deadline")));
    }
}

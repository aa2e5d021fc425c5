//! Worker error types.

use std::time::Duration;

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Transcode failed [{code}]: {message}")]
    Engine {
        code: String,
        message: String,
        transient: bool,
    },

    #[error("Job exceeded its {0:?} deadline")]
    Timeout(Duration),

    #[error("Metrics exporter error: {0}")]
    Metrics(String),

    #[error("Queue error: {0}")]
    Queue(#[from] tflow_queue::QueueError),
}

impl WorkerError {
    pub fn engine(code: impl Into<String>, message: impl Into<String>, transient: bool) -> Self {
        Self::Engine {
            code: code.into(),
            message: message.into(),
            transient,
        }
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkerError::Engine {
                transient: true,
                ..
            } | WorkerError::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let transient = WorkerError::engine("io", "read stalled", true);
        assert!(transient.is_retryable());

        let permanent = WorkerError::engine("codec", "unsupported codec", false);
        assert!(!permanent.is_retryable());

        assert!(WorkerError::Timeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn test_engine_error_message() {
        let err = WorkerError::engine("codec", "unsupported codec", false);
        assert_eq!(err.to_string(), "Transcode failed [codec]: unsupported codec");
    }
}

//! Structured job logging utilities.

use tracing::{error, info, warn, Span};

use tflow_models::TranscodeJob;

/// Logs the lifecycle of one job attempt with consistent fields.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    slot: String,
    attempt: u32,
    max_attempts: u32,
}

impl JobLogger {
    pub fn new(job: &TranscodeJob, slot: &str) -> Self {
        Self {
            job_id: job.id.to_string(),
            slot: slot.to_string(),
            attempt: job.attempt_count,
            max_attempts: job.max_attempts,
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            slot = %self.slot,
            attempt = self.attempt,
            max_attempts = self.max_attempts,
            "Job started: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            slot = %self.slot,
            attempt = self.attempt,
            "Job warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            slot = %self.slot,
            attempt = self.attempt,
            "Job error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            slot = %self.slot,
            attempt = self.attempt,
            "Job completed: {}", message
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    /// Span covering the whole attempt.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            slot = %self.slot,
            attempt = self.attempt
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tflow_models::{AssetId, Preset, Priority, ResourceClass};

    #[test]
    fn test_job_logger_creation() {
        let job = TranscodeJob::new(
            AssetId::new(),
            Preset::new("h264-720p"),
            Priority::new(5).unwrap(),
            ResourceClass::Gpu,
            3,
        )
        .unwrap();
        let logger = JobLogger::new(&job, "gpu-0");

        assert_eq!(logger.job_id(), job.id.to_string());
        assert_eq!(logger.slot(), "gpu-0");
    }
}

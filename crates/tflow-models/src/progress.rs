//! Progress and lifecycle events fanned out by the event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::JobId;

/// What a [`ProgressEvent`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Queued,
    Started,
    Progress,
    /// Transient failure, job waits for backoff
    Retrying,
    /// Returned to the queue by crash recovery
    Requeued,
    Completed,
    Failed,
    Cancelled,
}

impl ProgressPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressPhase::Queued => "queued",
            ProgressPhase::Started => "started",
            ProgressPhase::Progress => "progress",
            ProgressPhase::Retrying => "retrying",
            ProgressPhase::Requeued => "requeued",
            ProgressPhase::Completed => "completed",
            ProgressPhase::Failed => "failed",
            ProgressPhase::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressPhase::Completed | ProgressPhase::Failed | ProgressPhase::Cancelled
        )
    }
}

/// A state or progress change of one job.
///
/// `seq` is assigned by the bus at publish time and increases strictly
/// per job; it is 0 on events that have not been published yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub phase: ProgressPhase,
    /// 0-100
    pub percent: u8,
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(job_id: JobId, phase: ProgressPhase, percent: u8) -> Self {
        Self {
            job_id,
            phase,
            percent: percent.min(100),
            seq: 0,
            attempt: 0,
            message: None,
            timestamp: Utc::now(),
        }
    }

    /// Engine progress report.
    pub fn progress(job_id: JobId, attempt: u32, percent: u8) -> Self {
        Self::new(job_id, ProgressPhase::Progress, percent).with_attempt(attempt)
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

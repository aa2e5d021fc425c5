//! Transcode job record and lifecycle rules.
//!
//! A [`TranscodeJob`] only changes through [`TranscodeJob::apply`], which
//! takes a [`Transition`] and returns the next version of the record. The
//! function is pure; persisting the result with compare-and-swap is the
//! job of the state machine in `tflow-queue`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ModelError, ModelResult};
use crate::{AssetId, JobId};

/// Most urgent priority.
pub const MIN_PRIORITY: u8 = 1;
/// Least urgent priority.
pub const MAX_PRIORITY: u8 = 10;

/// Job priority, 1 (most urgent) to 10 (least urgent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub fn new(value: u8) -> ModelResult<Self> {
        if (MIN_PRIORITY..=MAX_PRIORITY).contains(&value) {
            Ok(Self(value))
        } else {
            Err(ModelError::InvalidPriority(value))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Priority after subtracting one point per full `interval` waited,
    /// floored at [`MIN_PRIORITY`].
    pub fn aged(self, waited: Duration, interval: Duration) -> u8 {
        if interval.is_zero() {
            return self.0;
        }
        let steps = waited.as_nanos() / interval.as_nanos();
        let aged = u128::from(self.0).saturating_sub(steps);
        aged.max(u128::from(MIN_PRIORITY)) as u8
    }
}

impl TryFrom<u8> for Priority {
    type Error = ModelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Category of execution capacity with its own slot pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    Cpu,
    Gpu,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 2] = [ResourceClass::Cpu, ResourceClass::Gpu];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceClass::Cpu => "cpu",
            ResourceClass::Gpu => "gpu",
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ResourceClass {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cpu" => Ok(ResourceClass::Cpu),
            "gpu" => Ok(ResourceClass::Gpu),
            other => Err(ModelError::validation(format!("unknown resource class '{}'", other))),
        }
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a worker slot
    #[default]
    Queued,
    /// Claimed by a worker slot
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Target preset handed to the transcoder engine unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl Preset {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Output produced by a successful engine run.
///
/// Outputs are keyed by job id plus attempt, so a retried job replaces
/// rather than appends to earlier partial outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDescriptor {
    pub location: String,
    pub size_bytes: u64,
    pub checksum: String,
    pub attempt: u32,
}

/// Entry in a job's append-only audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTransition {
    pub from: JobState,
    pub to: JobState,
    pub at: DateTime<Utc>,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A requested mutation of a job record.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// `queued -> processing` by the named worker slot.
    Claim { worker: String },
    /// Refresh the heartbeat of a processing job.
    Heartbeat,
    /// Raise the advisory cancellation flag of a processing job.
    RequestCancel,
    /// `processing -> completed`.
    Complete { output: OutputDescriptor },
    /// `processing -> failed`.
    Fail { error: String },
    /// `processing -> queued` after a transient failure, re-offered at `not_before`.
    Retry {
        error: String,
        not_before: DateTime<Utc>,
    },
    /// `processing -> queued` after a lost heartbeat or restart.
    Recover { reason: String },
    /// `queued | processing -> cancelled`.
    Cancel,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Claim { .. } => "claim",
            Transition::Heartbeat => "heartbeat",
            Transition::RequestCancel => "request_cancel",
            Transition::Complete { .. } => "complete",
            Transition::Fail { .. } => "fail",
            Transition::Retry { .. } => "retry",
            Transition::Recover { .. } => "recover",
            Transition::Cancel => "cancel",
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

/// A request to transcode one asset into one preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeJob {
    pub id: JobId,
    pub asset_id: AssetId,
    pub preset: Preset,
    pub priority: Priority,
    pub resource_class: ResourceClass,
    #[serde(default)]
    pub state: JobState,

    /// Number of claims so far (never above `max_attempts`)
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    pub created_at: DateTime<Utc>,
    /// Last entry into `queued`; drives aging and FIFO order
    pub queued_at: DateTime<Utc>,
    /// Earliest time a retried job may be offered again
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,

    /// Slot currently holding the job
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputDescriptor>,

    /// Bumped on every applied transition; compare-and-swap key
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub history: Vec<JobTransition>,
}

impl TranscodeJob {
    /// Create a new queued job.
    pub fn new(
        asset_id: AssetId,
        preset: Preset,
        priority: Priority,
        resource_class: ResourceClass,
        max_attempts: u32,
    ) -> ModelResult<Self> {
        if max_attempts == 0 {
            return Err(ModelError::validation("max_attempts must be at least 1"));
        }
        let now = Utc::now();
        Ok(Self {
            id: JobId::new(),
            asset_id,
            preset,
            priority,
            resource_class,
            state: JobState::Queued,
            attempt_count: 0,
            max_attempts,
            created_at: now,
            queued_at: now,
            not_before: None,
            started_at: None,
            completed_at: None,
            heartbeat_at: None,
            worker: None,
            cancel_requested: false,
            last_error: None,
            output: None,
            version: 0,
            history: Vec::new(),
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether another claim is allowed after the current attempt.
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    /// Whether the job may be offered to a worker at `now`.
    pub fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Queued && self.not_before.map_or(true, |t| t <= now)
    }

    /// Apply a transition, returning the next version of the record.
    pub fn apply(&self, transition: &Transition, now: DateTime<Utc>) -> ModelResult<Self> {
        let mut next = self.clone();
        let from = self.state;

        match (from, transition) {
            (JobState::Queued, Transition::Claim { worker }) => {
                if !self.has_attempts_remaining() {
                    return Err(self.reject(transition));
                }
                next.attempt_count += 1;
                next.state = JobState::Processing;
                next.started_at = Some(now);
                next.heartbeat_at = Some(now);
                next.worker = Some(worker.clone());
                next.not_before = None;
                next.cancel_requested = false;
                next.record(from, now, None);
            }
            (JobState::Processing, Transition::Heartbeat) => {
                next.heartbeat_at = Some(now);
            }
            (JobState::Processing, Transition::RequestCancel) => {
                next.cancel_requested = true;
            }
            (JobState::Processing, Transition::Complete { output }) => {
                next.state = JobState::Completed;
                next.completed_at = Some(now);
                next.output = Some(output.clone());
                next.worker = None;
                next.record(from, now, None);
            }
            (JobState::Processing, Transition::Fail { error }) => {
                next.fail_with(error.clone(), now);
            }
            (JobState::Processing, Transition::Retry { error, not_before }) => {
                if !self.has_attempts_remaining() {
                    return Err(self.reject(transition));
                }
                next.requeue(now, Some(*not_before), error.clone());
            }
            (JobState::Processing, Transition::Recover { reason }) => {
                if self.has_attempts_remaining() {
                    next.requeue(now, None, reason.clone());
                } else {
                    next.fail_with(format!("heartbeat lost on final attempt: {}", reason), now);
                }
            }
            (JobState::Queued | JobState::Processing, Transition::Cancel) => {
                next.state = JobState::Cancelled;
                next.completed_at = Some(now);
                next.cancel_requested = true;
                next.worker = None;
                next.record(from, now, Some("cancelled".to_string()));
            }
            _ => return Err(self.reject(transition)),
        }

        next.version += 1;
        Ok(next)
    }

    fn reject(&self, transition: &Transition) -> ModelError {
        ModelError::invalid_transition(self.id.as_str(), self.state, transition.name())
    }

    fn fail_with(&mut self, error: String, now: DateTime<Utc>) {
        let from = self.state;
        self.state = JobState::Failed;
        self.completed_at = Some(now);
        self.worker = None;
        self.last_error = Some(error.clone());
        self.record(from, now, Some(error));
    }

    fn requeue(&mut self, now: DateTime<Utc>, not_before: Option<DateTime<Utc>>, reason: String) {
        let from = self.state;
        self.state = JobState::Queued;
        self.queued_at = now;
        self.not_before = not_before;
        self.worker = None;
        self.heartbeat_at = None;
        self.last_error = Some(reason.clone());
        self.record(from, now, Some(reason));
    }

    fn record(&mut self, from: JobState, at: DateTime<Utc>, reason: Option<String>) {
        self.history.push(JobTransition {
            from,
            to: self.state,
            at,
            attempt: self.attempt_count,
            reason,
        });
    }
}

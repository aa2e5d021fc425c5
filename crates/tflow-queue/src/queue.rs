//! Priority job queue with aging.
//!
//! The durable job record lives in the [`PersistenceStore`]; the queue keeps
//! an in-memory index of queued jobs per resource class for fast selection.
//! Selection happens under the index lock and the claim itself is a
//! compare-and-swap on the record, so a stale index entry can never hand
//! the same job to two workers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use tflow_models::{
    AssetId, JobId, JobState, JobTransition, OutputDescriptor, Preset, Priority, ResourceClass,
    TranscodeJob, Transition,
};
use tflow_storage::PersistenceStore;

use crate::error::{QueueError, QueueResult};
use crate::metrics;
use crate::progress::EventBus;
use crate::state_machine::JobStateMachine;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Waiting time that improves a job's effective priority by one
    pub aging_interval: Duration,
    /// Attempts granted to jobs enqueued without an explicit limit
    pub default_max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            aging_interval: Duration::from_secs(60),
            default_max_attempts: 3,
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            aging_interval: Duration::from_secs(
                std::env::var("QUEUE_AGING_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
            default_max_attempts: std::env::var("QUEUE_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
        }
    }
}

/// Parameters of a new job.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub asset_id: AssetId,
    pub preset: Preset,
    /// 1 (most urgent) to 10
    pub priority: u8,
    pub resource_class: ResourceClass,
    /// Falls back to [`QueueConfig::default_max_attempts`]
    pub max_attempts: Option<u32>,
}

impl EnqueueRequest {
    pub fn new(
        asset_id: AssetId,
        preset: Preset,
        priority: u8,
        resource_class: ResourceClass,
    ) -> Self {
        Self {
            asset_id,
            preset,
            priority,
            resource_class,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// A job handed to a worker slot.
#[derive(Debug)]
pub struct ClaimedJob {
    /// Record as of the claim (`processing`, attempt counted)
    pub job: TranscodeJob,
    /// Flips to `true` when cancellation is requested
    pub cancel_rx: watch::Receiver<bool>,
}

/// What a cancellation request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was queued and is now cancelled.
    Cancelled,
    /// The job is processing; its worker has been signalled.
    Requested,
    /// The job was already cancelled.
    AlreadyCancelled,
}

/// Point-in-time queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Queued jobs per resource class, including those in backoff
    pub pending: HashMap<ResourceClass, usize>,
    /// Job records per state
    pub by_state: HashMap<JobState, usize>,
}

/// What startup recovery did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Queued records re-indexed
    pub restored: usize,
    /// Processing records returned to the queue
    pub requeued: Vec<JobId>,
    /// Processing records failed because no attempts remained
    pub failed: Vec<JobId>,
}

#[derive(Debug, Clone)]
struct PendingEntry {
    job_id: JobId,
    priority: Priority,
    queued_at: DateTime<Utc>,
    not_before: Option<DateTime<Utc>>,
}

impl PendingEntry {
    fn from_job(job: &TranscodeJob) -> Self {
        Self {
            job_id: job.id.clone(),
            priority: job.priority,
            queued_at: job.queued_at,
            not_before: job.not_before,
        }
    }

    fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |t| t <= now)
    }

    /// Ordering key: effective priority, then FIFO.
    fn rank(&self, now: DateTime<Utc>, aging_interval: Duration) -> (u8, DateTime<Utc>) {
        let waited = (now - self.queued_at).to_std().unwrap_or(Duration::ZERO);
        (self.priority.aged(waited, aging_interval), self.queued_at)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Job queue and priority scheduler.
pub struct JobQueue {
    config: QueueConfig,
    machine: JobStateMachine,
    pending: Mutex<HashMap<ResourceClass, Vec<PendingEntry>>>,
    cancel_signals: Mutex<HashMap<JobId, watch::Sender<bool>>>,
    work_available: Notify,
}

impl JobQueue {
    pub fn new(config: QueueConfig, store: Arc<dyn PersistenceStore>, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            machine: JobStateMachine::new(store, bus),
            pending: Mutex::new(HashMap::new()),
            cancel_signals: Mutex::new(HashMap::new()),
            work_available: Notify::new(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        self.machine.bus()
    }

    /// Create a queued job with the default attempt limit.
    pub async fn enqueue_job(
        &self,
        asset_id: AssetId,
        preset: Preset,
        priority: u8,
        resource_class: ResourceClass,
    ) -> QueueResult<JobId> {
        self.enqueue(EnqueueRequest::new(asset_id, preset, priority, resource_class))
            .await
    }

    /// Create a queued job.
    pub async fn enqueue(&self, request: EnqueueRequest) -> QueueResult<JobId> {
        let priority = Priority::new(request.priority)?;
        if request.preset.name.trim().is_empty() {
            return Err(QueueError::validation("preset name must not be empty"));
        }
        let max_attempts = request
            .max_attempts
            .unwrap_or(self.config.default_max_attempts);

        let job = TranscodeJob::new(
            request.asset_id,
            request.preset,
            priority,
            request.resource_class,
            max_attempts,
        )?;
        let job = self.machine.create(job).await?;

        self.index(&job);
        metrics::record_enqueued(job.resource_class);
        Ok(job.id)
    }

    /// Claim the best eligible job of `class` for `worker`.
    pub async fn next_for(
        &self,
        class: ResourceClass,
        worker: &str,
    ) -> QueueResult<Option<ClaimedJob>> {
        self.next_for_at(class, worker, Utc::now()).await
    }

    /// Claim the best job of `class` eligible at `now`.
    ///
    /// Lowest effective priority wins, ties go to the earliest `queued_at`.
    /// Returns `None` when nothing is eligible.
    pub async fn next_for_at(
        &self,
        class: ResourceClass,
        worker: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<ClaimedJob>> {
        loop {
            let Some(entry) = self.take_best(class, now) else {
                return Ok(None);
            };

            let claim = Transition::Claim {
                worker: worker.to_string(),
            };
            let claimed = self
                .machine
                .transition_if(&entry.job_id, claim, |job| job.is_eligible_at(now))
                .await;

            match claimed {
                Ok(Some(job)) => {
                    let (tx, cancel_rx) = watch::channel(false);
                    lock(&self.cancel_signals).insert(job.id.clone(), tx);
                    metrics::record_claimed(class);
                    debug!(
                        job_id = %job.id,
                        worker = worker,
                        attempt = job.attempt_count,
                        "Job claimed"
                    );
                    return Ok(Some(ClaimedJob { job, cancel_rx }));
                }
                Ok(None) => {
                    debug!(job_id = %entry.job_id, "Index entry no longer eligible, skipping");
                }
                Err(e) if e.is_lost_race() => {
                    debug!(job_id = %entry.job_id, error = %e, "Lost claim race, skipping");
                }
                Err(e) => {
                    self.restore_entry(class, entry);
                    return Err(e);
                }
            }
        }
    }

    /// Wait until new work may be available.
    ///
    /// Woken by enqueues and requeues. Jobs whose backoff expires do not
    /// wake waiters, so callers should also poll.
    pub async fn wait_for_work(&self) {
        self.work_available.notified().await;
    }

    /// Cancel a job.
    ///
    /// Queued jobs are cancelled at once. Processing jobs get their
    /// cancellation flag raised and their worker signalled; the worker
    /// finishes the transition. Cancelling a completed or failed job is an
    /// error.
    pub async fn cancel_job(&self, job_id: &JobId) -> QueueResult<CancelOutcome> {
        let job = self.machine.get(job_id).await?;

        match job.state {
            JobState::Cancelled => Ok(CancelOutcome::AlreadyCancelled),
            JobState::Completed | JobState::Failed => Err(QueueError::InvalidStateTransition {
                job_id: job_id.to_string(),
                state: job.state,
                transition: Transition::Cancel.name(),
            }),
            JobState::Queued => {
                let cancelled = self
                    .machine
                    .transition_if(job_id, Transition::Cancel, |j| j.state == JobState::Queued)
                    .await?;
                match cancelled {
                    Some(job) => {
                        self.unindex(&job);
                        info!(job_id = %job_id, "Queued job cancelled");
                        Ok(CancelOutcome::Cancelled)
                    }
                    // Claimed in the meantime
                    None => self.request_cancel(job_id).await,
                }
            }
            JobState::Processing => self.request_cancel(job_id).await,
        }
    }

    async fn request_cancel(&self, job_id: &JobId) -> QueueResult<CancelOutcome> {
        let requested = self
            .machine
            .transition_if(job_id, Transition::RequestCancel, |j| {
                j.state == JobState::Processing
            })
            .await?;

        if requested.is_none() {
            // Finished while we were looking
            let job = self.machine.get(job_id).await?;
            return match job.state {
                JobState::Cancelled => Ok(CancelOutcome::AlreadyCancelled),
                state => Err(QueueError::InvalidStateTransition {
                    job_id: job_id.to_string(),
                    state,
                    transition: Transition::Cancel.name(),
                }),
            };
        }

        if let Some(tx) = lock(&self.cancel_signals).get(job_id) {
            let _ = tx.send(true);
        }
        info!(job_id = %job_id, "Cancellation requested for processing job");
        Ok(CancelOutcome::Requested)
    }

    /// Refresh the heartbeat of a processing job.
    pub async fn heartbeat(&self, job_id: &JobId) -> QueueResult<TranscodeJob> {
        self.transition(job_id, Transition::Heartbeat).await
    }

    pub async fn complete(
        &self,
        job_id: &JobId,
        output: OutputDescriptor,
    ) -> QueueResult<TranscodeJob> {
        self.transition(job_id, Transition::Complete { output }).await
    }

    pub async fn fail(&self, job_id: &JobId, error: impl Into<String>) -> QueueResult<TranscodeJob> {
        self.transition(
            job_id,
            Transition::Fail {
                error: error.into(),
            },
        )
        .await
    }

    /// Return a processing job to the queue, offered again at `not_before`.
    pub async fn retry(
        &self,
        job_id: &JobId,
        error: impl Into<String>,
        not_before: DateTime<Utc>,
    ) -> QueueResult<TranscodeJob> {
        self.transition(
            job_id,
            Transition::Retry {
                error: error.into(),
                not_before,
            },
        )
        .await
    }

    /// Finish a cancellation the worker observed.
    pub async fn mark_cancelled(&self, job_id: &JobId) -> QueueResult<TranscodeJob> {
        self.transition(job_id, Transition::Cancel).await
    }

    /// Apply a transition and keep the index and cancel signals in step.
    pub async fn transition(
        &self,
        job_id: &JobId,
        transition: Transition,
    ) -> QueueResult<TranscodeJob> {
        let job = self.machine.transition(job_id, transition).await?;
        self.after_transition(&job);
        Ok(job)
    }

    /// Apply a transition on behalf of the slot holding the job.
    ///
    /// Returns `Ok(None)` if the job is no longer processing under
    /// `worker` and `attempt`, e.g. after it was recovered and re-claimed.
    pub async fn transition_owned(
        &self,
        job_id: &JobId,
        worker: &str,
        attempt: u32,
        transition: Transition,
    ) -> QueueResult<Option<TranscodeJob>> {
        let held = |job: &TranscodeJob| {
            job.state == JobState::Processing
                && job.attempt_count == attempt
                && job.worker.as_deref() == Some(worker)
        };
        let job = self.machine.transition_if(job_id, transition, held).await?;
        if let Some(job) = &job {
            self.after_transition(job);
        }
        Ok(job)
    }

    fn after_transition(&self, job: &TranscodeJob) {
        match job.state {
            JobState::Queued => {
                lock(&self.cancel_signals).remove(&job.id);
                self.index(job);
            }
            JobState::Completed | JobState::Failed | JobState::Cancelled => {
                lock(&self.cancel_signals).remove(&job.id);
            }
            JobState::Processing => {}
        }
    }

    /// Requeue processing jobs whose heartbeat is older than `timeout`.
    ///
    /// Jobs on their final attempt are failed instead.
    pub async fn recover_stale(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Vec<JobId>> {
        let cutoff = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|t| now.checked_sub_signed(t))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let is_stale = move |job: &TranscodeJob| {
            job.state == JobState::Processing && job.heartbeat_at.map_or(true, |t| t < cutoff)
        };

        let mut recovered = Vec::new();
        for job in self.machine.list(Some(JobState::Processing)).await? {
            if !is_stale(&job) {
                continue;
            }
            let reason = format!(
                "no heartbeat from {} since {}",
                job.worker.as_deref().unwrap_or("unknown worker"),
                job.heartbeat_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "claim".to_string())
            );
            match self
                .machine
                .transition_if(&job.id, Transition::Recover { reason }, is_stale)
                .await
            {
                Ok(Some(updated)) => {
                    warn!(
                        job_id = %updated.id,
                        state = %updated.state,
                        attempt = updated.attempt_count,
                        "Recovered job with stale heartbeat"
                    );
                    self.after_transition(&updated);
                    recovered.push(updated.id);
                }
                Ok(None) => {}
                Err(e) if e.is_lost_race() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }

    /// Rebuild the in-memory index from the store and requeue every job
    /// left processing by a previous process.
    pub async fn recover_on_startup(&self) -> QueueResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for job in self.machine.list(Some(JobState::Queued)).await? {
            if self.index(&job) {
                report.restored += 1;
            }
        }

        for job in self.machine.list(Some(JobState::Processing)).await? {
            let reason = "worker process restarted".to_string();
            match self
                .machine
                .transition_if(&job.id, Transition::Recover { reason }, |j| {
                    j.state == JobState::Processing
                })
                .await
            {
                Ok(Some(updated)) => {
                    self.after_transition(&updated);
                    if updated.state == JobState::Queued {
                        report.requeued.push(updated.id);
                    } else {
                        report.failed.push(updated.id);
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_lost_race() => {}
                Err(e) => return Err(e),
            }
        }

        info!(
            restored = report.restored,
            requeued = report.requeued.len(),
            failed = report.failed.len(),
            "Startup recovery finished"
        );
        Ok(report)
    }

    pub async fn get_job(&self, job_id: &JobId) -> QueueResult<TranscodeJob> {
        self.machine.get(job_id).await
    }

    /// Audit log of a job, oldest first.
    pub async fn job_history(&self, job_id: &JobId) -> QueueResult<Vec<JobTransition>> {
        self.machine.history(job_id).await
    }

    /// Queued jobs of `class`, including those waiting out a backoff.
    pub fn depth(&self, class: ResourceClass) -> usize {
        lock(&self.pending).get(&class).map_or(0, Vec::len)
    }

    pub async fn stats(&self) -> QueueResult<QueueStats> {
        let pending = {
            let pending = lock(&self.pending);
            ResourceClass::ALL
                .iter()
                .map(|c| (*c, pending.get(c).map_or(0, Vec::len)))
                .collect()
        };
        let mut by_state = HashMap::new();
        for job in self.machine.list(None).await? {
            *by_state.entry(job.state).or_insert(0) += 1;
        }
        Ok(QueueStats { pending, by_state })
    }

    /// Add a queued job to the index. Returns false if already present.
    fn index(&self, job: &TranscodeJob) -> bool {
        let depth = {
            let mut pending = lock(&self.pending);
            let entries = pending.entry(job.resource_class).or_default();
            if entries.iter().any(|e| e.job_id == job.id) {
                return false;
            }
            entries.push(PendingEntry::from_job(job));
            entries.len()
        };
        metrics::set_queue_depth(job.resource_class, depth);
        self.work_available.notify_waiters();
        true
    }

    fn unindex(&self, job: &TranscodeJob) {
        let depth = {
            let mut pending = lock(&self.pending);
            let entries = pending.entry(job.resource_class).or_default();
            entries.retain(|e| e.job_id != job.id);
            entries.len()
        };
        metrics::set_queue_depth(job.resource_class, depth);
    }

    fn take_best(&self, class: ResourceClass, now: DateTime<Utc>) -> Option<PendingEntry> {
        let mut pending = lock(&self.pending);
        let entries = pending.get_mut(&class)?;
        let best = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_eligible_at(now))
            .min_by_key(|(_, e)| e.rank(now, self.config.aging_interval))
            .map(|(i, _)| i)?;
        let entry = entries.swap_remove(best);
        metrics::set_queue_depth(class, entries.len());
        Some(entry)
    }

    fn restore_entry(&self, class: ResourceClass, entry: PendingEntry) {
        let mut pending = lock(&self.pending);
        let entries = pending.entry(class).or_default();
        if !entries.iter().any(|e| e.job_id == entry.job_id) {
            entries.push(entry);
        }
    }
}

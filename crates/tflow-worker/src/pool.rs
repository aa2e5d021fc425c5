//! Worker pool.
//!
//! A fixed number of slots per resource class, each a tokio task that
//! claims a job, drives the engine, and records the outcome. The slot
//! count per class is the admission limit for that class.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use tflow_models::{JobId, JobState, ProgressEvent, ResourceClass, TranscodeJob, Transition};
use tflow_queue::{ClaimedJob, JobQueue, QueueError, RecoveryReport};

use crate::config::WorkerConfig;
use crate::engine::{signalled, EngineEvent, EngineRequest, TranscoderEngine};
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics;
use crate::outcome::JobOutcome;
use crate::recovery::spawn_recovery;
use crate::retry::{retry_async, FailureTracker, RetryConfig};

/// A slot and the job it currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub id: String,
    pub class: ResourceClass,
    pub job_id: Option<JobId>,
}

struct Slot {
    id: String,
    class: ResourceClass,
    current: Mutex<Option<JobId>>,
}

/// What the heartbeat task learned about the running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ownership {
    Held,
    CancelRequested,
    /// Recovered and possibly re-claimed elsewhere
    Lost,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Aborts the task when dropped, so a helper task never outlives the
/// attempt that owns it (slot aborted on shutdown, or unwinding).
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

pub struct WorkerPool {
    config: WorkerConfig,
    queue: Arc<JobQueue>,
    engine: Arc<dyn TranscoderEngine>,
    slots: Vec<Arc<Slot>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerConfig,
        queue: Arc<JobQueue>,
        engine: Arc<dyn TranscoderEngine>,
    ) -> Self {
        let slots = ResourceClass::ALL
            .iter()
            .flat_map(|class| {
                (0..config.slots_for(*class)).map(move |i| {
                    Arc::new(Slot {
                        id: format!("{}-{}", class, i),
                        class: *class,
                        current: Mutex::new(None),
                    })
                })
            })
            .collect();
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            queue,
            engine,
            slots,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Requeue every job a previous process left in `processing`.
    /// Call before [`WorkerPool::start`].
    pub async fn recover_on_startup(&self) -> WorkerResult<RecoveryReport> {
        let report = self.queue.recover_on_startup().await?;
        metrics::record_recovered(report.requeued.len() + report.failed.len());
        Ok(report)
    }

    /// Spawn one task per slot plus the stale-heartbeat scanner.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = lock(&self.tasks);
        if !tasks.is_empty() {
            warn!("Worker pool already started");
            return;
        }

        for slot in &self.slots {
            let pool = Arc::clone(self);
            let slot = Arc::clone(slot);
            let shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move { pool.run_slot(slot, shutdown).await }));
        }
        tasks.push(spawn_recovery(
            Arc::clone(&self.queue),
            self.config.heartbeat_timeout,
            self.config.recovery_interval,
            self.shutdown.subscribe(),
        ));

        info!(
            cpu_slots = self.config.cpu_slots,
            gpu_slots = self.config.gpu_slots,
            "Worker pool started"
        );
    }

    pub fn slots(&self) -> Vec<SlotSnapshot> {
        self.slots
            .iter()
            .map(|slot| SlotSnapshot {
                id: slot.id.clone(),
                class: slot.class,
                job_id: lock(&slot.current).clone(),
            })
            .collect()
    }

    /// Stop claiming, give in-flight jobs the grace period, then interrupt
    /// them and wait up to the shutdown timeout for slots to exit.
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("Shutting down worker pool");

        let tasks = std::mem::take(&mut *lock(&self.tasks));
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        match tokio::time::timeout(self.config.shutdown_timeout, join_all(tasks)).await {
            Ok(_) => info!("Worker pool stopped"),
            Err(_) => {
                warn!(
                    timeout_secs = self.config.shutdown_timeout.as_secs(),
                    "Timed out waiting for slots, aborting"
                );
                for handle in aborts {
                    handle.abort();
                }
            }
        }
    }

    async fn run_slot(self: Arc<Self>, slot: Arc<Slot>, mut shutdown: watch::Receiver<bool>) {
        debug!(slot = %slot.id, "Slot started");
        let mut failures = FailureTracker::new(3);

        while !*shutdown.borrow() {
            match self.queue.next_for(slot.class, &slot.id).await {
                Ok(Some(claimed)) => {
                    failures.record_success();
                    self.execute(&slot, claimed, shutdown.clone()).await;
                }
                Ok(None) => {
                    failures.record_success();
                    tokio::select! {
                        _ = signalled(&mut shutdown) => {}
                        _ = self.queue.wait_for_work() => {}
                        _ = tokio::time::sleep(self.config.idle_poll_interval) => {}
                    }
                }
                Err(e) => {
                    if failures.record_failure() {
                        warn!(slot = %slot.id, error = %e, "Failed to claim job");
                    }
                    tokio::select! {
                        _ = signalled(&mut shutdown) => {}
                        _ = tokio::time::sleep(self.config.idle_poll_interval) => {}
                    }
                }
            }
        }

        debug!(slot = %slot.id, "Slot stopped");
    }

    /// Run one attempt in its own task so a panic costs the attempt, not
    /// the slot. A panicked attempt counts as a transient failure.
    async fn execute(
        self: &Arc<Self>,
        slot: &Arc<Slot>,
        claimed: ClaimedJob,
        shutdown: watch::Receiver<bool>,
    ) {
        let job = claimed.job.clone();
        let logger = JobLogger::new(&job, &slot.id);
        let span = logger.create_span();

        let pool = Arc::clone(self);
        let task_slot = Arc::clone(slot);
        let task_logger = logger.clone();
        let mut attempt = AbortOnDrop(tokio::spawn(
            async move {
                pool.execute_attempt(&task_slot, claimed, shutdown, task_logger)
                    .await
            }
            .instrument(span),
        ));

        let joined = (&mut attempt.0).await;
        if let Err(e) = joined {
            if e.is_panic() {
                let payload = e.into_panic();
                let detail = format!("worker panicked: {}", panic_message(payload.as_ref()));
                logger.log_error(&detail);
                self.record_outcome(&job, &slot.id, JobOutcome::TransientFailure(detail), &logger)
                    .await;
            }
            self.set_current(slot, None);
        }
    }

    async fn execute_attempt(
        &self,
        slot: &Slot,
        claimed: ClaimedJob,
        shutdown: watch::Receiver<bool>,
        logger: JobLogger,
    ) {
        let ClaimedJob { job, cancel_rx } = claimed;
        self.set_current(slot, Some(job.id.clone()));
        logger.log_start(&format!("{} for asset {}", job.preset.name, job.asset_id));

        let (ownership_tx, ownership_rx) = watch::channel(Ownership::Held);
        let heartbeat = AbortOnDrop(self.spawn_heartbeat(&job, &slot.id, ownership_tx));

        let started = Instant::now();
        let outcome = self
            .drive_engine(&job, cancel_rx, ownership_rx, shutdown)
            .await;
        drop(heartbeat);

        match outcome {
            Some(outcome) => {
                metrics::record_engine_duration(
                    job.resource_class,
                    outcome.label(),
                    started.elapsed(),
                );
                self.record_outcome(&job, &slot.id, outcome, &logger).await;
            }
            None => logger.log_warning("job was recovered elsewhere, abandoning attempt"),
        }

        self.set_current(slot, None);
    }

    /// Run the engine until it reports a result or the attempt is cut
    /// short. Returns `None` if the slot lost ownership of the job.
    async fn drive_engine(
        &self,
        job: &TranscodeJob,
        mut cancel_rx: watch::Receiver<bool>,
        mut ownership_rx: watch::Receiver<Ownership>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<JobOutcome> {
        let (engine_cancel, engine_cancel_rx) = watch::channel(false);
        let mut events = self
            .engine
            .run(EngineRequest::for_job(job), engine_cancel_rx)
            .await;

        let deadline = tokio::time::sleep(self.config.job_timeout);
        tokio::pin!(deadline);

        let mut cancel_requested = false;
        let mut ownership_open = true;
        let mut grace_until: Option<Instant> = None;

        loop {
            let grace = async move {
                match grace_until {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                event = events.next() => match event {
                    Some(EngineEvent::Progress(percent)) => {
                        // Progress reports are the cancellation checkpoints
                        if cancel_requested || *cancel_rx.borrow() {
                            let _ = engine_cancel.send(true);
                            return Some(JobOutcome::Cancelled);
                        }
                        self.queue.bus().publish(ProgressEvent::progress(
                            job.id.clone(),
                            job.attempt_count,
                            percent,
                        ));
                    }
                    Some(EngineEvent::Finished(Ok(output))) => {
                        return Some(JobOutcome::Success(output));
                    }
                    Some(EngineEvent::Finished(Err(failure))) => {
                        return Some(JobOutcome::from_engine_failure(failure, cancel_requested));
                    }
                    None if cancel_requested => return Some(JobOutcome::Cancelled),
                    None => {
                        return Some(JobOutcome::TransientFailure(
                            "engine stream ended without a result".to_string(),
                        ));
                    }
                },
                _ = signalled(&mut cancel_rx), if !cancel_requested => {
                    cancel_requested = true;
                    let _ = engine_cancel.send(true);
                    debug!(job_id = %job.id, "Cancellation requested, waiting for engine checkpoint");
                }
                changed = ownership_rx.changed(), if ownership_open => {
                    if changed.is_err() {
                        ownership_open = false;
                    } else {
                        let ownership = *ownership_rx.borrow_and_update();
                        match ownership {
                            Ownership::Held => {}
                            Ownership::CancelRequested => {
                                cancel_requested = true;
                                let _ = engine_cancel.send(true);
                            }
                            Ownership::Lost => {
                                let _ = engine_cancel.send(true);
                                return None;
                            }
                        }
                    }
                }
                _ = &mut deadline => {
                    let _ = engine_cancel.send(true);
                    return Some(JobOutcome::from_error(&WorkerError::Timeout(self.config.job_timeout)));
                }
                _ = signalled(&mut shutdown), if grace_until.is_none() => {
                    grace_until = Some(Instant::now() + self.config.shutdown_grace);
                    debug!(job_id = %job.id, "Shutdown requested, job has grace period to finish");
                }
                _ = grace => {
                    let _ = engine_cancel.send(true);
                    return Some(JobOutcome::Interrupted("worker shutting down".to_string()));
                }
            }
        }
    }

    fn spawn_heartbeat(
        &self,
        job: &TranscodeJob,
        slot: &str,
        ownership: watch::Sender<Ownership>,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let job_id = job.id.clone();
        let slot = slot.to_string();
        let attempt = job.attempt_count;
        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The claim itself set the first heartbeat
            ticker.tick().await;
            let mut failures = FailureTracker::new(3);

            loop {
                ticker.tick().await;
                match queue
                    .transition_owned(&job_id, &slot, attempt, Transition::Heartbeat)
                    .await
                {
                    Ok(Some(current)) => {
                        failures.record_success();
                        if current.cancel_requested {
                            ownership.send_if_modified(|o| {
                                let raise = *o == Ownership::Held;
                                if raise {
                                    *o = Ownership::CancelRequested;
                                }
                                raise
                            });
                        }
                    }
                    Ok(None) => {
                        let _ = ownership.send(Ownership::Lost);
                        break;
                    }
                    Err(e) => {
                        metrics::record_heartbeat_failure();
                        if failures.record_failure() {
                            warn!(job_id = %job_id, slot = %slot, error = %e, "Heartbeat write failed");
                        }
                    }
                }
            }
        })
    }

    async fn record_outcome(
        &self,
        job: &TranscodeJob,
        slot: &str,
        outcome: JobOutcome,
        logger: &JobLogger,
    ) {
        let class = job.resource_class;
        let transition = match &outcome {
            JobOutcome::Success(output) => Transition::Complete {
                output: output.clone(),
            },
            JobOutcome::TransientFailure(error) if job.has_attempts_remaining() => {
                let delay = self.config.backoff.delay_for_attempt(job.attempt_count);
                let delay = chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(300));
                Transition::Retry {
                    error: error.clone(),
                    not_before: Utc::now() + delay,
                }
            }
            JobOutcome::TransientFailure(error) => Transition::Fail {
                error: format!("{} (no attempts left after {})", error, job.attempt_count),
            },
            JobOutcome::PermanentFailure(error) => Transition::Fail {
                error: error.clone(),
            },
            JobOutcome::Cancelled => Transition::Cancel,
            JobOutcome::Interrupted(reason) => Transition::Recover {
                reason: reason.clone(),
            },
        };

        let config = RetryConfig::new("record_outcome");
        let recorded = retry_async(&config, QueueError::is_retryable, || {
            self.queue
                .transition_owned(&job.id, slot, job.attempt_count, transition.clone())
        })
        .await;

        let updated = match recorded {
            Ok(Some(updated)) => updated,
            Ok(None) => {
                logger.log_warning("job moved on before its outcome was recorded");
                return;
            }
            Err(e) => {
                logger.log_error(&format!(
                    "failed to record {} outcome, leaving job to recovery: {}",
                    outcome.label(),
                    e
                ));
                return;
            }
        };

        match (updated.state, &outcome) {
            (JobState::Completed, _) => {
                metrics::record_completed(class);
                logger.log_completion(&format!(
                    "output at {}",
                    updated.output.as_ref().map_or("?", |o| o.location.as_str())
                ));
            }
            (JobState::Queued, JobOutcome::TransientFailure(error)) => {
                metrics::record_retried(class);
                logger.log_warning(&format!(
                    "transient failure, retry not before {}: {}",
                    updated
                        .not_before
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_default(),
                    error
                ));
            }
            (JobState::Queued, _) => logger.log_warning("interrupted, returned to queue"),
            (JobState::Failed, JobOutcome::PermanentFailure(_)) => {
                metrics::record_failed(class, "permanent");
                logger.log_error(updated.last_error.as_deref().unwrap_or("failed"));
            }
            (JobState::Failed, _) => {
                metrics::record_failed(class, "exhausted");
                logger.log_error(updated.last_error.as_deref().unwrap_or("failed"));
            }
            (JobState::Cancelled, _) => {
                metrics::record_cancelled(class);
                logger.log_warning("cancelled");
            }
            (JobState::Processing, _) => {}
        }
    }

    fn set_current(&self, slot: &Slot, job_id: Option<JobId>) {
        *lock(&slot.current) = job_id;
        let busy = self
            .slots
            .iter()
            .filter(|s| s.class == slot.class && lock(&s.current).is_some())
            .count();
        metrics::set_busy_slots(slot.class, busy);
    }
}

//! Job state machine.
//!
//! Every state change goes through [`JobStateMachine`]: the transition is
//! validated against the current record, persisted with a version-keyed
//! compare-and-swap, and announced on the event bus. A lost CAS re-reads
//! the record and re-validates, so two concurrent transitions never both
//! apply to the same version.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use tflow_models::{JobId, JobState, JobTransition, ProgressEvent, ProgressPhase, TranscodeJob, Transition};
use tflow_storage::{CasOutcome, PersistenceStore};

use crate::error::{QueueError, QueueResult};
use crate::metrics;
use crate::progress::EventBus;

/// Re-reads allowed after a lost compare-and-swap.
const MAX_CAS_RETRIES: u32 = 16;

pub struct JobStateMachine {
    store: Arc<dyn PersistenceStore>,
    bus: Arc<EventBus>,
}

impl JobStateMachine {
    pub fn new(store: Arc<dyn PersistenceStore>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Persist a new job and announce it as queued.
    pub async fn create(&self, job: TranscodeJob) -> QueueResult<TranscodeJob> {
        self.store.insert_job(&job).await?;
        info!(
            job_id = %job.id,
            asset_id = %job.asset_id,
            preset = %job.preset.name,
            priority = %job.priority,
            class = %job.resource_class,
            "Job created"
        );
        self.bus.publish(
            ProgressEvent::new(job.id.clone(), ProgressPhase::Queued, 0)
                .with_attempt(job.attempt_count),
        );
        Ok(job)
    }

    pub async fn get(&self, job_id: &JobId) -> QueueResult<TranscodeJob> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| QueueError::job_not_found(job_id.as_str()))
    }

    pub async fn history(&self, job_id: &JobId) -> QueueResult<Vec<JobTransition>> {
        Ok(self.get(job_id).await?.history)
    }

    pub async fn list(&self, state: Option<JobState>) -> QueueResult<Vec<TranscodeJob>> {
        Ok(self.store.list_jobs(state).await?)
    }

    /// Apply `transition` to the current record of `job_id`.
    pub async fn transition(
        &self,
        job_id: &JobId,
        transition: Transition,
    ) -> QueueResult<TranscodeJob> {
        self.transition_if(job_id, transition, |_| true)
            .await?
            .ok_or_else(|| QueueError::Contention(job_id.to_string()))
    }

    /// Apply `transition` only while `guard` holds for the current record.
    ///
    /// The guard is re-evaluated after every lost compare-and-swap. Returns
    /// `Ok(None)` when the guard rejects.
    pub async fn transition_if<F>(
        &self,
        job_id: &JobId,
        transition: Transition,
        guard: F,
    ) -> QueueResult<Option<TranscodeJob>>
    where
        F: Fn(&TranscodeJob) -> bool + Send,
    {
        let mut current = self.get(job_id).await?;

        for _ in 0..=MAX_CAS_RETRIES {
            if !guard(&current) {
                return Ok(None);
            }

            let next = current.apply(&transition, Utc::now())?;
            match self.store.compare_and_swap_job(current.version, &next).await? {
                CasOutcome::Swapped => {
                    self.announce(&current, &next, &transition);
                    return Ok(Some(next));
                }
                CasOutcome::Conflict(latest) => {
                    debug!(
                        job_id = %job_id,
                        transition = transition.name(),
                        expected = current.version,
                        found = latest.version,
                        "Job record changed underneath, re-validating"
                    );
                    metrics::record_cas_conflict();
                    current = latest;
                }
            }
        }

        Err(QueueError::Contention(job_id.to_string()))
    }

    fn announce(&self, before: &TranscodeJob, after: &TranscodeJob, transition: &Transition) {
        if before.state == after.state {
            return;
        }

        metrics::record_transition(before.state, after.state);
        info!(
            job_id = %after.id,
            from = %before.state,
            to = %after.state,
            transition = transition.name(),
            attempt = after.attempt_count,
            "Job transition"
        );

        let Some(phase) = phase_for(transition, after.state) else {
            return;
        };
        let percent = if phase == ProgressPhase::Completed { 100 } else { 0 };
        let mut event =
            ProgressEvent::new(after.id.clone(), phase, percent).with_attempt(after.attempt_count);
        if matches!(
            phase,
            ProgressPhase::Failed | ProgressPhase::Retrying | ProgressPhase::Requeued
        ) {
            if let Some(error) = &after.last_error {
                event = event.with_message(error.clone());
            }
        }
        self.bus.publish(event);
    }
}

/// Event phase announcing a state change.
fn phase_for(transition: &Transition, to: JobState) -> Option<ProgressPhase> {
    match (transition, to) {
        (Transition::Claim { .. }, _) => Some(ProgressPhase::Started),
        (Transition::Complete { .. }, _) => Some(ProgressPhase::Completed),
        (Transition::Fail { .. }, _) => Some(ProgressPhase::Failed),
        (Transition::Retry { .. }, _) => Some(ProgressPhase::Retrying),
        (Transition::Recover { .. }, JobState::Queued) => Some(ProgressPhase::Requeued),
        (Transition::Recover { .. }, JobState::Failed) => Some(ProgressPhase::Failed),
        (Transition::Cancel, _) => Some(ProgressPhase::Cancelled),
        _ => None,
    }
}

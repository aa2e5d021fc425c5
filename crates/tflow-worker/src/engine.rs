//! Transcoder engine seam.
//!
//! The engine is external: the pool hands it an asset and preset, reads
//! progress and a single terminal result from the returned stream, and
//! signals cancellation through a watch channel the engine checks at its
//! own checkpoints.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use tokio::sync::watch;
use tracing::debug;

use tflow_models::{AssetId, JobId, OutputDescriptor, Preset, TranscodeJob};
use tflow_storage::{output_key, ObjectStore};

use crate::error::WorkerError;

/// Everything the engine needs for one attempt.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub job_id: JobId,
    pub asset_id: AssetId,
    pub preset: Preset,
    pub attempt: u32,
}

impl EngineRequest {
    pub fn for_job(job: &TranscodeJob) -> Self {
        Self {
            job_id: job.id.clone(),
            asset_id: job.asset_id.clone(),
            preset: job.preset.clone(),
            attempt: job.attempt_count,
        }
    }
}

/// Engine-reported failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFailure {
    pub code: String,
    pub message: String,
    pub transient: bool,
}

impl EngineFailure {
    pub const CANCELLED: &'static str = "cancelled";

    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            transient: false,
        }
    }

    pub fn cancelled() -> Self {
        Self::permanent(Self::CANCELLED, "aborted on cancellation signal")
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == Self::CANCELLED
    }
}

impl From<EngineFailure> for WorkerError {
    fn from(failure: EngineFailure) -> Self {
        WorkerError::engine(failure.code, failure.message, failure.transient)
    }
}

/// One item of an engine run.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Percent complete, 0-100
    Progress(u8),
    /// Terminal result; nothing follows it.
    Finished(Result<OutputDescriptor, EngineFailure>),
}

pub type EngineStream = Pin<Box<dyn Stream<Item = EngineEvent> + Send>>;

/// External transcoder.
#[async_trait]
pub trait TranscoderEngine: Send + Sync {
    async fn run(&self, request: EngineRequest, cancel: watch::Receiver<bool>) -> EngineStream;
}

/// Resolve once `rx` holds `true`. Never resolves if the sender is gone.
pub(crate) async fn signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Scripted result of a [`SimulatedEngine`] run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatedOutcome {
    Succeed,
    FailTransient(String),
    FailPermanent(String),
    /// Report no progress and never finish.
    Hang,
}

/// Engine stand-in with paced progress.
///
/// Each run takes the next scripted outcome (default [`SimulatedOutcome::Succeed`])
/// and writes a small output object on success.
pub struct SimulatedEngine {
    objects: Arc<dyn ObjectStore>,
    steps: u8,
    step_delay: Duration,
    script: Mutex<VecDeque<SimulatedOutcome>>,
}

impl SimulatedEngine {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            objects,
            steps: 4,
            step_delay: Duration::from_millis(250),
            script: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_pacing(mut self, steps: u8, step_delay: Duration) -> Self {
        self.steps = steps.max(1);
        self.step_delay = step_delay;
        self
    }

    /// Queue outcomes for the next runs, in order.
    pub fn with_script(self, outcomes: impl IntoIterator<Item = SimulatedOutcome>) -> Self {
        self.push_outcomes(outcomes);
        self
    }

    pub fn push_outcomes(&self, outcomes: impl IntoIterator<Item = SimulatedOutcome>) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(outcomes);
    }

    fn next_outcome(&self) -> SimulatedOutcome {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(SimulatedOutcome::Succeed)
    }
}

struct SimulatedRun {
    request: EngineRequest,
    outcome: SimulatedOutcome,
    objects: Arc<dyn ObjectStore>,
    cancel: watch::Receiver<bool>,
    steps: u8,
    step: u8,
    step_delay: Duration,
    done: bool,
}

impl SimulatedRun {
    async fn advance(&mut self) -> Option<EngineEvent> {
        if self.done {
            return None;
        }

        if self.outcome == SimulatedOutcome::Hang {
            signalled(&mut self.cancel).await;
            return Some(self.finish(Err(EngineFailure::cancelled())));
        }

        if self.step < self.steps {
            tokio::select! {
                _ = tokio::time::sleep(self.step_delay) => {}
                _ = signalled(&mut self.cancel) => {}
            }
            if *self.cancel.borrow() {
                return Some(self.finish(Err(EngineFailure::cancelled())));
            }
            self.step += 1;
            let percent = (u32::from(self.step) * 100 / u32::from(self.steps)) as u8;
            return Some(EngineEvent::Progress(percent));
        }

        let result = match self.outcome.clone() {
            SimulatedOutcome::FailTransient(message) => Err(EngineFailure::transient("io", message)),
            SimulatedOutcome::FailPermanent(message) => {
                Err(EngineFailure::permanent("unsupported", message))
            }
            _ => self.write_output().await,
        };
        Some(self.finish(result))
    }

    async fn write_output(&self) -> Result<OutputDescriptor, EngineFailure> {
        let key = output_key(&self.request.job_id, self.request.attempt, &self.request.preset.name);
        let body = format!(
            "{} rendered as {} (attempt {})",
            self.request.asset_id, self.request.preset.name, self.request.attempt
        );
        let meta = self
            .objects
            .put(&key, body.into_bytes())
            .await
            .map_err(|e| EngineFailure::transient("output_write", e.to_string()))?;
        Ok(OutputDescriptor {
            location: meta.key,
            size_bytes: meta.size_bytes,
            checksum: meta.checksum,
            attempt: self.request.attempt,
        })
    }

    fn finish(&mut self, result: Result<OutputDescriptor, EngineFailure>) -> EngineEvent {
        self.done = true;
        EngineEvent::Finished(result)
    }
}

#[async_trait]
impl TranscoderEngine for SimulatedEngine {
    async fn run(&self, request: EngineRequest, cancel: watch::Receiver<bool>) -> EngineStream {
        let outcome = self.next_outcome();
        debug!(job_id = %request.job_id, attempt = request.attempt, ?outcome, "Simulated run");

        let run = SimulatedRun {
            request,
            outcome,
            objects: Arc::clone(&self.objects),
            cancel,
            steps: self.steps,
            step: 0,
            step_delay: self.step_delay,
            done: false,
        };
        futures_util::stream::unfold(run, |mut run| async move {
            run.advance().await.map(|event| (event, run))
        })
        .boxed()
    }
}

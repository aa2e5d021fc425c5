//! Worker pool scenarios against the in-memory collaborators.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::watch;

use tflow_models::{
    AssetId, JobId, JobState, Preset, ProgressPhase, ResourceClass, TranscodeJob, Transition,
};
use tflow_queue::{
    EnqueueRequest, EventBus, EventBusConfig, JobQueue, QueueConfig, SubscriptionFilter,
};
use tflow_storage::{sha256_hex, MemoryObjectStore, MemoryStore, ObjectStore};
use tflow_upload::{UploadConfig, UploadSessionManager};
use tflow_worker::{
    spawn_asset_intake, BackoffPolicy, EngineRequest, EngineStream, IntakeRule, SimulatedEngine,
    SimulatedOutcome, TranscoderEngine, WorkerConfig, WorkerPool,
};

struct Harness {
    queue: Arc<JobQueue>,
    objects: Arc<MemoryObjectStore>,
    engine: Arc<SimulatedEngine>,
    pool: Arc<WorkerPool>,
}

fn fast_config(cpu_slots: usize) -> WorkerConfig {
    WorkerConfig {
        cpu_slots,
        gpu_slots: 0,
        job_timeout: Duration::from_secs(10),
        heartbeat_interval: Duration::from_millis(20),
        heartbeat_timeout: Duration::from_secs(10),
        recovery_interval: Duration::from_secs(10),
        idle_poll_interval: Duration::from_millis(5),
        shutdown_grace: Duration::from_millis(20),
        shutdown_timeout: Duration::from_secs(2),
        backoff: BackoffPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(5),
            jitter: 0.0,
        },
    }
}

fn harness_with(config: WorkerConfig, steps: u8, step_delay: Duration) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let objects = Arc::new(MemoryObjectStore::new());
    let bus = Arc::new(EventBus::new(EventBusConfig::default()));
    let queue = Arc::new(JobQueue::new(QueueConfig::default(), store, bus));
    let engine = Arc::new(SimulatedEngine::new(objects.clone()).with_pacing(steps, step_delay));
    let pool = Arc::new(WorkerPool::new(config, queue.clone(), engine.clone()));
    Harness {
        queue,
        objects,
        engine,
        pool,
    }
}

/// Engine that panics on its first `panics` runs, then behaves like
/// the simulated engine.
struct PanickingEngine {
    panics: AtomicU32,
    inner: SimulatedEngine,
}

#[async_trait]
impl TranscoderEngine for PanickingEngine {
    async fn run(&self, request: EngineRequest, cancel: watch::Receiver<bool>) -> EngineStream {
        let remaining = self
            .panics
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if remaining.is_ok() {
            panic!("encoder crashed");
        }
        self.inner.run(request, cancel).await
    }
}

fn panicking_pool(panics: u32) -> (Arc<JobQueue>, Arc<WorkerPool>) {
    let bus = Arc::new(EventBus::new(EventBusConfig::default()));
    let queue = Arc::new(JobQueue::new(
        QueueConfig::default(),
        Arc::new(MemoryStore::new()),
        bus,
    ));
    let engine = Arc::new(PanickingEngine {
        panics: AtomicU32::new(panics),
        inner: SimulatedEngine::new(Arc::new(MemoryObjectStore::new()))
            .with_pacing(2, Duration::from_millis(1)),
    });
    let pool = Arc::new(WorkerPool::new(fast_config(1), queue.clone(), engine));
    (queue, pool)
}

fn harness(cpu_slots: usize) -> Harness {
    harness_with(fast_config(cpu_slots), 2, Duration::from_millis(1))
}

async fn enqueue(queue: &JobQueue, priority: u8, max_attempts: u32) -> JobId {
    queue
        .enqueue(
            EnqueueRequest::new(
                AssetId::new(),
                Preset::new("h264-720p"),
                priority,
                ResourceClass::Cpu,
            )
            .with_max_attempts(max_attempts),
        )
        .await
        .unwrap()
}

async fn wait_for(
    queue: &JobQueue,
    id: &JobId,
    done: impl Fn(&TranscodeJob) -> bool,
) -> TranscodeJob {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = queue.get_job(id).await.unwrap();
        if done(&job) {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} stuck in {} (attempt {})",
            id,
            job.state,
            job.attempt_count
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_terminal(queue: &JobQueue, id: &JobId) -> TranscodeJob {
    wait_for(queue, id, |j| j.is_terminal()).await
}

#[tokio::test]
async fn test_success_writes_output_and_reports_progress() {
    let h = harness(1);
    let id = enqueue(&h.queue, 5, 3).await;
    let events = h
        .queue
        .bus()
        .subscribe(SubscriptionFilter::job(id.clone()).replay(id.clone(), 1));

    h.pool.start();
    let job = wait_for_terminal(&h.queue, &id).await;
    h.pool.shutdown().await;

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempt_count, 1);
    let output = job.output.unwrap();
    assert_eq!(output.attempt, 1);
    let bytes = h.objects.get(&output.location).await.unwrap();
    assert_eq!(sha256_hex(&bytes), output.checksum);

    let phases: Vec<ProgressPhase> = events.take(5).map(|e| e.phase).collect().await;
    assert_eq!(
        phases,
        vec![
            ProgressPhase::Queued,
            ProgressPhase::Started,
            ProgressPhase::Progress,
            ProgressPhase::Progress,
            ProgressPhase::Completed,
        ]
    );
}

#[tokio::test]
async fn test_transient_failures_exhaust_attempts() {
    let h = harness(1);
    h.engine.push_outcomes([
        SimulatedOutcome::FailTransient("read stalled".into()),
        SimulatedOutcome::FailTransient("read stalled".into()),
        SimulatedOutcome::FailTransient("read stalled".into()),
    ]);
    let id = enqueue(&h.queue, 5, 3).await;

    h.pool.start();
    let job = wait_for_terminal(&h.queue, &id).await;
    // Give a fourth claim every chance to happen
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.pool.shutdown().await;

    let job_after = h.queue.get_job(&id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job_after.attempt_count, 3);
    assert!(job_after.last_error.unwrap().contains("read stalled"));

    let retries = h
        .queue
        .job_history(&id)
        .await
        .unwrap()
        .iter()
        .filter(|t| t.from == JobState::Processing && t.to == JobState::Queued)
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let h = harness(1);
    h.engine
        .push_outcomes([SimulatedOutcome::FailPermanent("unsupported codec".into())]);
    let id = enqueue(&h.queue, 5, 3).await;

    h.pool.start();
    let job = wait_for_terminal(&h.queue, &id).await;
    h.pool.shutdown().await;

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempt_count, 1);
    assert!(job.last_error.unwrap().contains("unsupported codec"));
}

#[tokio::test]
async fn test_transient_failure_then_success() {
    let h = harness(1);
    h.engine
        .push_outcomes([SimulatedOutcome::FailTransient("network blip".into())]);
    let id = enqueue(&h.queue, 5, 3).await;

    h.pool.start();
    let job = wait_for_terminal(&h.queue, &id).await;
    h.pool.shutdown().await;

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempt_count, 2);
    assert_eq!(job.output.unwrap().attempt, 2);
}

#[tokio::test]
async fn test_cancel_processing_job() {
    let h = harness_with(fast_config(1), 100, Duration::from_millis(20));
    let id = enqueue(&h.queue, 5, 3).await;

    h.pool.start();
    wait_for(&h.queue, &id, |j| j.state == JobState::Processing).await;
    h.queue.cancel_job(&id).await.unwrap();

    let job = wait_for_terminal(&h.queue, &id).await;
    h.pool.shutdown().await;

    assert_eq!(job.state, JobState::Cancelled);
    assert!(job.output.is_none());
    assert!(h.pool.slots().iter().all(|s| s.job_id.is_none()));
}

#[tokio::test]
async fn test_cancel_flag_without_signal_reaches_worker() {
    let h = harness_with(fast_config(1), 100, Duration::from_millis(20));
    let id = enqueue(&h.queue, 5, 3).await;

    h.pool.start();
    wait_for(&h.queue, &id, |j| j.state == JobState::Processing).await;
    // Only the stored flag is raised, as when a cancel lands before the
    // claimed job's signal is registered.
    let flagged = h.queue.transition(&id, Transition::RequestCancel).await.unwrap();
    assert!(flagged.cancel_requested);

    let job = wait_for_terminal(&h.queue, &id).await;
    h.pool.shutdown().await;

    assert_eq!(job.state, JobState::Cancelled);
    assert!(job.output.is_none());
}

#[tokio::test]
async fn test_engine_panic_is_retried_on_same_slot() {
    let (queue, pool) = panicking_pool(1);
    let id = enqueue(&queue, 5, 3).await;

    pool.start();
    let job = wait_for_terminal(&queue, &id).await;
    pool.shutdown().await;

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempt_count, 2);
    let history = queue.job_history(&id).await.unwrap();
    assert!(history[1].reason.as_deref().unwrap().contains("encoder crashed"));
    assert!(pool.slots().iter().all(|s| s.job_id.is_none()));
}

#[tokio::test]
async fn test_engine_that_always_panics_fails_the_job() {
    let (queue, pool) = panicking_pool(u32::MAX);
    let id = enqueue(&queue, 5, 3).await;
    let second = enqueue(&queue, 5, 1).await;

    pool.start();
    let job = wait_for_terminal(&queue, &id).await;
    let next = wait_for_terminal(&queue, &second).await;
    pool.shutdown().await;

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempt_count, 3);
    assert!(job.last_error.as_deref().unwrap().contains("worker panicked"));
    // The slot keeps serving after repeated panics
    assert_eq!(next.state, JobState::Failed);
}

#[tokio::test]
async fn test_timeout_is_treated_as_transient() {
    let mut config = fast_config(1);
    config.job_timeout = Duration::from_millis(30);
    let h = harness_with(config, 2, Duration::from_millis(1));
    h.engine.push_outcomes([SimulatedOutcome::Hang]);
    let id = enqueue(&h.queue, 5, 2).await;

    h.pool.start();
    let job = wait_for_terminal(&h.queue, &id).await;
    h.pool.shutdown().await;

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempt_count, 2);
    let history = h.queue.job_history(&id).await.unwrap();
    assert!(history[1].reason.as_deref().unwrap().contains("deadline"));
}

#[tokio::test]
async fn test_claims_are_exclusive_under_load() {
    let h = harness(8);
    let mut ids = Vec::new();
    for i in 0..40 {
        ids.push(enqueue(&h.queue, (i % 10 + 1) as u8, 3).await);
    }

    h.pool.start();
    for id in &ids {
        let job = wait_for_terminal(&h.queue, id).await;
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempt_count, 1);
    }
    h.pool.shutdown().await;

    let mut locations = HashSet::new();
    for id in &ids {
        locations.insert(h.queue.get_job(id).await.unwrap().output.unwrap().location);
    }
    assert_eq!(locations.len(), ids.len());
    assert_eq!(h.objects.len().await, ids.len());
}

#[tokio::test]
async fn test_single_slot_serves_urgent_job_first() {
    let h = harness(1);
    let relaxed = enqueue(&h.queue, 5, 3).await;
    let urgent = enqueue(&h.queue, 1, 3).await;

    h.pool.start();
    let relaxed = wait_for_terminal(&h.queue, &relaxed).await;
    let urgent = wait_for_terminal(&h.queue, &urgent).await;
    h.pool.shutdown().await;

    assert!(urgent.started_at.unwrap() < relaxed.started_at.unwrap());
}

#[tokio::test]
async fn test_stale_heartbeat_is_recovered_and_reclaimed() {
    let mut config = fast_config(1);
    config.heartbeat_timeout = Duration::from_millis(50);
    config.recovery_interval = Duration::from_millis(10);
    let h = harness_with(config, 2, Duration::from_millis(1));
    let id = enqueue(&h.queue, 5, 3).await;

    // A worker that claims and then dies without heartbeating
    let crashed = h
        .queue
        .next_for(ResourceClass::Cpu, "crashed-0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(crashed.job.attempt_count, 1);

    h.pool.start();
    let job = wait_for_terminal(&h.queue, &id).await;
    h.pool.shutdown().await;

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempt_count, 2);
    let history = h.queue.job_history(&id).await.unwrap();
    assert_eq!(history[1].from, JobState::Processing);
    assert_eq!(history[1].to, JobState::Queued);
    assert_eq!(history[1].attempt, 1);
}

#[tokio::test]
async fn test_startup_recovery_preserves_attempts() {
    let h = harness(1);
    let id = enqueue(&h.queue, 5, 3).await;
    h.queue
        .next_for(ResourceClass::Cpu, "previous-process")
        .await
        .unwrap()
        .unwrap();

    let report = h.pool.recover_on_startup().await.unwrap();
    assert_eq!(report.requeued, vec![id.clone()]);

    h.pool.start();
    let job = wait_for_terminal(&h.queue, &id).await;
    h.pool.shutdown().await;

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempt_count, 2);
}

#[tokio::test]
async fn test_shutdown_returns_in_flight_job_to_queue() {
    let h = harness_with(fast_config(1), 100, Duration::from_millis(20));
    let id = enqueue(&h.queue, 5, 3).await;

    h.pool.start();
    wait_for(&h.queue, &id, |j| j.state == JobState::Processing).await;
    let holds_job = |pool: &WorkerPool| {
        pool.slots()
            .iter()
            .filter(|s| s.job_id.as_ref() == Some(&id))
            .count()
    };
    for _ in 0..100 {
        if holds_job(&h.pool) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(holds_job(&h.pool), 1);

    h.pool.shutdown().await;
    let job = h.queue.get_job(&id).await.unwrap();
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.attempt_count, 1);
}

#[tokio::test]
async fn test_uploaded_asset_is_transcoded() {
    let h = harness(1);
    let store = Arc::new(MemoryStore::new());
    let uploads = Arc::new(UploadSessionManager::new(
        UploadConfig::default(),
        store,
        h.objects.clone(),
    ));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let intake = spawn_asset_intake(
        h.queue.clone(),
        uploads.subscribe_assets(),
        IntakeRule::defaults(),
        shutdown_rx,
    );
    let mut events = h
        .queue
        .bus()
        .subscribe(SubscriptionFilter::all().with_phases([ProgressPhase::Completed]));
    h.pool.start();

    let data = b"not really a video".to_vec();
    let session = uploads
        .initiate_upload(data.len() as u64, 8, None)
        .await
        .unwrap();
    for (index, chunk) in data.chunks(8).enumerate() {
        uploads
            .accept_chunk(&session, index as u32, chunk.to_vec(), &sha256_hex(chunk))
            .await
            .unwrap();
    }
    let asset = uploads
        .complete_upload(&session, &sha256_hex(&data))
        .await
        .unwrap();

    let completed = tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .unwrap()
        .unwrap();
    let job = h.queue.get_job(&completed.job_id).await.unwrap();
    assert_eq!(job.asset_id, asset.id);
    assert_eq!(job.preset.name, "h264-720p");

    h.pool.shutdown().await;
    shutdown_tx.send(true).unwrap();
    intake.await.unwrap();
}

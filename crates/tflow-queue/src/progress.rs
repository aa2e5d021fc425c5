//! Progress/event bus.
//!
//! Publishing never blocks: events go into a bounded broadcast channel and
//! a slow subscriber loses the oldest events instead of stalling the
//! publisher. The bus stamps each event with a per-job sequence number
//! and keeps a bounded per-job history so subscribers can resume from a
//! known sequence after a disconnect.

use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tflow_models::{JobId, ProgressEvent, ProgressPhase};

/// Lazy, unbounded sequence of events for one subscription.
pub type EventStream = Pin<Box<dyn Stream<Item = ProgressEvent> + Send>>;

/// Event bus configuration.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Events buffered per subscriber before the oldest are dropped
    pub capacity: usize,
    /// Events kept per job for replay
    pub replay_depth: usize,
    /// Finished jobs whose history is kept for replay
    pub retained_finished_jobs: usize,
    /// Finished jobs remembered after their history is evicted, so late
    /// events for them are still dropped
    pub tombstones: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            replay_depth: 256,
            retained_finished_jobs: 1024,
            tombstones: 65_536,
        }
    }
}

impl EventBusConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            capacity: std::env::var("EVENT_BUS_CAPACITY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1024),
            replay_depth: std::env::var("EVENT_REPLAY_DEPTH")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(256),
            retained_finished_jobs: std::env::var("EVENT_RETAINED_JOBS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1024),
            tombstones: std::env::var("EVENT_TOMBSTONES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(65_536),
        }
    }
}

/// Which events a subscriber wants, and where to resume.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    job_ids: Option<HashSet<JobId>>,
    phases: Option<HashSet<ProgressPhase>>,
    replay_from: HashMap<JobId, u64>,
}

impl SubscriptionFilter {
    /// Every event of every job.
    pub fn all() -> Self {
        Self::default()
    }

    /// Events of a single job.
    pub fn job(job_id: JobId) -> Self {
        Self::default().with_job(job_id)
    }

    pub fn with_job(mut self, job_id: JobId) -> Self {
        self.job_ids.get_or_insert_with(HashSet::new).insert(job_id);
        self
    }

    pub fn with_phases(mut self, phases: impl IntoIterator<Item = ProgressPhase>) -> Self {
        self.phases = Some(phases.into_iter().collect());
        self
    }

    /// Replay retained events of `job_id` with `seq >= from_seq` before
    /// switching to live delivery.
    pub fn replay(mut self, job_id: JobId, from_seq: u64) -> Self {
        self.replay_from.insert(job_id, from_seq);
        self
    }

    pub fn matches(&self, event: &ProgressEvent) -> bool {
        self.job_ids
            .as_ref()
            .map_or(true, |ids| ids.contains(&event.job_id))
            && self
                .phases
                .as_ref()
                .map_or(true, |phases| phases.contains(&event.phase))
    }
}

#[derive(Default)]
struct BusState {
    /// Last sequence of jobs that have not finished
    sequences: HashMap<JobId, u64>,
    history: HashMap<JobId, VecDeque<ProgressEvent>>,
    /// Finished jobs whose history is still retained, oldest first
    finished: VecDeque<JobId>,
    /// Final sequence of every remembered finished job
    closed: HashMap<JobId, u64>,
    closed_order: VecDeque<JobId>,
}

/// In-process fan-out of [`ProgressEvent`]s.
pub struct EventBus {
    config: EventBusConfig,
    tx: broadcast::Sender<ProgressEvent>,
    state: Mutex<BusState>,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        let (tx, _) = broadcast::channel(config.capacity.max(1));
        Self {
            config,
            tx,
            state: Mutex::new(BusState::default()),
        }
    }

    /// Stamp the next per-job sequence number and fan the event out.
    /// Returns the event as delivered, or `None` when the job already
    /// published its terminal event and this one was dropped.
    pub fn publish(&self, mut event: ProgressEvent) -> Option<ProgressEvent> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(last) = state.closed.get(&event.job_id) {
            debug!(
                job_id = %event.job_id,
                phase = ?event.phase,
                last_seq = last,
                "Dropping event for finished job"
            );
            return None;
        }

        let seq = state.sequences.entry(event.job_id.clone()).or_insert(0);
        *seq += 1;
        event.seq = *seq;

        let history = state.history.entry(event.job_id.clone()).or_default();
        history.push_back(event.clone());
        while history.len() > self.config.replay_depth {
            history.pop_front();
        }

        if event.phase.is_terminal() {
            state.sequences.remove(&event.job_id);
            state.closed.insert(event.job_id.clone(), event.seq);
            state.closed_order.push_back(event.job_id.clone());
            state.finished.push_back(event.job_id.clone());
            while state.finished.len() > self.config.retained_finished_jobs {
                if let Some(old) = state.finished.pop_front() {
                    state.history.remove(&old);
                }
            }
            let tombstones = self
                .config
                .tombstones
                .max(self.config.retained_finished_jobs);
            while state.closed_order.len() > tombstones {
                if let Some(old) = state.closed_order.pop_front() {
                    state.closed.remove(&old);
                }
            }
        }

        // Sent under the lock so channel order matches sequence order.
        // An error only means nobody is subscribed.
        let _ = self.tx.send(event.clone());
        Some(event)
    }

    /// Subscribe to events matching `filter`, replaying retained history
    /// first for every job named in the filter's resume points.
    pub fn subscribe(&self, filter: SubscriptionFilter) -> EventStream {
        let (rx, replay) = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let rx = self.tx.subscribe();
            let mut replay: Vec<ProgressEvent> = Vec::new();
            for (job_id, from_seq) in &filter.replay_from {
                if let Some(history) = state.history.get(job_id) {
                    replay.extend(
                        history
                            .iter()
                            .filter(|e| e.seq >= *from_seq && filter.matches(e))
                            .cloned(),
                    );
                }
            }
            (rx, replay)
        };

        debug!(replayed = replay.len(), "New event subscription");

        let subscription = Subscription {
            replay: replay.into(),
            rx,
            filter,
            delivered: HashMap::new(),
        };

        futures_util::stream::unfold(subscription, |mut sub| async move {
            sub.next_event().await.map(|event| (event, sub))
        })
        .boxed()
    }

    /// Retained history of a job, oldest first.
    pub fn history(&self, job_id: &JobId) -> Vec<ProgressEvent> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .history
            .get(job_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Last sequence number issued for a job (0 if none).
    pub fn last_seq(&self, job_id: &JobId) -> u64 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .sequences
            .get(job_id)
            .or_else(|| state.closed.get(job_id))
            .copied()
            .unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Forward matching events to `sink` until `shutdown` flips to true.
    pub fn attach_sink(
        &self,
        sink: Arc<dyn NotificationSink>,
        filter: SubscriptionFilter,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mut events = self.subscribe(filter);
        tokio::spawn(async move {
            info!(sink = sink.name(), "Notification sink attached");
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    event = events.next() => match event {
                        Some(event) => sink.deliver(&event).await,
                        None => break,
                    }
                }
            }
            debug!(sink = sink.name(), "Notification sink detached");
        })
    }
}

struct Subscription {
    replay: VecDeque<ProgressEvent>,
    rx: broadcast::Receiver<ProgressEvent>,
    filter: SubscriptionFilter,
    delivered: HashMap<JobId, u64>,
}

impl Subscription {
    async fn next_event(&mut self) -> Option<ProgressEvent> {
        if let Some(event) = self.replay.pop_front() {
            self.delivered.insert(event.job_id.clone(), event.seq);
            return Some(event);
        }

        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if !self.filter.matches(&event) {
                        continue;
                    }
                    let seen = self.delivered.get(&event.job_id).copied().unwrap_or(0);
                    if event.seq <= seen {
                        continue;
                    }
                    self.delivered.insert(event.job_id.clone(), event.seq);
                    return Some(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged, oldest events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Downstream receiver of published events (UI gateway, email trigger,
/// audit store). Delivery is not acknowledged.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, event: &ProgressEvent);
}

/// Sink that writes every event to the log.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn deliver(&self, event: &ProgressEvent) {
        info!(
            job_id = %event.job_id,
            phase = event.phase.as_str(),
            percent = event.percent,
            seq = event.seq,
            attempt = event.attempt,
            message = event.message.as_deref().unwrap_or(""),
            "Job event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn bus() -> EventBus {
        EventBus::new(EventBusConfig::default())
    }

    async fn next(stream: &mut EventStream) -> ProgressEvent {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn test_sequence_numbers_are_per_job() {
        let bus = bus();
        let a = JobId::new();
        let b = JobId::new();

        let seq = |event: Option<ProgressEvent>| event.map(|e| e.seq);
        assert_eq!(seq(bus.publish(ProgressEvent::progress(a.clone(), 1, 10))), Some(1));
        assert_eq!(seq(bus.publish(ProgressEvent::progress(b.clone(), 1, 10))), Some(1));
        assert_eq!(seq(bus.publish(ProgressEvent::progress(a.clone(), 1, 20))), Some(2));
        assert_eq!(bus.last_seq(&a), 2);
        assert_eq!(bus.last_seq(&b), 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_fail() {
        let bus = bus();
        let event = bus.publish(ProgressEvent::progress(JobId::new(), 1, 50));
        assert_eq!(event.map(|e| e.seq), Some(1));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_filter_by_job() {
        let bus = bus();
        let wanted = JobId::new();
        let mut stream = bus.subscribe(SubscriptionFilter::job(wanted.clone()));

        bus.publish(ProgressEvent::progress(JobId::new(), 1, 10));
        bus.publish(ProgressEvent::progress(wanted.clone(), 1, 30));

        let event = next(&mut stream).await;
        assert_eq!(event.job_id, wanted);
        assert_eq!(event.percent, 30);
    }

    #[tokio::test]
    async fn test_filter_by_phase() {
        let bus = bus();
        let job = JobId::new();
        let mut stream =
            bus.subscribe(SubscriptionFilter::all().with_phases([ProgressPhase::Completed]));

        bus.publish(ProgressEvent::progress(job.clone(), 1, 90));
        bus.publish(ProgressEvent::new(job.clone(), ProgressPhase::Completed, 100));

        let event = next(&mut stream).await;
        assert_eq!(event.phase, ProgressPhase::Completed);
        assert_eq!(event.seq, 2);
    }

    #[tokio::test]
    async fn test_replay_then_live_without_gaps_or_duplicates() {
        let bus = bus();
        let job = JobId::new();
        for pct in [10, 20, 30, 40] {
            bus.publish(ProgressEvent::progress(job.clone(), 1, pct));
        }

        let mut stream = bus.subscribe(SubscriptionFilter::job(job.clone()).replay(job.clone(), 3));
        bus.publish(ProgressEvent::progress(job.clone(), 1, 50));

        let seqs: Vec<u64> = vec![
            next(&mut stream).await.seq,
            next(&mut stream).await.seq,
            next(&mut stream).await.seq,
        ];
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_replay_depth_is_bounded() {
        let bus = EventBus::new(EventBusConfig {
            replay_depth: 2,
            ..Default::default()
        });
        let job = JobId::new();
        for pct in [10, 20, 30] {
            bus.publish(ProgressEvent::progress(job.clone(), 1, pct));
        }
        let history = bus.history(&job);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].seq, 2);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_drops_oldest_and_continues() {
        let bus = EventBus::new(EventBusConfig {
            capacity: 2,
            ..Default::default()
        });
        let job = JobId::new();
        let mut stream = bus.subscribe(SubscriptionFilter::all());

        for pct in [10, 20, 30, 40, 50] {
            bus.publish(ProgressEvent::progress(job.clone(), 1, pct));
        }

        let first = next(&mut stream).await;
        let second = next(&mut stream).await;
        assert_eq!((first.seq, second.seq), (4, 5));
    }

    #[tokio::test]
    async fn test_finished_job_history_is_evicted() {
        let bus = EventBus::new(EventBusConfig {
            retained_finished_jobs: 1,
            ..Default::default()
        });
        let first = JobId::new();
        let second = JobId::new();
        bus.publish(ProgressEvent::new(first.clone(), ProgressPhase::Completed, 100));
        bus.publish(ProgressEvent::new(second.clone(), ProgressPhase::Failed, 0));

        assert!(bus.history(&first).is_empty());
        assert_eq!(bus.history(&second).len(), 1);
        assert_eq!(bus.last_seq(&first), 1);
    }

    #[tokio::test]
    async fn test_events_after_terminal_are_dropped() {
        let bus = bus();
        let job = JobId::new();
        let mut stream = bus.subscribe(SubscriptionFilter::job(job.clone()));

        bus.publish(ProgressEvent::progress(job.clone(), 1, 40));
        bus.publish(ProgressEvent::new(job.clone(), ProgressPhase::Cancelled, 40));
        assert!(bus.publish(ProgressEvent::progress(job.clone(), 1, 60)).is_none());

        assert_eq!(next(&mut stream).await.seq, 1);
        assert_eq!(next(&mut stream).await.phase, ProgressPhase::Cancelled);
        assert!(tokio::time::timeout(Duration::from_millis(50), stream.next())
            .await
            .is_err());
        assert_eq!(bus.history(&job).len(), 2);
        assert_eq!(bus.last_seq(&job), 2);
    }

    #[tokio::test]
    async fn test_evicted_job_does_not_restart_sequence() {
        let bus = EventBus::new(EventBusConfig {
            retained_finished_jobs: 1,
            ..Default::default()
        });
        let first = JobId::new();
        bus.publish(ProgressEvent::progress(first.clone(), 1, 50));
        bus.publish(ProgressEvent::new(first.clone(), ProgressPhase::Completed, 100));
        bus.publish(ProgressEvent::new(JobId::new(), ProgressPhase::Completed, 100));
        assert!(bus.history(&first).is_empty());

        let mut stream = bus.subscribe(SubscriptionFilter::job(first.clone()).replay(first.clone(), 3));
        assert!(bus.publish(ProgressEvent::progress(first.clone(), 1, 70)).is_none());
        assert!(tokio::time::timeout(Duration::from_millis(50), stream.next())
            .await
            .is_err());
        assert_eq!(bus.last_seq(&first), 2);
    }
}

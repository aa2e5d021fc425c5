//! Job queue, state machine and progress bus for the transcoding core.
//!
//! This crate provides:
//! - Priority scheduling with aging per resource class
//! - Version-checked job state transitions with an audit log
//! - Progress and lifecycle events with per-job ordering and replay

pub mod error;
pub mod metrics;
pub mod progress;
pub mod queue;
pub mod state_machine;

pub use error::{QueueError, QueueResult};
pub use progress::{
    EventBus, EventBusConfig, EventStream, NotificationSink, SubscriptionFilter, TracingSink,
};
pub use queue::{
    CancelOutcome, ClaimedJob, EnqueueRequest, JobQueue, QueueConfig, QueueStats, RecoveryReport,
};
pub use state_machine::JobStateMachine;

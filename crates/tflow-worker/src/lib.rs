//! Transcoding worker.
//!
//! This crate provides:
//! - The worker pool with per-class slots, timeouts and cancellation
//! - Retry with exponential backoff and jitter
//! - Heartbeats and stale-job recovery
//! - The transcoder engine seam and a simulated engine
//! - Asset intake that turns uploaded assets into jobs

pub mod config;
pub mod engine;
pub mod error;
pub mod intake;
pub mod logging;
pub mod metrics;
pub mod outcome;
pub mod pool;
pub mod recovery;
pub mod retry;

pub use config::WorkerConfig;
pub use engine::{
    EngineEvent, EngineFailure, EngineRequest, EngineStream, SimulatedEngine, SimulatedOutcome,
    TranscoderEngine,
};
pub use error::{WorkerError, WorkerResult};
pub use intake::{spawn_asset_intake, IntakeRule};
pub use logging::JobLogger;
pub use outcome::JobOutcome;
pub use pool::{SlotSnapshot, WorkerPool};
pub use recovery::spawn_recovery;
pub use retry::{retry_async, BackoffPolicy, FailureTracker, RetryConfig};

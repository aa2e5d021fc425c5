//! Worker configuration.

use std::time::Duration;

use tflow_models::ResourceClass;

use crate::retry::BackoffPolicy;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Execution slots for CPU jobs
    pub cpu_slots: usize,
    /// Execution slots for GPU jobs
    pub gpu_slots: usize,
    /// Per-attempt deadline; exceeding it is a transient failure
    pub job_timeout: Duration,
    /// How often a running job refreshes its heartbeat
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which a processing job is requeued
    pub heartbeat_timeout: Duration,
    /// How often to scan for stale heartbeats
    pub recovery_interval: Duration,
    /// Poll interval of an idle slot (backoff expiry is not signalled)
    pub idle_poll_interval: Duration,
    /// Time in-flight jobs get to finish after shutdown is requested
    pub shutdown_grace: Duration,
    /// Upper bound on waiting for slots to stop
    pub shutdown_timeout: Duration,
    /// Delay before a transiently failed job is offered again
    pub backoff: BackoffPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cpu_slots: 2,
            gpu_slots: 1,
            job_timeout: Duration::from_secs(3600), // 1 hour
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(60),
            recovery_interval: Duration::from_secs(30),
            idle_poll_interval: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            cpu_slots: std::env::var("WORKER_CPU_SLOTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2),
            gpu_slots: std::env::var("WORKER_GPU_SLOTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1),
            job_timeout: Duration::from_secs(
                std::env::var("WORKER_JOB_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3600),
            ),
            heartbeat_interval: Duration::from_secs(
                std::env::var("WORKER_HEARTBEAT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
            ),
            heartbeat_timeout: Duration::from_secs(
                std::env::var("WORKER_HEARTBEAT_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
            recovery_interval: Duration::from_secs(
                std::env::var("WORKER_RECOVERY_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            idle_poll_interval: Duration::from_millis(
                std::env::var("WORKER_IDLE_POLL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(500),
            ),
            shutdown_grace: Duration::from_secs(
                std::env::var("WORKER_SHUTDOWN_GRACE_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
            shutdown_timeout: Duration::from_secs(
                std::env::var("WORKER_SHUTDOWN_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            backoff: BackoffPolicy::from_env(),
        }
    }

    pub fn slots_for(&self, class: ResourceClass) -> usize {
        match class {
            ResourceClass::Cpu => self.cpu_slots,
            ResourceClass::Gpu => self.gpu_slots,
        }
    }
}

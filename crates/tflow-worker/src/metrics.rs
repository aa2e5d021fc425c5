//! Prometheus metrics for the worker.

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use tflow_models::ResourceClass;

use crate::error::{WorkerError, WorkerResult};

/// Install the Prometheus recorder with an HTTP scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) -> WorkerResult<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| WorkerError::Metrics(e.to_string()))
}

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_COMPLETED_TOTAL: &str = "tflow_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "tflow_jobs_failed_total";
    pub const JOBS_RETRIED_TOTAL: &str = "tflow_jobs_retried_total";
    pub const JOBS_CANCELLED_TOTAL: &str = "tflow_jobs_cancelled_total";
    pub const JOBS_RECOVERED_TOTAL: &str = "tflow_jobs_recovered_total";
    pub const ENGINE_DURATION_SECONDS: &str = "tflow_engine_duration_seconds";
    pub const SLOTS_BUSY: &str = "tflow_worker_slots_busy";
    pub const HEARTBEAT_FAILURES_TOTAL: &str = "tflow_heartbeat_failures_total";
}

pub fn record_completed(class: ResourceClass) {
    counter!(names::JOBS_COMPLETED_TOTAL, "class" => class.as_str()).increment(1);
}

pub fn record_failed(class: ResourceClass, reason: &'static str) {
    let labels = [("class", class.as_str()), ("reason", reason)];
    counter!(names::JOBS_FAILED_TOTAL, &labels).increment(1);
}

pub fn record_retried(class: ResourceClass) {
    counter!(names::JOBS_RETRIED_TOTAL, "class" => class.as_str()).increment(1);
}

pub fn record_cancelled(class: ResourceClass) {
    counter!(names::JOBS_CANCELLED_TOTAL, "class" => class.as_str()).increment(1);
}

pub fn record_recovered(count: usize) {
    counter!(names::JOBS_RECOVERED_TOTAL).increment(count as u64);
}

pub fn record_engine_duration(class: ResourceClass, outcome: &'static str, elapsed: Duration) {
    let labels = [("class", class.as_str()), ("outcome", outcome)];
    histogram!(names::ENGINE_DURATION_SECONDS, &labels).record(elapsed.as_secs_f64());
}

pub fn set_busy_slots(class: ResourceClass, busy: usize) {
    gauge!(names::SLOTS_BUSY, "class" => class.as_str()).set(busy as f64);
}

pub fn record_heartbeat_failure() {
    counter!(names::HEARTBEAT_FAILURES_TOTAL).increment(1);
}

//! Queue metrics.

use metrics::{counter, gauge};

use tflow_models::{JobState, ResourceClass};

/// Metric names as constants for consistency.
pub mod names {
    pub const QUEUE_DEPTH: &str = "tflow_queue_depth";
    pub const JOBS_ENQUEUED_TOTAL: &str = "tflow_jobs_enqueued_total";
    pub const JOBS_CLAIMED_TOTAL: &str = "tflow_jobs_claimed_total";
    pub const JOB_TRANSITIONS_TOTAL: &str = "tflow_job_transitions_total";
    pub const CAS_CONFLICTS_TOTAL: &str = "tflow_job_cas_conflicts_total";
}

/// Update the pending-jobs gauge of one resource class.
pub fn set_queue_depth(class: ResourceClass, depth: usize) {
    gauge!(names::QUEUE_DEPTH, "class" => class.as_str()).set(depth as f64);
}

pub fn record_enqueued(class: ResourceClass) {
    counter!(names::JOBS_ENQUEUED_TOTAL, "class" => class.as_str()).increment(1);
}

pub fn record_claimed(class: ResourceClass) {
    counter!(names::JOBS_CLAIMED_TOTAL, "class" => class.as_str()).increment(1);
}

/// Record an applied transition that changed the job state.
pub fn record_transition(from: JobState, to: JobState) {
    let labels = [("from", from.as_str()), ("to", to.as_str())];
    counter!(names::JOB_TRANSITIONS_TOTAL, &labels).increment(1);
}

pub fn record_cas_conflict() {
    counter!(names::CAS_CONFLICTS_TOTAL).increment(1);
}

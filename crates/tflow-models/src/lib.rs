//! Shared data models for the tflow transcoding core.
//!
//! This crate provides Serde-serializable types for:
//! - Identifiers for jobs, upload sessions and assets
//! - Transcode jobs and their transition rules
//! - Upload session records and assets
//! - Progress events

pub mod error;
pub mod ids;
pub mod job;
pub mod progress;
pub mod upload;

// Re-export common types
pub use error::{ModelError, ModelResult};
pub use ids::{AssetId, JobId, SessionId};
pub use job::{
    JobState, JobTransition, OutputDescriptor, Preset, Priority, ResourceClass, TranscodeJob,
    Transition, MAX_PRIORITY, MIN_PRIORITY,
};
pub use progress::{ProgressEvent, ProgressPhase};
pub use upload::{chunk_count, Asset, UploadSessionRecord, UploadStatus};

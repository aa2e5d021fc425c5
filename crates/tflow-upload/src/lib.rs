//! Chunked upload sessions.
//!
//! This crate provides:
//! - Session initiation with size and chunk-count validation
//! - Idempotent, checksummed chunk acceptance
//! - Ordered reassembly with full-checksum verification
//! - Asset-ready signals for downstream job creation
//! - TTL garbage collection of idle sessions

pub mod config;
pub mod error;
pub mod manager;
mod session;

pub use config::UploadConfig;
pub use error::{UploadError, UploadResult};
pub use manager::{ChunkAck, UploadSessionManager};

//! Upload manager configuration.

use std::time::Duration;

/// Upload session configuration.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Maximum number of chunks a session may declare
    pub max_chunks: u32,
    /// Idle time after which a collecting session is failed
    pub session_ttl: Duration,
    /// How often the sweeper looks for idle sessions
    pub gc_interval: Duration,
    /// Buffered asset-ready signals per subscriber
    pub signal_capacity: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_chunks: 10_000,
            session_ttl: Duration::from_secs(3600), // 1 hour
            gc_interval: Duration::from_secs(60),
            signal_capacity: 256,
        }
    }
}

impl UploadConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            max_chunks: std::env::var("UPLOAD_MAX_CHUNKS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10_000),
            session_ttl: Duration::from_secs(
                std::env::var("UPLOAD_SESSION_TTL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3600),
            ),
            gc_interval: Duration::from_secs(
                std::env::var("UPLOAD_GC_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
            signal_capacity: 256,
        }
    }
}

//! Upload session and asset records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::{AssetId, SessionId};

/// Status of a chunked upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// Accepting chunks
    #[default]
    Collecting,
    /// Completion barrier passed, reassembly in progress
    Assembling,
    Complete,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Collecting => "collecting",
            UploadStatus::Assembling => "assembling",
            UploadStatus::Complete => "complete",
            UploadStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::Complete | UploadStatus::Failed)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Number of chunks needed for `total_size` bytes in `chunk_size` pieces.
pub fn chunk_count(total_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    total_size.div_ceil(chunk_size)
}

/// Persistable view of an upload session. Never carries chunk bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSessionRecord {
    pub id: SessionId,
    pub total_size: u64,
    pub chunk_size: u64,
    pub chunk_count: u32,
    #[serde(default)]
    pub received: BTreeSet<u32>,
    /// Declared at initiation, if the client knew it up front
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_checksum: Option<String>,
    #[serde(default)]
    pub status: UploadStatus,
    pub created_at: DateTime<Utc>,
    /// Initiation or last accepted chunk
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<AssetId>,
}

impl UploadSessionRecord {
    pub fn new(total_size: u64, chunk_size: u64, expected_checksum: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            total_size,
            chunk_size,
            chunk_count: chunk_count(total_size, chunk_size) as u32,
            received: BTreeSet::new(),
            expected_checksum,
            status: UploadStatus::Collecting,
            created_at: now,
            last_activity: now,
            failure_reason: None,
            asset_id: None,
        }
    }

    /// Byte length a chunk at `index` must have.
    pub fn expected_chunk_len(&self, index: u32) -> u64 {
        let start = u64::from(index) * self.chunk_size;
        self.chunk_size.min(self.total_size.saturating_sub(start))
    }

    /// Indices in `[0, chunk_count)` not yet received.
    pub fn missing_indices(&self) -> Vec<u32> {
        (0..self.chunk_count)
            .filter(|i| !self.received.contains(i))
            .collect()
    }

    pub fn is_fully_received(&self) -> bool {
        self.received.len() == self.chunk_count as usize
            && self.received.iter().all(|i| *i < self.chunk_count)
    }
}

/// An assembled, verified upload. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub session_id: SessionId,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    /// Object store key of the assembled bytes
    pub storage_ref: String,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_count_rounds_up() {
        assert_eq!(chunk_count(10, 4), 3);
        assert_eq!(chunk_count(12, 4), 3);
        assert_eq!(chunk_count(1, 4), 1);
        assert_eq!(chunk_count(10, 0), 0);
    }

    #[test]
    fn test_expected_chunk_len_handles_tail() {
        let record = UploadSessionRecord::new(10, 4, None);
        assert_eq!(record.chunk_count, 3);
        assert_eq!(record.expected_chunk_len(0), 4);
        assert_eq!(record.expected_chunk_len(1), 4);
        assert_eq!(record.expected_chunk_len(2), 2);
    }

    #[test]
    fn test_missing_indices() {
        let mut record = UploadSessionRecord::new(16, 4, None);
        record.received.insert(0);
        record.received.insert(2);
        assert_eq!(record.missing_indices(), vec![1, 3]);
        assert!(!record.is_fully_received());

        record.received.insert(1);
        record.received.insert(3);
        assert!(record.is_fully_received());
    }
}

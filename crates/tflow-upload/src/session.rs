//! In-memory state of one upload session.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use tflow_models::{UploadSessionRecord, UploadStatus};
use tflow_storage::{checksums_match, sha256_hex};

use crate::error::{UploadError, UploadResult};

struct Chunk {
    data: Vec<u8>,
    checksum: String,
}

/// Outcome of recording one chunk.
pub(crate) enum Accepted {
    New,
    Duplicate,
}

/// Session record plus the chunk buffers it owns until assembly.
pub(crate) struct UploadSession {
    pub(crate) record: UploadSessionRecord,
    chunks: HashMap<u32, Chunk>,
    /// The stored record lags behind `record`
    pub(crate) unsynced: bool,
}

impl UploadSession {
    pub(crate) fn new(record: UploadSessionRecord) -> Self {
        Self {
            record,
            chunks: HashMap::new(),
            unsynced: false,
        }
    }

    pub(crate) fn is_collecting(&self) -> bool {
        self.record.status == UploadStatus::Collecting
    }

    /// Validate and record a chunk.
    pub(crate) fn accept(
        &mut self,
        index: u32,
        data: Vec<u8>,
        declared: &str,
        now: DateTime<Utc>,
    ) -> UploadResult<Accepted> {
        if index >= self.record.chunk_count {
            return Err(UploadError::validation(format!(
                "chunk index {} out of range (session has {} chunks)",
                index, self.record.chunk_count
            )));
        }

        let computed = sha256_hex(&data);
        if !checksums_match(&computed, declared) {
            return Err(UploadError::validation(format!(
                "chunk {} checksum mismatch: declared {}, computed {}",
                index, declared, computed
            )));
        }

        if let Some(existing) = self.chunks.get(&index) {
            if existing.checksum == computed {
                return Ok(Accepted::Duplicate);
            }
            return Err(UploadError::validation(format!(
                "chunk {} already received with a different checksum",
                index
            )));
        }

        let expected_len = self.record.expected_chunk_len(index);
        if data.len() as u64 != expected_len {
            return Err(UploadError::validation(format!(
                "chunk {} has {} bytes, expected {}",
                index,
                data.len(),
                expected_len
            )));
        }

        self.chunks.insert(
            index,
            Chunk {
                data,
                checksum: computed,
            },
        );
        self.record.received.insert(index);
        self.record.last_activity = now;
        Ok(Accepted::New)
    }

    /// Undo a newly recorded chunk whose record write failed.
    pub(crate) fn forget(&mut self, index: u32, last_activity: DateTime<Utc>) {
        self.chunks.remove(&index);
        self.record.received.remove(&index);
        self.record.last_activity = last_activity;
    }

    /// Concatenate chunks in index order. Caller checks completeness first.
    pub(crate) fn assemble(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.record.total_size as usize);
        for index in 0..self.record.chunk_count {
            if let Some(chunk) = self.chunks.get(&index) {
                buffer.extend_from_slice(&chunk.data);
            }
        }
        buffer
    }

    pub(crate) fn fail(&mut self, reason: impl Into<String>) {
        self.record.status = UploadStatus::Failed;
        self.record.failure_reason = Some(reason.into());
        self.release_buffers();
    }

    pub(crate) fn release_buffers(&mut self) {
        self.chunks.clear();
        self.chunks.shrink_to_fit();
    }

    pub(crate) fn buffered_bytes(&self) -> usize {
        self.chunks.values().map(|c| c.data.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(total: u64, chunk: u64) -> UploadSession {
        UploadSession::new(UploadSessionRecord::new(total, chunk, None))
    }

    #[test]
    fn test_assemble_orders_by_index() {
        let mut s = session(6, 2);
        let now = Utc::now();
        for (i, part) in [(2u32, b"ef"), (0, b"ab"), (1, b"cd")] {
            s.accept(i, part.to_vec(), &sha256_hex(part), now).unwrap();
        }
        assert_eq!(s.assemble(), b"abcdef");
    }

    #[test]
    fn test_wrong_length_rejected() {
        let mut s = session(6, 4);
        let now = Utc::now();
        let short = b"ab";
        assert!(s.accept(0, short.to_vec(), &sha256_hex(short), now).is_err());
        // tail chunk is 2 bytes
        assert!(s.accept(1, short.to_vec(), &sha256_hex(short), now).is_ok());
    }

    #[test]
    fn test_fail_releases_buffers() {
        let mut s = session(4, 4);
        s.accept(0, b"abcd".to_vec(), &sha256_hex(b"abcd"), Utc::now())
            .unwrap();
        assert_eq!(s.buffered_bytes(), 4);
        s.fail("expired");
        assert_eq!(s.buffered_bytes(), 0);
        assert_eq!(s.record.status, UploadStatus::Failed);
    }

    #[test]
    fn test_forget_makes_chunk_new_again() {
        let mut s = session(8, 4);
        let before = s.record.last_activity;
        let later = before + chrono::Duration::seconds(5);
        s.accept(1, b"efgh".to_vec(), &sha256_hex(b"efgh"), later)
            .unwrap();

        s.forget(1, before);
        assert!(s.record.received.is_empty());
        assert_eq!(s.record.last_activity, before);
        assert!(matches!(
            s.accept(1, b"efgh".to_vec(), &sha256_hex(b"efgh"), later),
            Ok(Accepted::New)
        ));
    }
}

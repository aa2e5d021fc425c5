//! Upload error types.

use thiserror::Error;

use tflow_storage::StorageError;

pub type UploadResult<T> = Result<T, UploadError>;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Upload session not found: {0}")]
    NotFound(String),

    #[error("Checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Upload incomplete, missing chunks {missing:?}")]
    IncompleteUpload { missing: Vec<u32> },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl UploadError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

//! Durable record storage.
//!
//! The transcoding core only needs read, write and a compare-and-swap on
//! job records. Job CAS is keyed on [`TranscodeJob::version`]: the write
//! succeeds only if the stored record still carries the version the
//! caller read.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use tflow_models::{Asset, AssetId, JobId, JobState, SessionId, TranscodeJob, UploadSessionRecord};

use crate::error::{StorageError, StorageResult};

/// Result of a compare-and-swap on a job record.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The new record was written.
    Swapped,
    /// The stored record moved on; carries the current record.
    Conflict(TranscodeJob),
}

/// Record storage for upload sessions, assets and jobs.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Insert or replace an upload session record.
    async fn put_session(&self, record: &UploadSessionRecord) -> StorageResult<()>;

    async fn get_session(&self, id: &SessionId) -> StorageResult<Option<UploadSessionRecord>>;

    /// Insert an asset. Assets are immutable, so an existing id is an error.
    async fn put_asset(&self, asset: &Asset) -> StorageResult<()>;

    async fn get_asset(&self, id: &AssetId) -> StorageResult<Option<Asset>>;

    /// Insert a new job record. An existing id is an error.
    async fn insert_job(&self, job: &TranscodeJob) -> StorageResult<()>;

    async fn get_job(&self, id: &JobId) -> StorageResult<Option<TranscodeJob>>;

    /// Replace the job record if the stored version equals `expected_version`.
    async fn compare_and_swap_job(
        &self,
        expected_version: u64,
        job: &TranscodeJob,
    ) -> StorageResult<CasOutcome>;

    /// All jobs, optionally restricted to one state.
    async fn list_jobs(&self, state: Option<JobState>) -> StorageResult<Vec<TranscodeJob>>;
}

/// In-process [`PersistenceStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<SessionId, UploadSessionRecord>>,
    assets: RwLock<HashMap<AssetId, Asset>>,
    jobs: RwLock<HashMap<JobId, TranscodeJob>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn put_session(&self, record: &UploadSessionRecord) -> StorageResult<()> {
        self.sessions
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> StorageResult<Option<UploadSessionRecord>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn put_asset(&self, asset: &Asset) -> StorageResult<()> {
        let mut assets = self.assets.write().await;
        if assets.contains_key(&asset.id) {
            return Err(StorageError::already_exists(format!("asset {}", asset.id)));
        }
        assets.insert(asset.id.clone(), asset.clone());
        Ok(())
    }

    async fn get_asset(&self, id: &AssetId) -> StorageResult<Option<Asset>> {
        Ok(self.assets.read().await.get(id).cloned())
    }

    async fn insert_job(&self, job: &TranscodeJob) -> StorageResult<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(StorageError::already_exists(format!("job {}", job.id)));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> StorageResult<Option<TranscodeJob>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn compare_and_swap_job(
        &self,
        expected_version: u64,
        job: &TranscodeJob,
    ) -> StorageResult<CasOutcome> {
        let mut jobs = self.jobs.write().await;
        let current = jobs
            .get_mut(&job.id)
            .ok_or_else(|| StorageError::not_found(format!("job {}", job.id)))?;

        if current.version != expected_version {
            debug!(
                job_id = %job.id,
                expected = expected_version,
                actual = current.version,
                "Job CAS conflict"
            );
            return Ok(CasOutcome::Conflict(current.clone()));
        }

        *current = job.clone();
        Ok(CasOutcome::Swapped)
    }

    async fn list_jobs(&self, state: Option<JobState>) -> StorageResult<Vec<TranscodeJob>> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|j| state.map_or(true, |s| j.state == s))
            .cloned()
            .collect())
    }
}

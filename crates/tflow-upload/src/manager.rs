//! Upload session manager.
//!
//! Each session sits behind its own async mutex. Chunk writers to
//! different sessions never contend; writers to the same session are
//! serialized only for the in-memory insert. Completion holds the session
//! lock for the whole reassembly, which is the barrier that keeps late
//! chunks out of an assembly in progress.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tflow_models::{Asset, AssetId, SessionId, UploadSessionRecord, UploadStatus};
use tflow_storage::{asset_key, checksums_match, sha256_hex, ObjectStore, PersistenceStore};

use crate::config::UploadConfig;
use crate::error::{UploadError, UploadResult};
use crate::session::{Accepted, UploadSession};

/// Acknowledgement of an accepted chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkAck {
    pub session_id: SessionId,
    pub index: u32,
    /// The index had already been received with the same checksum
    pub duplicate: bool,
    pub received: u32,
    pub expected: u32,
}

/// Assembles chunked uploads into assets.
pub struct UploadSessionManager {
    config: UploadConfig,
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<UploadSession>>>>,
    store: Arc<dyn PersistenceStore>,
    objects: Arc<dyn ObjectStore>,
    asset_tx: broadcast::Sender<Asset>,
}

impl UploadSessionManager {
    pub fn new(
        config: UploadConfig,
        store: Arc<dyn PersistenceStore>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        let (asset_tx, _) = broadcast::channel(config.signal_capacity.max(1));
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            store,
            objects,
            asset_tx,
        }
    }

    /// Receive an [`Asset`] for every successfully completed upload.
    pub fn subscribe_assets(&self) -> broadcast::Receiver<Asset> {
        self.asset_tx.subscribe()
    }

    /// Open a new session.
    pub async fn initiate_upload(
        &self,
        total_size: u64,
        chunk_size: u64,
        expected_checksum: Option<String>,
    ) -> UploadResult<SessionId> {
        if total_size == 0 {
            return Err(UploadError::validation("total size must be positive"));
        }
        if chunk_size == 0 {
            return Err(UploadError::validation("chunk size must be positive"));
        }
        let chunks = tflow_models::chunk_count(total_size, chunk_size);
        if chunks > u64::from(self.config.max_chunks) {
            return Err(UploadError::validation(format!(
                "upload needs {} chunks, maximum is {}",
                chunks, self.config.max_chunks
            )));
        }

        let record = UploadSessionRecord::new(total_size, chunk_size, expected_checksum);
        let session_id = record.id.clone();
        self.store.put_session(&record).await?;

        self.sessions
            .write()
            .await
            .insert(session_id.clone(), Arc::new(Mutex::new(UploadSession::new(record))));

        info!(
            session_id = %session_id,
            total_size,
            chunk_size,
            chunks,
            "Upload session initiated"
        );
        Ok(session_id)
    }

    /// Record one chunk. Re-sending an identical chunk is a no-op.
    pub async fn accept_chunk(
        &self,
        session_id: &SessionId,
        index: u32,
        data: Vec<u8>,
        chunk_checksum: &str,
    ) -> UploadResult<ChunkAck> {
        let handle = self.session(session_id).await?;
        let mut session = handle.lock().await;

        if !session.is_collecting() {
            return Err(UploadError::not_found(format!(
                "session {} is {}",
                session_id, session.record.status
            )));
        }

        let last_activity = session.record.last_activity;
        let accepted = session.accept(index, data, chunk_checksum, Utc::now())?;
        let duplicate = matches!(accepted, Accepted::Duplicate);
        if !duplicate {
            if let Err(e) = self.store.put_session(&session.record).await {
                // The client will resend; it must not be acked as a duplicate
                session.forget(index, last_activity);
                return Err(e.into());
            }
        }

        let ack = ChunkAck {
            session_id: session_id.clone(),
            index,
            duplicate,
            received: session.record.received.len() as u32,
            expected: session.record.chunk_count,
        };
        debug!(
            session_id = %session_id,
            index,
            duplicate,
            received = ack.received,
            expected = ack.expected,
            "Chunk accepted"
        );
        Ok(ack)
    }

    /// Reassemble, verify and publish the asset.
    pub async fn complete_upload(
        &self,
        session_id: &SessionId,
        full_checksum: &str,
    ) -> UploadResult<Asset> {
        self.complete_upload_with_duration(session_id, full_checksum, None)
            .await
    }

    /// [`complete_upload`](Self::complete_upload) with a known media duration.
    pub async fn complete_upload_with_duration(
        &self,
        session_id: &SessionId,
        full_checksum: &str,
        duration_secs: Option<f64>,
    ) -> UploadResult<Asset> {
        let handle = self.session(session_id).await?;
        let mut session = handle.lock().await;

        if !session.is_collecting() {
            return Err(UploadError::not_found(format!(
                "session {} is {}",
                session_id, session.record.status
            )));
        }

        let missing = session.record.missing_indices();
        if !missing.is_empty() {
            return Err(UploadError::IncompleteUpload { missing });
        }

        if let Some(declared) = &session.record.expected_checksum {
            if !checksums_match(declared, full_checksum) {
                return Err(UploadError::validation(format!(
                    "completion checksum {} disagrees with checksum {} declared at initiation",
                    full_checksum, declared
                )));
            }
        }

        session.record.status = UploadStatus::Assembling;
        let bytes = session.assemble();
        let computed = sha256_hex(&bytes);

        if !checksums_match(&computed, full_checksum) {
            session.fail("assembled checksum mismatch");
            self.persist(session_id, &mut session).await;
            warn!(
                session_id = %session_id,
                expected = %full_checksum,
                actual = %computed,
                "Upload failed checksum verification"
            );
            return Err(UploadError::ChecksumMismatch {
                expected: full_checksum.to_string(),
                actual: computed,
            });
        }

        let asset_id = AssetId::new();
        let key = asset_key(&asset_id);
        let meta = match self.objects.put(&key, bytes).await {
            Ok(meta) => meta,
            Err(e) => {
                // Buffers are still intact, so the caller may retry completion.
                session.record.status = UploadStatus::Collecting;
                return Err(e.into());
            }
        };

        let asset = Asset {
            id: asset_id.clone(),
            session_id: session_id.clone(),
            size_bytes: meta.size_bytes,
            duration_secs,
            storage_ref: meta.key,
            checksum: computed,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.put_asset(&asset).await {
            session.record.status = UploadStatus::Collecting;
            if let Err(cleanup) = self.objects.delete(&key).await {
                warn!(
                    session_id = %session_id,
                    key = %key,
                    error = %cleanup,
                    "Failed to remove object of unrecorded asset"
                );
            }
            return Err(e.into());
        }

        // The asset is durable from here on; a lagging session record is
        // written again by the sweeper.
        session.record.status = UploadStatus::Complete;
        session.record.asset_id = Some(asset_id.clone());
        session.record.last_activity = Utc::now();
        session.release_buffers();
        self.persist(session_id, &mut session).await;

        info!(
            session_id = %session_id,
            asset_id = %asset_id,
            size = asset.size_bytes,
            "Upload complete, asset ready"
        );

        // No subscribers is not an error
        let _ = self.asset_tx.send(asset.clone());
        Ok(asset)
    }

    /// Current record of a session, falling back to the persistence store
    /// for sessions already swept from memory.
    pub async fn get_session(&self, session_id: &SessionId) -> UploadResult<UploadSessionRecord> {
        let handle = self.sessions.read().await.get(session_id).cloned();
        if let Some(handle) = handle {
            return Ok(handle.lock().await.record.clone());
        }
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| UploadError::not_found(session_id.to_string()))
    }

    /// Fail collecting sessions idle past the TTL and drop terminal
    /// sessions from memory. Returns the ids of sessions that were failed.
    pub async fn collect_expired(&self, now: DateTime<Utc>) -> UploadResult<Vec<SessionId>> {
        let ttl = chrono::Duration::from_std(self.config.session_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = now - ttl;

        let handles: Vec<(SessionId, Arc<Mutex<UploadSession>>)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, s)| (id.clone(), Arc::clone(s)))
            .collect();

        let mut expired = Vec::new();
        let mut purge = Vec::new();

        for (id, handle) in handles {
            let mut session = handle.lock().await;
            if session.record.last_activity >= cutoff {
                continue;
            }
            if session.is_collecting() {
                let released = session.buffered_bytes();
                session.fail("session expired without activity");
                self.persist(&id, &mut session).await;
                info!(session_id = %id, released_bytes = released, "Upload session expired");
                expired.push(id.clone());
            }
            if session.record.status.is_terminal()
                && (!session.unsynced || self.persist(&id, &mut session).await)
            {
                purge.push(id);
            }
        }

        if !purge.is_empty() {
            let mut sessions = self.sessions.write().await;
            for id in &purge {
                sessions.remove(id);
            }
            debug!(count = purge.len(), "Purged terminal upload sessions from memory");
        }

        Ok(expired)
    }

    /// Run [`collect_expired`](Self::collect_expired) every `gc_interval`
    /// until `shutdown` flips to true.
    pub fn spawn_gc(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.gc_interval);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        match self.collect_expired(Utc::now()).await {
                            Ok(expired) if !expired.is_empty() => {
                                info!("Expired {} idle upload sessions", expired.len());
                            }
                            Ok(_) => {}
                            Err(e) => warn!("Upload session sweep failed: {}", e),
                        }
                    }
                }
            }
            debug!("Upload session sweeper stopped");
        })
    }

    /// Write the session record. A failed write is logged and left for
    /// the sweeper to retry; returns whether the store is up to date.
    async fn persist(&self, session_id: &SessionId, session: &mut UploadSession) -> bool {
        match self.store.put_session(&session.record).await {
            Ok(()) => {
                session.unsynced = false;
                true
            }
            Err(e) => {
                session.unsynced = true;
                warn!(session_id = %session_id, error = %e, "Failed to persist upload session");
                false
            }
        }
    }

    async fn session(&self, session_id: &SessionId) -> UploadResult<Arc<Mutex<UploadSession>>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| UploadError::not_found(session_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tflow_storage::{MemoryObjectStore, MemoryStore};

    fn manager(config: UploadConfig) -> UploadSessionManager {
        UploadSessionManager::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryObjectStore::new()),
        )
    }

    #[tokio::test]
    async fn test_initiate_validation() {
        let m = manager(UploadConfig {
            max_chunks: 4,
            ..Default::default()
        });

        assert!(matches!(
            m.initiate_upload(0, 10, None).await,
            Err(UploadError::Validation(_))
        ));
        assert!(matches!(
            m.initiate_upload(10, 0, None).await,
            Err(UploadError::Validation(_))
        ));
        assert!(matches!(
            m.initiate_upload(100, 10, None).await,
            Err(UploadError::Validation(_))
        ));
        assert!(m.initiate_upload(40, 10, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let m = manager(UploadConfig::default());
        let result = m
            .accept_chunk(&SessionId::new(), 0, b"x".to_vec(), &sha256_hex(b"x"))
            .await;
        assert!(matches!(result, Err(UploadError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_out_of_range_and_bad_checksum() {
        let m = manager(UploadConfig::default());
        let id = m.initiate_upload(8, 4, None).await.unwrap();

        let oob = m.accept_chunk(&id, 2, b"abcd".to_vec(), &sha256_hex(b"abcd")).await;
        assert!(matches!(oob, Err(UploadError::Validation(_))));

        let bad = m.accept_chunk(&id, 0, b"abcd".to_vec(), &sha256_hex(b"zzzz")).await;
        assert!(matches!(bad, Err(UploadError::Validation(_))));

        let record = m.get_session(&id).await.unwrap();
        assert!(record.received.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_chunk_leaves_state_unchanged() {
        let m = manager(UploadConfig::default());
        let id = m.initiate_upload(8, 4, None).await.unwrap();

        let first = m.accept_chunk(&id, 1, b"efgh".to_vec(), &sha256_hex(b"efgh")).await.unwrap();
        assert!(!first.duplicate);
        let before = m.get_session(&id).await.unwrap();

        let second = m.accept_chunk(&id, 1, b"efgh".to_vec(), &sha256_hex(b"efgh")).await.unwrap();
        assert!(second.duplicate);
        assert_eq!(m.get_session(&id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_incomplete_upload_names_missing_indices() {
        let m = manager(UploadConfig::default());
        let id = m.initiate_upload(12, 4, None).await.unwrap();
        m.accept_chunk(&id, 1, b"efgh".to_vec(), &sha256_hex(b"efgh")).await.unwrap();

        match m.complete_upload(&id, &sha256_hex(b"whatever")).await {
            Err(UploadError::IncompleteUpload { missing }) => assert_eq!(missing, vec![0, 2]),
            other => panic!("expected IncompleteUpload, got {:?}", other),
        }
        // Still collecting
        assert_eq!(m.get_session(&id).await.unwrap().status, UploadStatus::Collecting);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails_session() {
        let m = manager(UploadConfig::default());
        let id = m.initiate_upload(4, 4, None).await.unwrap();
        m.accept_chunk(&id, 0, b"abcd".to_vec(), &sha256_hex(b"abcd")).await.unwrap();

        let result = m.complete_upload(&id, &sha256_hex(b"dcba")).await;
        assert!(matches!(result, Err(UploadError::ChecksumMismatch { .. })));
        assert_eq!(m.get_session(&id).await.unwrap().status, UploadStatus::Failed);

        let late = m.accept_chunk(&id, 0, b"abcd".to_vec(), &sha256_hex(b"abcd")).await;
        assert!(matches!(late, Err(UploadError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_declared_checksum_must_agree() {
        let m = manager(UploadConfig::default());
        let id = m
            .initiate_upload(4, 4, Some(sha256_hex(b"abcd")))
            .await
            .unwrap();
        m.accept_chunk(&id, 0, b"abcd".to_vec(), &sha256_hex(b"abcd")).await.unwrap();

        let result = m.complete_upload(&id, &sha256_hex(b"other")).await;
        assert!(matches!(result, Err(UploadError::Validation(_))));
        assert!(m.complete_upload(&id, &sha256_hex(b"abcd")).await.is_ok());
    }

    #[tokio::test]
    async fn test_collect_expired_fails_idle_sessions() {
        let m = manager(UploadConfig {
            session_ttl: std::time::Duration::from_secs(60),
            ..Default::default()
        });
        let idle = m.initiate_upload(8, 4, None).await.unwrap();

        let expired = m.collect_expired(Utc::now()).await.unwrap();
        assert!(expired.is_empty());

        let later = Utc::now() + chrono::Duration::seconds(61);
        let expired = m.collect_expired(later).await.unwrap();
        assert_eq!(expired, vec![idle.clone()]);

        // Swept from memory, still visible through the store
        let record = m.get_session(&idle).await.unwrap();
        assert_eq!(record.status, UploadStatus::Failed);
        let late = m.accept_chunk(&idle, 0, b"abcd".to_vec(), &sha256_hex(b"abcd")).await;
        assert!(matches!(late, Err(UploadError::NotFound(_))));
    }
}

//! Object storage for assembled assets and transcoded outputs.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use tflow_models::{AssetId, JobId};

use crate::checksum::sha256_hex;
use crate::error::{StorageError, StorageResult};

/// Metadata of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size_bytes: u64,
    pub checksum: String,
}

/// Key of an assembled asset.
///
/// Format: `assets/{asset_id}`
pub fn asset_key(asset_id: &AssetId) -> String {
    format!("assets/{}", asset_id)
}

/// Key of a transcoded output. Attempts never share a key, so a retried
/// job replaces nothing written by an earlier attempt.
///
/// Format: `outputs/{job_id}/{attempt}/{preset}`
pub fn output_key(job_id: &JobId, attempt: u32, preset: &str) -> String {
    format!("outputs/{}/{}/{}", job_id, attempt, preset)
}

fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() || key.starts_with('/') || key.split('/').any(|p| p == "..") {
        return Err(StorageError::invalid_key(key));
    }
    Ok(())
}

/// Blob storage addressed by key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes under `key`, replacing any previous object.
    async fn put(&self, key: &str, data: Vec<u8>) -> StorageResult<ObjectMeta>;

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>>;

    async fn head(&self, key: &str) -> StorageResult<Option<ObjectMeta>>;

    async fn delete(&self, key: &str) -> StorageResult<()>;
}

/// In-process [`ObjectStore`].
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> StorageResult<ObjectMeta> {
        validate_key(key)?;
        let meta = ObjectMeta {
            key: key.to_string(),
            size_bytes: data.len() as u64,
            checksum: sha256_hex(&data),
        };
        self.objects.write().await.insert(key.to_string(), data);
        debug!(key = %key, size = meta.size_bytes, "Stored object");
        Ok(meta)
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        validate_key(key)?;
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::not_found(key))
    }

    async fn head(&self, key: &str) -> StorageResult<Option<ObjectMeta>> {
        validate_key(key)?;
        Ok(self.objects.read().await.get(key).map(|data| ObjectMeta {
            key: key.to_string(),
            size_bytes: data.len() as u64,
            checksum: sha256_hex(data),
        }))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        self.objects.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_head_delete() {
        let store = MemoryObjectStore::new();
        let meta = store.put("assets/a", b"hello".to_vec()).await.unwrap();
        assert_eq!(meta.size_bytes, 5);
        assert_eq!(meta.checksum, sha256_hex(b"hello"));

        assert_eq!(store.get("assets/a").await.unwrap(), b"hello");
        assert_eq!(store.head("assets/a").await.unwrap(), Some(meta));

        store.delete("assets/a").await.unwrap();
        assert!(matches!(
            store.get("assets/a").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_traversal_keys() {
        let store = MemoryObjectStore::new();
        assert!(store.put("../etc", vec![]).await.is_err());
        assert!(store.put("", vec![]).await.is_err());
        assert!(store.put("/abs", vec![]).await.is_err());
    }

    #[test]
    fn test_output_key_includes_attempt() {
        let job_id = JobId::from_string("j1");
        assert_eq!(output_key(&job_id, 2, "h264-720p"), "outputs/j1/2/h264-720p");
        assert_eq!(asset_key(&AssetId::from_string("a1")), "assets/a1");
    }
}

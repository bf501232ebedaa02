//! Persistent cache store for resume state
//!
//! One serialized [`ResumeCacheRecord`] lives in a fixed slot inside the
//! data directory, next to a cache directory holding the resume-token
//! blob and the partial payload it references. The store is handed to
//! the engine at construction, so tests run against isolated instances.

use crate::error::FetchError;
use modelfetch_types::ResumeCacheRecord;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Fixed slot name for the resume record.
pub const CACHE_INFO_KEY: &str = "download-cache-info";

/// Suffix reserved for resume-token blobs, so they never collide with
/// the artifact's final file name.
pub const RESUME_SUFFIX: &str = ".resume";

/// Suffix reserved for partial payload files.
pub const PARTIAL_SUFFIX: &str = ".part";

/// Store for the resume record and its on-disk companions
#[derive(Debug, Clone)]
pub struct CacheStore {
    data_dir: PathBuf,
    cache_dir: PathBuf,
}

impl CacheStore {
    /// Create a store rooted at `data_dir`, creating directories as needed.
    pub async fn new(data_dir: impl Into<PathBuf>) -> Result<Self, FetchError> {
        let data_dir = data_dir.into();
        let cache_dir = data_dir.join("cache");
        fs::create_dir_all(&cache_dir).await?;

        Ok(Self {
            data_dir,
            cache_dir,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Blob name for a given destination file name.
    pub fn blob_name(file_name: &str) -> String {
        format!("{file_name}{RESUME_SUFFIX}")
    }

    /// Partial payload name for a given destination file name.
    pub fn partial_name(file_name: &str) -> String {
        format!("{file_name}{PARTIAL_SUFFIX}")
    }

    pub fn blob_path(&self, cache_file_name: &str) -> PathBuf {
        self.cache_dir.join(cache_file_name)
    }

    fn slot_path(&self) -> PathBuf {
        self.data_dir.join(format!("{CACHE_INFO_KEY}.json"))
    }

    /// Load the resume record, if the slot holds one.
    ///
    /// A missing slot is `Ok(None)`; an unreadable slot is a
    /// [`FetchError::Decoding`] so callers can treat the record as stale
    /// instead of failing the transfer.
    pub async fn load(&self) -> Result<Option<ResumeCacheRecord>, FetchError> {
        let bytes = match fs::read(self.slot_path()).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(FetchError::FileSystem(e)),
        };

        let record = serde_json::from_slice(&bytes)
            .map_err(|e| FetchError::Decoding(e.to_string()))?;
        Ok(Some(record))
    }

    /// Persist the resume record. The write is synced before returning so
    /// a pause survives an immediate process kill.
    pub async fn save(&self, record: &ResumeCacheRecord) -> Result<(), FetchError> {
        let encoded = serde_json::to_vec_pretty(record)
            .map_err(|e| FetchError::Encoding(e.to_string()))?;

        let mut file = fs::File::create(self.slot_path()).await?;
        file.write_all(&encoded).await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Write resume-token bytes to the named blob, synced to disk.
    pub async fn write_blob(&self, cache_file_name: &str, bytes: &[u8]) -> Result<(), FetchError> {
        let mut file = fs::File::create(self.blob_path(cache_file_name)).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;

        Ok(())
    }

    pub async fn read_blob(&self, cache_file_name: &str) -> Result<Vec<u8>, FetchError> {
        Ok(fs::read(self.blob_path(cache_file_name)).await?)
    }

    pub async fn blob_exists(&self, cache_file_name: &str) -> bool {
        fs::try_exists(self.blob_path(cache_file_name))
            .await
            .unwrap_or(false)
    }

    /// Remove the record, its blob, and the partial payload it references.
    pub async fn clear(&self) -> Result<(), FetchError> {
        if let Ok(Some(record)) = self.load().await {
            remove_if_exists(&self.blob_path(&record.cache_file_name)).await?;

            if let Some(stem) = record.cache_file_name.strip_suffix(RESUME_SUFFIX) {
                remove_if_exists(&self.cache_dir.join(Self::partial_name(stem))).await?;
            }
        }

        remove_if_exists(&self.slot_path()).await?;
        Ok(())
    }
}

async fn remove_if_exists(path: &Path) -> Result<(), FetchError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FetchError::FileSystem(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_record() -> ResumeCacheRecord {
        ResumeCacheRecord {
            download_link: "https://host/model.bin".to_string(),
            cache_file_name: "model.bin.resume".to_string(),
            bytes_written: 4096,
            bytes_expected: 65536,
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path()).await.unwrap();

        assert!(store.load().await.unwrap().is_none());

        let record = sample_record();
        store.save(&record).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn corrupt_slot_reports_decoding_error() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path()).await.unwrap();

        std::fs::write(
            dir.path().join(format!("{CACHE_INFO_KEY}.json")),
            b"not json at all",
        )
        .unwrap();

        let err = store.load().await.err().unwrap();
        assert!(err.is_stale_cache());
    }

    #[tokio::test]
    async fn blob_round_trips() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path()).await.unwrap();

        assert!(!store.blob_exists("model.bin.resume").await);
        store.write_blob("model.bin.resume", b"token-bytes").await.unwrap();
        assert!(store.blob_exists("model.bin.resume").await);
        assert_eq!(
            store.read_blob("model.bin.resume").await.unwrap(),
            b"token-bytes"
        );
    }

    #[tokio::test]
    async fn clear_removes_record_blob_and_partial() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path()).await.unwrap();

        store.save(&sample_record()).await.unwrap();
        store.write_blob("model.bin.resume", b"token").await.unwrap();
        std::fs::write(store.cache_dir().join("model.bin.part"), b"partial").unwrap();

        store.clear().await.unwrap();

        assert!(store.load().await.unwrap().is_none());
        assert!(!store.blob_exists("model.bin.resume").await);
        assert!(!store.cache_dir().join("model.bin.part").exists());
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path()).await.unwrap();

        store.clear().await.unwrap();
        store.clear().await.unwrap();
    }
}

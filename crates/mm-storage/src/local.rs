//! Local filesystem store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::store::{validate_key, ObjectStore};

/// Stores objects as files below a root directory.
#[derive(Debug, Clone)]
pub struct LocalFsStore {
    root: PathBuf,
}

impl LocalFsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create from `STORAGE_ROOT` (default `./storage`).
    pub fn from_env() -> Self {
        Self::new(std::env::var("STORAGE_ROOT").unwrap_or_else(|_| "./storage".to_string()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalFsStore {
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::not_found(key)),
            Err(e) => Err(StorageError::DownloadFailed(format!("{}: {}", key, e))),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<String> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write then rename so readers never observe a partial object.
        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| StorageError::upload_failed(format!("{}: {}", key, e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StorageError::upload_failed(format!("{}: {}", key, e)))?;
        debug!(key = %key, bytes = data.len(), "Stored object");
        Ok(key.to_string())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
        let dir = self.path_for(prefix.trim_end_matches('/'))?;
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(0);
        }
        let mut removed = 0;
        let mut stack = vec![dir.clone()];
        while let Some(current) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_dir() {
                    stack.push(entry.path());
                } else {
                    removed += 1;
                }
            }
        }
        tokio::fs::remove_dir_all(&dir).await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsStore::new(dir.path());

        let reference = store
            .put("work/job-1/a.bin", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(reference, "work/job-1/a.bin");
        assert_eq!(store.get(&reference).await.unwrap(), Bytes::from_static(b"hello"));
        assert!(store.exists(&reference).await.unwrap());

        store.put("work/job-1/b.bin", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(store.delete_prefix("work/job-1/").await.unwrap(), 2);
        assert!(!store.exists(&reference).await.unwrap());
        store.delete(&reference).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_and_invalid_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsStore::new(dir.path());

        assert!(matches!(
            store.get("nope.png").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            store.get("../outside").await,
            Err(StorageError::InvalidKey(_))
        ));
    }
}

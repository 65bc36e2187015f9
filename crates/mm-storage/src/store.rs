//! Storage trait.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{StorageError, StorageResult};

/// Opaque object storage. References returned by [`ObjectStore::put`] are
/// resolvable by [`ObjectStore::get`] on the same store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read an object.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Write an object, returning its reference.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<String>;

    /// Check whether an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Delete every object under a prefix. Returns the number removed.
    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize>;
}

/// Reject keys that could escape the storage namespace.
///
/// Valid keys are relative, `/`-separated, and contain no empty,
/// `.` or `..` segments.
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() || key.len() > 512 {
        return Err(StorageError::invalid_key(key));
    }
    if key.starts_with('/') || key.contains('\\') || key.contains('\0') {
        return Err(StorageError::invalid_key(key));
    }
    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(StorageError::invalid_key(key));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_keys() {
        assert!(validate_key("uploads/user-1/page.png").is_ok());
        assert!(validate_key("work/abc/preprocessed.png").is_ok());
    }

    #[test]
    fn test_traversal_rejected() {
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("uploads/../../secret").is_err());
        assert!(validate_key("/abs/path").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("a\\b").is_err());
        assert!(validate_key("").is_err());
    }
}

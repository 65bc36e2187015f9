//! Error types for media operations.

use thiserror::Error;

use mm_storage::StorageError;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur during artifact processing and scanning.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Image decode failed: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Scanner unavailable: {0}")]
    ScannerUnavailable(String),

    #[error("Scan failed: {0}")]
    ScanFailed(String),

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("Worker task failed: {0}")]
    Task(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MediaError {
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedFormat(message.into())
    }

    pub fn scan_failed(message: impl Into<String>) -> Self {
        Self::ScanFailed(message.into())
    }

    /// Whether retrying the same operation could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            MediaError::ScannerUnavailable(_) | MediaError::Timeout(_) | MediaError::Io(_) => true,
            MediaError::Storage(e) => e.is_retryable(),
            _ => false,
        }
    }
}

//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Stage {stage} failed: {message}")]
    StageFailed { stage: String, message: String },

    #[error("Stage {stage} timed out after {secs} seconds")]
    StageTimeout { stage: String, secs: u64 },

    #[error("Invalid transition: {0}")]
    Transition(#[from] mm_models::TransitionError),

    #[error("Storage error: {0}")]
    Storage(#[from] mm_storage::StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] mm_queue::QueueError),

    #[error("Inference error: {0}")]
    Inference(#[from] mm_inference::InferenceError),

    #[error("Media error: {0}")]
    Media(#[from] mm_media::MediaError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn job_failed(msg: impl Into<String>) -> Self {
        Self::JobFailed(msg.into())
    }

    pub fn stage_failed(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::StageFailed {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Storage(e) => e.is_retryable(),
            WorkerError::Queue(e) => e.is_retryable(),
            WorkerError::Inference(e) => e.is_retryable(),
            WorkerError::Io(_) => true,
            _ => false,
        }
    }
}

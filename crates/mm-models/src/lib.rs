//! Shared data models for the MangaMotion job orchestration backend.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs, their lifecycle and status views
//! - Malware scan outcomes and the scan failure policy
//! - Pipeline stage names and their progress ranges
//! - Progress events and the realtime client protocol

pub mod job;
pub mod progress;
pub mod scan;
pub mod stage;
pub mod ws;

// Re-export common types
pub use job::{
    GenerationParams, InputRef, Job, JobError, JobErrorKind, JobId, JobStatus, JobStatusView,
    ScanState, TransitionError, SCAN_COMPLETE_PROGRESS, SCAN_START_PROGRESS,
};
pub use progress::ProgressUpdate;
pub use scan::{ScanOutcome, ScanPolicy};
pub use stage::{PipelineStageResult, StageName};
pub use ws::{ClientMessage, ServerMessage, ServerMessageType};

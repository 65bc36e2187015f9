//! MangaMotion workers.
//!
//! This crate provides:
//! - The five-stage compute pipeline with per-stage progress ranges
//! - The scan worker gating uploads behind a malware scan
//! - The compute worker driving the pipeline and recording outcomes
//! - Persist-then-publish progress reporting
//! - A queue executor with crash recovery and graceful shutdown

pub mod compute_worker;
pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod progress;
pub mod scan_worker;

pub use compute_worker::ComputeWorker;
pub use config::{StageTimeouts, WorkerConfig};
pub use error::{WorkerError, WorkerResult};
pub use executor::{JobExecutor, JobHandler};
pub use logging::JobLogger;
pub use pipeline::{
    Pipeline, PipelineEvent, PipelineOutcome, PipelineRequest, PipelineStage, StageContext,
};
pub use progress::ProgressPublisher;
pub use scan_worker::ScanWorker;

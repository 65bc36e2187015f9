//! Worker configuration.

use std::time::Duration;

use mm_models::{ScanPolicy, StageName};

/// Upper bound for a single stage call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTimeouts {
    pub preprocess: Duration,
    pub inference: Duration,
    pub postprocess: Duration,
    pub assemble: Duration,
    pub thumbnail: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            preprocess: Duration::from_secs(60),
            inference: Duration::from_secs(900),
            postprocess: Duration::from_secs(120),
            assemble: Duration::from_secs(60),
            thumbnail: Duration::from_secs(30),
        }
    }
}

impl StageTimeouts {
    pub fn for_stage(&self, stage: StageName) -> Duration {
        match stage {
            StageName::Preprocess => self.preprocess,
            StageName::Inference => self.inference,
            StageName::Postprocess => self.postprocess,
            StageName::Assemble => self.assemble,
            StageName::Thumbnail => self.thumbnail,
        }
    }

    /// Same timeout for every stage.
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            preprocess: timeout,
            inference: timeout,
            postprocess: timeout,
            assemble: timeout,
            thumbnail: timeout,
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            preprocess: env_secs("STAGE_TIMEOUT_PREPROCESS_SECS").unwrap_or(defaults.preprocess),
            inference: env_secs("STAGE_TIMEOUT_INFERENCE_SECS").unwrap_or(defaults.inference),
            postprocess: env_secs("STAGE_TIMEOUT_POSTPROCESS_SECS").unwrap_or(defaults.postprocess),
            assemble: env_secs("STAGE_TIMEOUT_ASSEMBLE_SECS").unwrap_or(defaults.assemble),
            thumbnail: env_secs("STAGE_TIMEOUT_THUMBNAIL_SECS").unwrap_or(defaults.thumbnail),
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent compute jobs
    pub max_concurrent_jobs: usize,
    /// Maximum concurrent scan jobs
    pub scan_concurrency: usize,
    /// What to do when the scanner is unreachable
    pub scan_policy: ScanPolicy,
    /// Per-stage timeouts
    pub stage_timeouts: StageTimeouts,
    /// Longest edge of normalised working images
    pub max_image_dimension: u32,
    /// How long a consume call blocks waiting for messages
    pub consume_block: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// How often the worker should scan for orphaned pending jobs
    pub claim_interval: Duration,
    /// Minimum idle time before a pending job can be claimed (crash recovery)
    pub claim_min_idle: Duration,
    /// Interval for refreshing job ownership while processing
    pub job_heartbeat_interval: Duration,
    /// Port for the Prometheus scrape endpoint, if any
    pub metrics_port: Option<u16>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            scan_concurrency: 2,
            scan_policy: ScanPolicy::FailOpen,
            stage_timeouts: StageTimeouts::default(),
            max_image_dimension: mm_media::DEFAULT_MAX_DIMENSION,
            consume_block: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            claim_interval: Duration::from_secs(30),
            claim_min_idle: Duration::from_secs(600),
            job_heartbeat_interval: Duration::from_secs(30),
            metrics_port: None,
        }
    }
}

impl WorkerConfig {
    /// Processing lease lifetime: half the stale-claim idle time.
    pub fn lease_ttl(&self) -> Duration {
        self.claim_min_idle / 2
    }

    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent_jobs: std::env::var("WORKER_MAX_JOBS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_concurrent_jobs),
            scan_concurrency: std::env::var("SCAN_WORKER_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.scan_concurrency),
            scan_policy: std::env::var("SCAN_FAILURE_POLICY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.scan_policy),
            stage_timeouts: StageTimeouts::from_env(),
            max_image_dimension: std::env::var("WORKER_MAX_IMAGE_DIMENSION")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_image_dimension),
            consume_block: Duration::from_millis(
                std::env::var("WORKER_CONSUME_BLOCK_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1000),
            ),
            shutdown_timeout: env_secs("WORKER_SHUTDOWN_TIMEOUT").unwrap_or(defaults.shutdown_timeout),
            claim_interval: env_secs("WORKER_CLAIM_INTERVAL_SECS").unwrap_or(defaults.claim_interval),
            claim_min_idle: env_secs("QUEUE_VISIBILITY_TIMEOUT").unwrap_or(defaults.claim_min_idle),
            job_heartbeat_interval: env_secs("WORKER_JOB_HEARTBEAT_SECS")
                .unwrap_or(defaults.job_heartbeat_interval),
            metrics_port: std::env::var("WORKER_METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
        }
    }
}

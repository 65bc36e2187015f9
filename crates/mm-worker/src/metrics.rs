//! Worker metrics.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_STARTED_TOTAL: &str = "mm_worker_jobs_started_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "mm_worker_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "mm_worker_jobs_failed_total";
    pub const JOBS_DEAD_LETTERED_TOTAL: &str = "mm_worker_jobs_dead_lettered_total";
    pub const JOBS_IN_FLIGHT: &str = "mm_worker_jobs_in_flight";
    pub const STAGE_DURATION_SECONDS: &str = "mm_worker_stage_duration_seconds";
    pub const SCAN_OUTCOMES_TOTAL: &str = "mm_worker_scan_outcomes_total";
    pub const PUBLISH_FAILURES_TOTAL: &str = "mm_worker_publish_failures_total";
}

/// Serve Prometheus metrics on `0.0.0.0:{port}`.
pub fn install_exporter(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => info!("Metrics exporter listening on {}", addr),
        Err(e) => warn!("Failed to install metrics exporter: {}", e),
    }
}

pub fn record_job_started(queue: &str) {
    counter!(names::JOBS_STARTED_TOTAL, "queue" => queue.to_string()).increment(1);
}

pub fn record_job_completed(queue: &str) {
    counter!(names::JOBS_COMPLETED_TOTAL, "queue" => queue.to_string()).increment(1);
}

pub fn record_job_failed(queue: &str, kind: &str) {
    let labels = [("queue", queue.to_string()), ("kind", kind.to_string())];
    counter!(names::JOBS_FAILED_TOTAL, &labels).increment(1);
}

pub fn record_dead_lettered(queue: &str) {
    counter!(names::JOBS_DEAD_LETTERED_TOTAL, "queue" => queue.to_string()).increment(1);
}

pub fn set_jobs_in_flight(queue: &str, count: usize) {
    gauge!(names::JOBS_IN_FLIGHT, "queue" => queue.to_string()).set(count as f64);
}

pub fn record_stage_duration(stage: &str, success: bool, duration_secs: f64) {
    let labels = [("stage", stage.to_string()), ("success", success.to_string())];
    histogram!(names::STAGE_DURATION_SECONDS, &labels).record(duration_secs);
}

pub fn record_scan_outcome(outcome: &str) {
    counter!(names::SCAN_OUTCOMES_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

pub fn record_publish_failure() {
    counter!(names::PUBLISH_FAILURES_TOTAL).increment(1);
}

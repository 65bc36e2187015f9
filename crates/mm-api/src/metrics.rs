//! Prometheus metrics for the API server.

use std::sync::LazyLock;
use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use regex_lite::Regex;

use mm_queue::QueueStats;

/// Install the Prometheus recorder.
/// Returns a handle that can be used to render metrics.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Metric names as constants for consistency.
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "mm_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "mm_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "mm_http_requests_in_flight";

    // WebSocket metrics
    pub const WS_CONNECTIONS_TOTAL: &str = "mm_ws_connections_total";
    pub const WS_CONNECTIONS_ACTIVE: &str = "mm_ws_connections_active";
    pub const WS_MESSAGES_SENT: &str = "mm_ws_messages_sent_total";
    pub const WS_MESSAGES_RECEIVED: &str = "mm_ws_messages_received_total";
    pub const WS_AUTH_FAILURES_TOTAL: &str = "mm_ws_auth_failures_total";

    // Queue metrics
    pub const QUEUE_LENGTH: &str = "mm_queue_length";
    pub const QUEUE_DLQ_LENGTH: &str = "mm_queue_dlq_length";
    pub const JOBS_ADMITTED_TOTAL: &str = "mm_jobs_admitted_total";

    // Rate limiting metrics
    pub const RATE_LIMIT_HITS_TOTAL: &str = "mm_rate_limit_hits_total";
}

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", sanitize_path(path)),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record WebSocket connection.
pub fn record_ws_connection() {
    counter!(names::WS_CONNECTIONS_TOTAL).increment(1);
}

/// Record a rejected WebSocket handshake.
pub fn record_ws_auth_failure() {
    counter!(names::WS_AUTH_FAILURES_TOTAL).increment(1);
}

/// Update active WebSocket connections gauge.
pub fn set_ws_active_connections(count: usize) {
    gauge!(names::WS_CONNECTIONS_ACTIVE).set(count as f64);
}

/// Record WebSocket messages sent.
pub fn record_ws_message_sent(message_type: &str, count: usize) {
    let labels = [("type", message_type.to_string())];
    counter!(names::WS_MESSAGES_SENT, &labels).increment(count as u64);
}

/// Record WebSocket message received.
pub fn record_ws_message_received() {
    counter!(names::WS_MESSAGES_RECEIVED).increment(1);
}

/// Update queue depth gauges.
pub fn set_queue_stats(stats: &[QueueStats]) {
    for s in stats {
        let labels = [("queue", s.queue.as_str().to_string())];
        gauge!(names::QUEUE_LENGTH, &labels).set((s.ready + s.delayed) as f64);
        gauge!(names::QUEUE_DLQ_LENGTH, &labels).set(s.dead_lettered as f64);
    }
}

/// Record an admitted job.
pub fn record_job_admitted(input: &str) {
    let labels = [("input", input.to_string())];
    counter!(names::JOBS_ADMITTED_TOTAL, &labels).increment(1);
}

/// Record rate limit hit.
pub fn record_rate_limit_hit(endpoint: &str) {
    let labels = [("endpoint", endpoint.to_string())];
    counter!(names::RATE_LIMIT_HITS_TOTAL, &labels).increment(1);
}

static UUID_SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}").unwrap()
});

static IDENTITY_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/rate-limit/[^/]+").unwrap());

/// Sanitize path for metrics labels (remove IDs, etc.).
fn sanitize_path(path: &str) -> String {
    let path = UUID_SEGMENT.replace_all(path, ":id");
    let path = IDENTITY_SEGMENT.replace_all(&path, "/rate-limit/:identity");
    path.to_string()
}

/// Metrics middleware for HTTP requests.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);

    let response = next.run(request).await;

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    let status = response.status().as_u16();
    let duration = start.elapsed().as_secs_f64();

    record_http_request(&method, &path, status, duration);

    response
}

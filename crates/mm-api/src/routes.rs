//! API routes.

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::limit::RequestBodyLimitLayer;

use crate::handlers::admin::{get_queues, get_rate_limit, purge_dead_letter, reset_rate_limit};
use crate::handlers::jobs::{create_job, get_job_status, list_my_jobs};
use crate::handlers::{health, ready};
use crate::metrics::metrics_middleware;
use crate::middleware::{cors_layer, request_id, request_logging, security_headers};
use crate::state::AppState;
use crate::ws::{ws_handler, ws_stats};

/// Create the API router.
pub fn create_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let job_routes = Router::new()
        .route("/jobs", post(create_job))
        .route("/jobs/:job_id/status", get(get_job_status))
        .route("/me/jobs", get(list_my_jobs));

    // Operator routes (role = admin)
    let admin_routes = Router::new()
        .route(
            "/admin/rate-limit/:identity",
            get(get_rate_limit).delete(reset_rate_limit),
        )
        .route("/admin/queues", get(get_queues))
        .route(
            "/admin/dead-letter/:queue/:job_id",
            axum::routing::delete(purge_dead_letter),
        );

    let api_routes = Router::new()
        .merge(job_routes)
        .merge(admin_routes)
        .route("/ws/stats", get(ws_stats));

    let ws_routes = Router::new().route("/ws", get(ws_handler));

    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready));

    let metrics_routes = if let Some(handle) = metrics_handle {
        Router::new().route("/metrics", get(move || async move { handle.render() }))
    } else {
        Router::new()
    };

    Router::new()
        .nest("/api", api_routes)
        .merge(ws_routes)
        .merge(health_routes)
        .merge(metrics_routes)
        .layer(RequestBodyLimitLayer::new(state.config.max_body_size))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(security_headers))
        .layer(middleware::from_fn(request_id))
        .layer(middleware::from_fn(request_logging))
        .layer(cors_layer(&state.config.cors_origins))
        .with_state(state)
}

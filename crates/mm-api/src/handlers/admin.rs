//! Operator handlers: rate-limit overrides, queue depth and dead-letter purge.

use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use mm_models::JobId;
use mm_queue::{QueueKind, QueueStats};

use crate::auth::AdminUser;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::security::{is_valid_identity, is_valid_job_id};
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatusResponse {
    pub identity: String,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub window_secs: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResetResponse {
    pub identity: String,
    pub reset: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuesResponse {
    pub queues: Vec<QueueStats>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterPurgeResponse {
    pub queue: QueueKind,
    pub job_id: JobId,
    pub removed: usize,
}

fn checked_identity(identity: String) -> ApiResult<String> {
    if is_valid_identity(&identity) {
        Ok(identity)
    } else {
        Err(ApiError::bad_request("Invalid identity"))
    }
}

/// `GET /api/admin/rate-limit/:identity`: bucket state without consuming.
pub async fn get_rate_limit(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(identity): Path<String>,
) -> ApiResult<Json<RateLimitStatusResponse>> {
    let identity = checked_identity(identity)?;
    let status = state.rate_limiter.status(&identity).await?;
    Ok(Json(RateLimitStatusResponse {
        identity,
        limit: status.limit,
        remaining: status.remaining,
        reset_at: status.reset_at,
        window_secs: state.rate_limiter.config().window.as_secs(),
    }))
}

/// `DELETE /api/admin/rate-limit/:identity`: restore full capacity.
pub async fn reset_rate_limit(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(identity): Path<String>,
) -> ApiResult<Json<RateLimitResetResponse>> {
    let identity = checked_identity(identity)?;
    state.rate_limiter.reset(&identity).await?;
    info!(admin = %admin.user_id, identity = %identity, "Rate limit reset by operator");
    Ok(Json(RateLimitResetResponse { identity, reset: true }))
}

/// `GET /api/admin/queues`: depth of every queue, highest priority first.
pub async fn get_queues(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
) -> ApiResult<Json<QueuesResponse>> {
    let queues = state.manager.queue_stats().await?;
    metrics::set_queue_stats(&queues);
    Ok(Json(QueuesResponse { queues }))
}

/// `DELETE /api/admin/dead-letter/:queue/:job_id`: drop a dead-lettered job
/// so it is never redelivered.
pub async fn purge_dead_letter(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path((queue, job_id)): Path<(String, String)>,
) -> ApiResult<Json<DeadLetterPurgeResponse>> {
    let queue = QueueKind::parse(&queue)
        .ok_or_else(|| ApiError::bad_request(format!("Unknown queue: {}", queue)))?;
    if !is_valid_job_id(&job_id) {
        return Err(ApiError::bad_request("Invalid job id"));
    }
    let job_id = JobId::from_string(job_id);

    let removed = state.manager.purge_dead_letter(queue, &job_id).await?;
    if removed == 0 {
        return Err(ApiError::not_found(format!(
            "Job {} is not in the {} dead-letter queue",
            job_id, queue
        )));
    }
    info!(admin = %admin.user_id, job_id = %job_id, queue = %queue, removed, "Dead-letter entry purged");
    Ok(Json(DeadLetterPurgeResponse {
        queue,
        job_id,
        removed,
    }))
}

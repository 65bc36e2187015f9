//! Job admission and status handlers.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use mm_models::{GenerationParams, InputRef, Job, JobId, JobStatus, JobStatusView};

use crate::auth::{AuthUser, MaybeAuthUser};
use crate::error::{rate_limit_headers, ApiError, ApiResult};
use crate::metrics;
use crate::security::{clean_prompt, is_valid_job_id, validate_object_key, validate_style};
use crate::state::AppState;

/// Identity charged for anonymous requests with no known address.
const ANONYMOUS_IDENTITY: &str = "anonymous";

const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 100;

/// Job creation request. Either `fileRef` (a previously uploaded object,
/// optionally with a guiding prompt) or `prompt` alone.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    #[validate(length(min = 1, max = 512))]
    pub file_ref: Option<String>,
    #[serde(default)]
    #[validate(length(min = 1, max = 64))]
    pub style: Option<String>,
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: u8,
}

/// Rate-limit key: the authenticated user, else the first forwarded
/// address, else the peer address of the connection.
fn rate_limit_identity(user: &MaybeAuthUser, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(user) = &user.0 {
        return user.user_id.clone();
    }
    headers
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|ip| format!("ip:{}", ip))
        .or_else(|| peer.map(|addr| format!("ip:{}", addr.ip())))
        .unwrap_or_else(|| ANONYMOUS_IDENTITY.to_string())
}

async fn build_job(state: &AppState, request: CreateJobRequest, owner: Option<String>) -> ApiResult<Job> {
    request
        .validate()
        .map_err(|e| ApiError::validation(e.to_string()))?;
    if let Some(style) = &request.style {
        validate_style(style)?;
    }

    let prompt = request.prompt.as_deref().map(clean_prompt).transpose()?;
    let mut params = GenerationParams {
        style: request.style,
        seed: request.seed,
        prompt: None,
    };

    let input = match (request.file_ref, prompt) {
        (Some(key), prompt) => {
            validate_object_key(&key)?;
            if !state.objects.exists(&key).await? {
                return Err(ApiError::validation(format!("file not found: {}", key)));
            }
            params.prompt = prompt;
            InputRef::object(key)
        }
        (None, Some(prompt)) => InputRef::prompt(prompt),
        (None, None) => {
            return Err(ApiError::validation("either fileRef or prompt is required"));
        }
    };

    Ok(Job::new(input, owner, params))
}

/// `POST /api/jobs`: rate limit, validate, persist, enqueue.
pub async fn create_job(
    State(state): State<AppState>,
    user: MaybeAuthUser,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    Json(request): Json<CreateJobRequest>,
) -> ApiResult<impl IntoResponse> {
    let identity = rate_limit_identity(&user, &headers, peer.map(|ConnectInfo(addr)| addr));
    let admission = state.rate_limiter.admit(&identity).await;
    if !admission.allowed {
        metrics::record_rate_limit_hit("create_job");
        info!(identity = %identity, "Job admission rate limited");
        return Err(ApiError::rate_limited(admission));
    }

    let owner = user.0.map(|u| u.user_id);
    let job = build_job(&state, request, owner).await?;
    let input_kind = match job.input {
        InputRef::Object { .. } => "object",
        InputRef::Prompt { .. } => "prompt",
    };

    let job = state.manager.submit(job).await?;
    metrics::record_job_admitted(input_kind);
    info!(
        job_id = %job.id,
        identity = %identity,
        input = input_kind,
        degraded = admission.degraded,
        "Job admitted"
    );

    Ok((
        StatusCode::ACCEPTED,
        rate_limit_headers(&admission),
        Json(CreateJobResponse {
            job_id: job.id,
            status: job.status,
            progress: job.progress,
        }),
    ))
}

/// `GET /api/jobs/:job_id/status`: last durably saved state.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobStatusView>> {
    if !is_valid_job_id(&job_id) {
        return Err(ApiError::bad_request("Invalid job id"));
    }
    let job_id = JobId::from_string(job_id);
    state
        .manager
        .get_status(&job_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Job {} not found", job_id)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub status: Option<String>,
}

/// One entry of the caller's job history.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    #[serde(flatten)]
    pub status: JobStatusView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            status: job.status_view(),
            prompt: job
                .input
                .prompt_text()
                .or(job.params.prompt.as_deref())
                .map(str::to_string),
            created_at: job.created_at,
        }
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: usize,
    pub pages: usize,
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobSummary>,
    pub pagination: Pagination,
}

fn parse_status(value: &str) -> ApiResult<JobStatus> {
    [
        JobStatus::Queued,
        JobStatus::Scanning,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ]
    .into_iter()
    .find(|status| status.as_str() == value)
    .ok_or_else(|| ApiError::bad_request(format!("Invalid status filter: {}", value)))
}

/// Filter and slice an owner's jobs, which arrive newest first.
fn paginate(jobs: &[Job], status: Option<JobStatus>, page: u32, limit: u32) -> JobListResponse {
    let matching: Vec<&Job> = jobs
        .iter()
        .filter(|job| status.map_or(true, |s| job.status == s))
        .collect();
    let total = matching.len();
    let offset = (page as usize - 1).saturating_mul(limit as usize);
    JobListResponse {
        jobs: matching
            .into_iter()
            .skip(offset)
            .take(limit as usize)
            .map(JobSummary::from)
            .collect(),
        pagination: Pagination {
            page,
            limit,
            total,
            pages: total.div_ceil(limit as usize),
        },
    }
}

/// `GET /api/me/jobs`: the caller's jobs, newest first.
pub async fn list_my_jobs(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<JobListResponse>> {
    let status = query.status.as_deref().map(parse_status).transpose()?;
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

    let jobs = state.manager.jobs_for_owner(&user.user_id).await?;
    Ok(Json(paginate(&jobs, status, page, limit)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthUser;

    #[test]
    fn test_identity_prefers_authenticated_user() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", "203.0.113.7, 10.0.0.1".parse().unwrap());

        let user = MaybeAuthUser(Some(AuthUser {
            user_id: "u-1".into(),
            role: None,
        }));
        let peer: SocketAddr = "198.51.100.4:53211".parse().unwrap();
        assert_eq!(rate_limit_identity(&user, &headers, Some(peer)), "u-1");
        assert_eq!(
            rate_limit_identity(&MaybeAuthUser(None), &headers, Some(peer)),
            "ip:203.0.113.7"
        );
        assert_eq!(
            rate_limit_identity(&MaybeAuthUser(None), &HeaderMap::new(), Some(peer)),
            "ip:198.51.100.4"
        );
        assert_eq!(
            rate_limit_identity(&MaybeAuthUser(None), &HeaderMap::new(), None),
            ANONYMOUS_IDENTITY
        );
    }

    fn history() -> Vec<Job> {
        (0..5)
            .map(|i| {
                let mut job = Job::new(
                    InputRef::prompt(format!("panel {}", i)),
                    Some("u-1".into()),
                    GenerationParams::default(),
                );
                if i % 2 == 0 {
                    job.fail(mm_models::JobError::stage("inference", "boom")).unwrap();
                }
                job
            })
            .collect()
    }

    #[test]
    fn test_paginate_slices_and_counts() {
        let jobs = history();
        let first = paginate(&jobs, None, 1, 2);
        assert_eq!(first.jobs.len(), 2);
        assert_eq!(first.jobs[0].status.job_id, jobs[0].id);
        assert_eq!(
            first.pagination,
            Pagination {
                page: 1,
                limit: 2,
                total: 5,
                pages: 3
            }
        );

        let last = paginate(&jobs, None, 3, 2);
        assert_eq!(last.jobs.len(), 1);
        assert_eq!(last.jobs[0].prompt.as_deref(), Some("panel 4"));
        assert!(paginate(&jobs, None, 9, 2).jobs.is_empty());
    }

    #[test]
    fn test_paginate_filters_by_status() {
        let jobs = history();
        let failed = paginate(&jobs, Some(JobStatus::Failed), 1, 20);
        assert_eq!(failed.pagination.total, 3);
        assert!(failed.jobs.iter().all(|j| j.status.status == JobStatus::Failed));
        assert_eq!(paginate(&jobs, Some(JobStatus::Completed), 1, 20).pagination.pages, 0);
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("processing").unwrap(), JobStatus::Processing);
        assert!(parse_status("Processing").is_err());
        assert!(parse_status("done").is_err());
    }
}

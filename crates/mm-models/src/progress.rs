//! Progress event exchanged between workers and the realtime gateway.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Job, JobId, JobStatus};

/// A progress-affecting change to a job, published on `job:{jobId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub job_id: JobId,
    /// Routing key for fan-out. Anonymous jobs are never delivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressUpdate {
    /// Build an update reflecting the job's current persisted state.
    pub fn from_job(job: &Job, stage: Option<&str>, message: Option<String>) -> Self {
        let message = message.or_else(|| job.error.as_ref().map(|e| e.message.clone()));
        Self {
            job_id: job.id.clone(),
            owner_id: job.owner_id.clone(),
            status: job.status,
            progress: job.progress,
            stage: stage.map(str::to_string),
            message,
            timestamp: Utc::now(),
        }
    }
}

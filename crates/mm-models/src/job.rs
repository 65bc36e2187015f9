//! Job record and lifecycle transitions.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Progress reported once the scan worker picks a job up.
pub const SCAN_START_PROGRESS: u8 = 5;

/// Progress reported once scanning has finished and compute is unblocked.
pub const SCAN_COMPLETE_PROGRESS: u8 = 20;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Job status.
///
/// Statuses only move forward in declaration order. `Failed` can be
/// entered from any non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Scanning,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Scanning => "scanning",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Scanning => 1,
            JobStatus::Processing => 2,
            JobStatus::Completed => 3,
            JobStatus::Failed => 4,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the job operates on. An object reference and a prompt are
/// mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputRef {
    /// A previously uploaded storage object.
    Object { key: String },
    /// A text prompt, generation from scratch.
    Prompt { text: String },
}

impl InputRef {
    pub fn object(key: impl Into<String>) -> Self {
        InputRef::Object { key: key.into() }
    }

    pub fn prompt(text: impl Into<String>) -> Self {
        InputRef::Prompt { text: text.into() }
    }

    /// Storage key, if the input is an uploaded object.
    pub fn object_key(&self) -> Option<&str> {
        match self {
            InputRef::Object { key } => Some(key),
            InputRef::Prompt { .. } => None,
        }
    }

    /// Prompt text, if the input is a prompt.
    pub fn prompt_text(&self) -> Option<&str> {
        match self {
            InputRef::Prompt { text } => Some(text),
            InputRef::Object { .. } => None,
        }
    }
}

/// Generation parameters handed to the inference adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GenerationParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Prompt accompanying an uploaded object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// Malware scan state of the job's input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    #[default]
    Pending,
    Clean,
    /// Scanner was unreachable and the job proceeded unscanned.
    Skipped,
    Infected,
    /// Nothing to scan (prompt-only jobs).
    NotRequired,
}

/// Classification of a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    Validation,
    Infected,
    ScanUnavailable,
    Stage,
    DeadLettered,
}

/// Structured failure reason recorded on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobError {
    pub kind: JobErrorKind,
    /// Stage that produced the error (`scan`, `inference`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub message: String,
}

impl JobError {
    pub fn new(kind: JobErrorKind, stage: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage: stage.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn stage(stage: &str, message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Stage, Some(stage), message)
    }

    pub fn infected(flagged: &[String]) -> Self {
        Self::new(
            JobErrorKind::Infected,
            Some("scan"),
            format!("Malware detected in: {}", flagged.join(", ")),
        )
    }

    pub fn scan_unavailable(reason: impl Into<String>) -> Self {
        Self::new(JobErrorKind::ScanUnavailable, Some("scan"), reason)
    }

    pub fn dead_lettered(attempts: u32, reason: impl Into<String>) -> Self {
        Self::new(
            JobErrorKind::DeadLettered,
            None,
            format!("Job failed after {} attempts: {}", attempts, reason.into()),
        )
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.stage {
            Some(stage) => write!(f, "[{}] {}", stage, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Rejected lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("job is already {0}")]
    Terminal(JobStatus),

    #[error("cannot move job from {from} to {to}")]
    Backwards { from: JobStatus, to: JobStatus },
}

/// The unit of work tracked across admission, scan and compute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub input: InputRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub params: GenerationParams,
    #[serde(default)]
    pub scan: ScanState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// Deliveries consumed so far.
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a queued job.
    pub fn new(input: InputRef, owner_id: Option<String>, params: GenerationParams) -> Self {
        let now = Utc::now();
        let scan = match input {
            InputRef::Prompt { .. } => ScanState::NotRequired,
            InputRef::Object { .. } => ScanState::Pending,
        };
        Self {
            id: JobId::new(),
            status: JobStatus::Queued,
            progress: 0,
            input,
            owner_id,
            params,
            scan,
            result_ref: None,
            thumbnail_ref: None,
            error: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the job input has to pass a malware scan before compute.
    pub fn requires_scan(&self) -> bool {
        matches!(self.input, InputRef::Object { .. })
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn transition(&mut self, to: JobStatus) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal(self.status));
        }
        if to.rank() < self.status.rank() {
            return Err(TransitionError::Backwards {
                from: self.status,
                to,
            });
        }
        if self.status != to {
            self.status = to;
            self.touch();
        }
        Ok(())
    }

    /// Queued -> Scanning.
    pub fn start_scan(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Scanning)?;
        self.advance_progress(SCAN_START_PROGRESS);
        Ok(())
    }

    /// Record the scan verdict for a job that will proceed to compute.
    pub fn record_scan(&mut self, state: ScanState) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal(self.status));
        }
        if self.scan != state {
            self.scan = state;
            self.touch();
        }
        self.advance_progress(SCAN_COMPLETE_PROGRESS);
        Ok(())
    }

    /// Queued/Scanning -> Processing. Re-entering Processing on redelivery is allowed.
    pub fn start_processing(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Processing)
    }

    /// Record that another delivery of this job is being handled.
    pub fn record_attempt(&mut self, attempt: u32) {
        if attempt > self.attempts {
            self.attempts = attempt;
            self.touch();
        }
    }

    /// Raise progress. Returns whether anything changed.
    ///
    /// Lower or equal values and writes to terminal jobs are ignored.
    pub fn advance_progress(&mut self, progress: u8) -> bool {
        let progress = progress.min(100);
        if self.status.is_terminal() || progress <= self.progress {
            return false;
        }
        self.progress = progress;
        self.touch();
        true
    }

    /// Processing -> Completed.
    pub fn complete(
        &mut self,
        result_ref: impl Into<String>,
        thumbnail_ref: Option<String>,
    ) -> Result<(), TransitionError> {
        self.transition(JobStatus::Completed)?;
        self.progress = 100;
        self.result_ref = Some(result_ref.into());
        self.thumbnail_ref = thumbnail_ref;
        Ok(())
    }

    /// Any non-terminal status -> Failed. Progress is frozen where it is.
    pub fn fail(&mut self, error: JobError) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal(self.status));
        }
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.touch();
        Ok(())
    }

    /// Snapshot returned by the status query.
    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            job_id: self.id.clone(),
            status: self.status,
            progress: self.progress,
            scan: self.scan,
            error: self.error.clone(),
            result_ref: self.result_ref.clone(),
            thumbnail_ref: self.thumbnail_ref.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Response of `getStatus(jobId)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub scan: ScanState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_ref: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload_job() -> Job {
        Job::new(
            InputRef::object("uploads/page-1.png"),
            Some("user-1".to_string()),
            GenerationParams::default(),
        )
    }

    #[test]
    fn test_new_job_is_queued() {
        let job = upload_job();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress, 0);
        assert_eq!(job.scan, ScanState::Pending);
        assert!(job.requires_scan());

        let prompt = Job::new(InputRef::prompt("a cat"), None, GenerationParams::default());
        assert_eq!(prompt.scan, ScanState::NotRequired);
        assert!(!prompt.requires_scan());
    }

    #[test]
    fn test_progress_never_decreases() {
        let mut job = upload_job();
        job.start_processing().unwrap();
        assert!(job.advance_progress(40));
        assert!(!job.advance_progress(30));
        assert!(!job.advance_progress(40));
        assert_eq!(job.progress, 40);
        assert!(job.advance_progress(250));
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn test_noop_progress_keeps_updated_at() {
        let mut job = upload_job();
        job.advance_progress(10);
        let stamp = job.updated_at;
        job.advance_progress(5);
        assert_eq!(job.updated_at, stamp);
    }

    #[test]
    fn test_full_lifecycle() {
        let mut job = upload_job();
        job.start_scan().unwrap();
        assert_eq!(job.progress, SCAN_START_PROGRESS);
        job.record_scan(ScanState::Clean).unwrap();
        assert_eq!(job.progress, SCAN_COMPLETE_PROGRESS);
        job.start_processing().unwrap();
        job.start_processing().unwrap();
        job.complete("outputs/x/final.png", None).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.result_ref.as_deref(), Some("outputs/x/final.png"));
    }

    #[test]
    fn test_backwards_transition_rejected() {
        let mut job = upload_job();
        job.start_processing().unwrap();
        assert_eq!(
            job.start_scan(),
            Err(TransitionError::Backwards {
                from: JobStatus::Processing,
                to: JobStatus::Scanning
            })
        );
    }

    #[test]
    fn test_fail_freezes_progress_and_is_terminal() {
        let mut job = upload_job();
        job.start_processing().unwrap();
        job.advance_progress(42);
        job.fail(JobError::stage("inference", "model crashed")).unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert!(!job.advance_progress(90));
        assert_eq!(job.progress, 42);
        assert!(job.complete("x", None).is_err());
        assert_eq!(
            job.fail(JobError::stage("assemble", "again")),
            Err(TransitionError::Terminal(JobStatus::Failed))
        );
        assert_eq!(job.error.as_ref().and_then(|e| e.stage.as_deref()), Some("inference"));
    }

    #[test]
    fn test_input_ref_serialization() {
        let json = serde_json::to_value(InputRef::object("a/b.png")).unwrap();
        assert_eq!(json["kind"], "object");
        assert_eq!(json["key"], "a/b.png");

        let json = serde_json::to_value(InputRef::prompt("hi")).unwrap();
        assert_eq!(json["kind"], "prompt");
    }

    #[test]
    fn test_status_view_shape() {
        let mut job = upload_job();
        job.start_processing().unwrap();
        job.fail(JobError::infected(&["a.png".to_string()])).unwrap();
        let json = serde_json::to_value(job.status_view()).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"]["kind"], "infected");
        assert!(json.get("resultRef").is_none());
        assert!(json.get("jobId").is_some());
    }
}

//! Job payloads carried by the queues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use mm_models::{Job, JobId};

/// The two logical queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Scan,
    Compute,
}

impl QueueKind {
    /// All queues, highest priority first.
    pub const BY_PRIORITY: [QueueKind; 2] = [QueueKind::Scan, QueueKind::Compute];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Scan => "scan",
            QueueKind::Compute => "compute",
        }
    }

    /// Higher is consumed first.
    pub fn priority(&self) -> u8 {
        match self {
            QueueKind::Scan => 10,
            QueueKind::Compute => 1,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "scan" => Some(QueueKind::Scan),
            "compute" => Some(QueueKind::Compute),
            _ => None,
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Malware scan request for a parent job's input files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanJob {
    pub parent_job_id: JobId,
    pub file_refs: Vec<String>,
}

/// Compute request carrying the full job payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeJob {
    pub job: Job,
}

/// Generic job wrapper for queue storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueJob {
    Scan(ScanJob),
    Compute(ComputeJob),
}

impl QueueJob {
    pub fn scan(parent_job_id: JobId, file_refs: Vec<String>) -> Self {
        QueueJob::Scan(ScanJob {
            parent_job_id,
            file_refs,
        })
    }

    pub fn compute(job: Job) -> Self {
        QueueJob::Compute(ComputeJob { job })
    }

    /// The job record this message acts on.
    pub fn job_id(&self) -> &JobId {
        match self {
            QueueJob::Scan(j) => &j.parent_job_id,
            QueueJob::Compute(j) => &j.job.id,
        }
    }

    pub fn kind(&self) -> QueueKind {
        match self {
            QueueJob::Scan(_) => QueueKind::Scan,
            QueueJob::Compute(_) => QueueKind::Compute,
        }
    }
}

/// What is actually written to a stream entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique per enqueue, including retries.
    pub id: String,
    /// 1-based delivery attempt this envelope represents.
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    pub job: QueueJob,
}

impl Envelope {
    pub fn new(job: QueueJob) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            attempt: 1,
            enqueued_at: Utc::now(),
            job,
        }
    }

    /// Envelope for the next attempt of the same job.
    pub fn next_attempt(&self) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            attempt: self.attempt + 1,
            enqueued_at: Utc::now(),
            job: self.job.clone(),
        }
    }
}

/// A message handed to a consumer. It must be acked or failed.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Broker message id.
    pub id: String,
    pub kind: QueueKind,
    pub envelope: Envelope,
}

impl Delivery {
    pub fn job(&self) -> &QueueJob {
        &self.envelope.job
    }

    pub fn job_id(&self) -> &JobId {
        self.envelope.job.job_id()
    }

    pub fn attempt(&self) -> u32 {
        self.envelope.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mm_models::{GenerationParams, InputRef};

    #[test]
    fn test_scan_outranks_compute() {
        assert!(QueueKind::Scan.priority() > QueueKind::Compute.priority());
        assert_eq!(QueueKind::BY_PRIORITY[0], QueueKind::Scan);
    }

    #[test]
    fn test_queue_job_wire_shape() {
        let job = QueueJob::scan(JobId::from("p-1"), vec!["uploads/a.png".into()]);
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["type"], "scan");
        assert_eq!(json["parent_job_id"], "p-1");
        assert_eq!(job.job_id().as_str(), "p-1");

        let compute = QueueJob::compute(Job::new(
            InputRef::prompt("x"),
            None,
            GenerationParams::default(),
        ));
        let json = serde_json::to_value(&compute).unwrap();
        assert_eq!(json["type"], "compute");
        assert_eq!(compute.kind(), QueueKind::Compute);
    }

    #[test]
    fn test_next_attempt() {
        let env = Envelope::new(QueueJob::scan(JobId::from("p"), vec![]));
        let next = env.next_attempt();
        assert_eq!(env.attempt, 1);
        assert_eq!(next.attempt, 2);
        assert_ne!(env.id, next.id);
        assert_eq!(env.job, next.job);
    }
}

//! Queue manager: the single entry point for submitting jobs and querying them.

use std::sync::Arc;

use tracing::info;

use mm_models::{Job, JobId, JobStatusView};

use crate::broker::{JobBroker, QueueStats};
use crate::error::QueueResult;
use crate::job::{QueueJob, QueueKind};
use crate::store::JobStore;

/// Set once the compute delivery for a job exists.
const COMPUTE_ENQUEUED_MARKER: &str = "compute_enqueued";

/// Owns the scan and compute queues together with the job record store.
///
/// Every enqueue persists the job record first so status queries never race
/// the queue.
#[derive(Clone)]
pub struct QueueManager {
    broker: Arc<dyn JobBroker>,
    store: Arc<dyn JobStore>,
}

impl QueueManager {
    pub fn new(broker: Arc<dyn JobBroker>, store: Arc<dyn JobStore>) -> Self {
        Self { broker, store }
    }

    pub fn broker(&self) -> &Arc<dyn JobBroker> {
        &self.broker
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Persist and route a new job: through the scan queue when its input
    /// needs scanning, directly to compute otherwise.
    pub async fn submit(&self, job: Job) -> QueueResult<Job> {
        self.store.save(&job).await?;
        match job.input.object_key() {
            Some(key) if job.requires_scan() => {
                self.enqueue_scan(job.id.clone(), vec![key.to_string()]).await?;
            }
            _ => {
                self.enqueue_compute(&job).await?;
            }
        }
        Ok(job)
    }

    /// Enqueue a compute job (low priority). Returns the broker message id.
    pub async fn enqueue_compute(&self, job: &Job) -> QueueResult<String> {
        self.store.save(job).await?;
        let message_id = self.broker.enqueue(QueueJob::compute(job.clone())).await?;
        info!(
            job_id = %job.id,
            queue = %QueueKind::Compute,
            message_id = %message_id,
            "Enqueued compute job"
        );
        Ok(message_id)
    }

    /// Enqueue compute unless an earlier delivery already did.
    ///
    /// The marker is written after the enqueue, so a crash in between leads
    /// to a second enqueue on redelivery rather than a job that never runs.
    /// Returns `None` when compute was already enqueued.
    pub async fn enqueue_compute_once(&self, job: &Job) -> QueueResult<Option<String>> {
        if self.store.is_marked(&job.id, COMPUTE_ENQUEUED_MARKER).await? {
            self.store.save(job).await?;
            info!(job_id = %job.id, "Compute already enqueued, skipping");
            return Ok(None);
        }
        let message_id = self.enqueue_compute(job).await?;
        self.store.mark(&job.id, COMPUTE_ENQUEUED_MARKER).await?;
        Ok(Some(message_id))
    }

    /// Enqueue a malware scan (high priority) for a parent job's files.
    pub async fn enqueue_scan(&self, parent_job_id: JobId, file_refs: Vec<String>) -> QueueResult<String> {
        let files = file_refs.len();
        let message_id = self
            .broker
            .enqueue(QueueJob::scan(parent_job_id.clone(), file_refs))
            .await?;
        info!(
            job_id = %parent_job_id,
            queue = %QueueKind::Scan,
            message_id = %message_id,
            files,
            "Enqueued scan job"
        );
        Ok(message_id)
    }

    /// Public status of a job, if it exists.
    pub async fn get_status(&self, job_id: &JobId) -> QueueResult<Option<JobStatusView>> {
        Ok(self.store.load(job_id).await?.map(|job| job.status_view()))
    }

    pub async fn get_job(&self, job_id: &JobId) -> QueueResult<Option<Job>> {
        self.store.load(job_id).await
    }

    /// Jobs submitted by one owner, newest first.
    pub async fn jobs_for_owner(&self, owner: &str) -> QueueResult<Vec<Job>> {
        self.store.jobs_for_owner(owner).await
    }

    pub async fn ping(&self) -> QueueResult<()> {
        self.broker.ping().await
    }

    /// Depth of every queue, highest priority first.
    pub async fn queue_stats(&self) -> QueueResult<Vec<QueueStats>> {
        let mut stats = Vec::with_capacity(QueueKind::BY_PRIORITY.len());
        for kind in QueueKind::BY_PRIORITY {
            stats.push(self.broker.stats(kind).await?);
        }
        Ok(stats)
    }

    pub async fn purge_dead_letter(&self, kind: QueueKind, job_id: &JobId) -> QueueResult<usize> {
        let removed = self.broker.purge_dead_letter(kind, job_id).await?;
        info!(job_id = %job_id, queue = %kind, removed, "Purged dead-letter entries");
        Ok(removed)
    }
}

//! Runs the compute pipeline for a delivery and records the outcome.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use mm_models::{Job, JobError, JobErrorKind, JobId, ScanState};
use mm_queue::{ComputeJob, Delivery, QueueJob};
use mm_storage::ObjectStore;

use crate::error::{WorkerError, WorkerResult};
use crate::executor::JobHandler;
use crate::logging::JobLogger;
use crate::metrics;
use crate::pipeline::{work_prefix, Pipeline, PipelineOutcome, PipelineRequest};
use crate::progress::ProgressPublisher;

/// Default lifetime of the processing lease.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(300);

/// Runs one compute delivery at a time per job.
///
/// A delivery first takes the job's processing lease in the job store and
/// keeps refreshing it while the pipeline runs. A duplicate delivery that
/// finds the lease held elsewhere is acknowledged without doing any work.
pub struct ComputeWorker {
    pipeline: Pipeline,
    publisher: ProgressPublisher,
    store: Arc<dyn ObjectStore>,
    lease_ttl: Duration,
}

impl ComputeWorker {
    pub fn new(pipeline: Pipeline, publisher: ProgressPublisher, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            pipeline,
            publisher,
            store,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }

    /// Must stay below the broker's stale-claim idle time so a crashed
    /// holder's lease is gone before its delivery is reclaimed.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    fn keep_lease(&self, id: JobId, holder: String) -> JoinHandle<()> {
        let jobs = Arc::clone(self.publisher.store());
        let ttl = self.lease_ttl;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval((ttl / 3).max(Duration::from_millis(10)));
            interval.tick().await;
            loop {
                interval.tick().await;
                match jobs.acquire_lease(&id, &holder, ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(job_id = %id, "Processing lease taken by another delivery");
                        break;
                    }
                    Err(e) => warn!(job_id = %id, "Lease refresh failed: {}", e),
                }
            }
        })
    }

    async fn process_leased(&self, compute: &ComputeJob, delivery: &Delivery) -> WorkerResult<()> {
        let jobs = self.publisher.store();
        let id = &compute.job.id;
        if !jobs.acquire_lease(id, &delivery.id, self.lease_ttl).await? {
            JobLogger::new(id, "compute").log_warning("processing lease held by another delivery, skipping");
            return Ok(());
        }

        let refresh = self.keep_lease(id.clone(), delivery.id.clone());
        let result = self.process(compute, delivery.attempt()).await;
        refresh.abort();

        if let Err(e) = jobs.release_lease(id, &delivery.id).await {
            warn!(job_id = %id, "Failed to release processing lease: {}", e);
        }
        result
    }

    /// The persisted record is authoritative; the payload is a fallback for
    /// records that expired or were never written.
    async fn load(&self, compute: &ComputeJob) -> WorkerResult<Job> {
        Ok(self
            .publisher
            .store()
            .load(&compute.job.id)
            .await?
            .unwrap_or_else(|| compute.job.clone()))
    }

    async fn cleanup(&self, job: &Job, logger: &JobLogger) {
        match self.store.delete_prefix(&work_prefix(&job.id)).await {
            Ok(removed) if removed > 0 => logger.log_progress(&format!("removed {} work artifacts", removed)),
            Ok(_) => {}
            Err(e) => logger.log_warning(&format!("failed to remove work artifacts: {}", e)),
        }
    }

    async fn process(&self, compute: &ComputeJob, attempt: u32) -> WorkerResult<()> {
        let logger = JobLogger::new(&compute.job.id, "compute");
        let mut job = self.load(compute).await?;

        if job.status.is_terminal() {
            logger.log_progress(&format!("already {}, skipping redelivery", job.status));
            return Ok(());
        }

        if !matches!(job.scan, ScanState::Clean | ScanState::Skipped | ScanState::NotRequired) {
            logger.log_error(&format!("input scan state is {:?}", job.scan));
            job.fail(JobError::new(
                JobErrorKind::Validation,
                Some("scan"),
                "input has not passed the malware scan",
            ))?;
            metrics::record_job_failed("compute", "validation");
            return self.publisher.report(&job, None, None).await;
        }

        job.record_attempt(attempt);
        job.start_processing()?;
        logger.log_start(&format!("attempt {}", attempt));
        self.publisher
            .report(&job, None, Some("Processing started".to_string()))
            .await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = self.pipeline.execute(PipelineRequest::from_job(&job), tx);
        let persist = async {
            let mut first_error = None;
            while let Some(event) = rx.recv().await {
                if !job.advance_progress(event.progress) {
                    continue;
                }
                if let Err(e) = self.publisher.report(&job, Some(event.stage.as_str()), None).await {
                    warn!(job_id = %job.id, "Failed to persist progress: {}", e);
                    first_error.get_or_insert(e);
                }
            }
            first_error
        };
        let (outcome, persist_error) = tokio::join!(run, persist);

        if let Some(e) = persist_error {
            return Err(e);
        }

        match outcome {
            PipelineOutcome::Completed {
                output_ref,
                thumbnail_ref,
                ..
            } => {
                job.complete(output_ref, thumbnail_ref)?;
                self.publisher
                    .report(&job, None, Some("Completed".to_string()))
                    .await?;
                metrics::record_job_completed("compute");
                logger.log_completion(job.result_ref.as_deref().unwrap_or_default());
            }
            PipelineOutcome::Failed { stage, error, .. } => {
                job.fail(JobError::stage(stage.as_str(), error))?;
                self.publisher.report(&job, Some(stage.as_str()), None).await?;
                metrics::record_job_failed("compute", "stage");
                logger.log_error(&format!("failed in {}", stage));
            }
        }

        self.cleanup(&job, &logger).await;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for ComputeWorker {
    async fn handle(&self, delivery: &Delivery) -> WorkerResult<()> {
        match delivery.job() {
            QueueJob::Compute(compute) => self.process_leased(compute, delivery).await,
            QueueJob::Scan(_) => Err(WorkerError::job_failed("scan payload on the compute queue")),
        }
    }

    async fn on_dead_letter(&self, delivery: &Delivery, attempts: u32, reason: &str) -> WorkerResult<()> {
        let QueueJob::Compute(compute) = delivery.job() else {
            return Ok(());
        };
        let mut job = self.load(compute).await?;
        if job.status.is_terminal() {
            return Ok(());
        }
        job.fail(JobError::dead_lettered(attempts, reason))?;
        metrics::record_job_failed("compute", "dead_lettered");
        self.publisher.report(&job, None, None).await
    }
}

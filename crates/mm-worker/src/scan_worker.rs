//! Malware scan gate in front of the compute queue.

use std::sync::Arc;

use async_trait::async_trait;

use mm_media::ScanBackend;
use mm_models::{Job, JobError, JobStatus, ScanOutcome, ScanPolicy, ScanState};
use mm_queue::{Delivery, QueueJob, QueueManager, ScanJob};

use crate::error::{WorkerError, WorkerResult};
use crate::executor::JobHandler;
use crate::logging::JobLogger;
use crate::metrics;
use crate::progress::ProgressPublisher;

/// Scans a job's uploaded files and only then enqueues compute.
pub struct ScanWorker {
    manager: QueueManager,
    scanner: Arc<dyn ScanBackend>,
    publisher: ProgressPublisher,
    policy: ScanPolicy,
}

impl ScanWorker {
    pub fn new(
        manager: QueueManager,
        scanner: Arc<dyn ScanBackend>,
        publisher: ProgressPublisher,
        policy: ScanPolicy,
    ) -> Self {
        Self {
            manager,
            scanner,
            publisher,
            policy,
        }
    }

    /// Scan the files, treating an unavailable backend as an error outcome.
    pub async fn scan(&self, file_refs: &[String]) -> ScanOutcome {
        if !self.scanner.is_available().await {
            return ScanOutcome::Error {
                reason: format!("{} scanner unavailable", self.scanner.name()),
            };
        }
        self.scanner.scan(file_refs).await
    }

    async fn proceed(&self, job: &mut Job, state: ScanState, message: &str) -> WorkerResult<()> {
        job.record_scan(state)?;
        self.publisher.report(job, Some("scan"), Some(message.to_string())).await?;
        self.manager.enqueue_compute_once(job).await?;
        Ok(())
    }

    async fn process(&self, scan: &ScanJob, attempt: u32) -> WorkerResult<()> {
        let logger = JobLogger::new(&scan.parent_job_id, "scan");
        let Some(mut job) = self.manager.get_job(&scan.parent_job_id).await? else {
            logger.log_warning("job record not found, dropping scan request");
            return Ok(());
        };

        if job.status.is_terminal() || job.status == JobStatus::Processing {
            logger.log_progress(&format!("already {}, skipping redelivered scan", job.status));
            return Ok(());
        }

        if matches!(job.scan, ScanState::Clean | ScanState::Skipped) {
            logger.log_progress(&format!("scan already recorded as {:?}, not rescanning", job.scan));
            self.manager.enqueue_compute_once(&job).await?;
            return Ok(());
        }

        job.record_attempt(attempt);
        job.start_scan()?;
        self.publisher
            .report(&job, Some("scan"), Some("Scanning upload".to_string()))
            .await?;

        let outcome = self.scan(&scan.file_refs).await;
        metrics::record_scan_outcome(outcome.as_str());

        match outcome {
            ScanOutcome::Clean => {
                logger.log_completion("scan clean");
                self.proceed(&mut job, ScanState::Clean, "Scan clean").await
            }
            ScanOutcome::Infected { flagged } => {
                logger.log_error(&format!("malware detected in {} file(s)", flagged.len()));
                job.scan = ScanState::Infected;
                job.fail(JobError::infected(&flagged))?;
                metrics::record_job_failed("scan", "infected");
                self.publisher.report(&job, Some("scan"), None).await
            }
            ScanOutcome::Error { reason } => match self.policy {
                ScanPolicy::FailOpen => {
                    logger.log_warning(&format!("scan unavailable ({}), proceeding unscanned", reason));
                    self.proceed(&mut job, ScanState::Skipped, "Scan skipped").await
                }
                ScanPolicy::FailClosed => {
                    logger.log_error(&format!("scan unavailable ({}), failing job", reason));
                    job.fail(JobError::scan_unavailable(reason))?;
                    metrics::record_job_failed("scan", "scan_unavailable");
                    self.publisher.report(&job, Some("scan"), None).await
                }
            },
        }
    }
}

#[async_trait]
impl JobHandler for ScanWorker {
    async fn handle(&self, delivery: &Delivery) -> WorkerResult<()> {
        match delivery.job() {
            QueueJob::Scan(scan) => self.process(scan, delivery.attempt()).await,
            QueueJob::Compute(_) => Err(WorkerError::job_failed("compute payload on the scan queue")),
        }
    }

    async fn on_dead_letter(&self, delivery: &Delivery, attempts: u32, reason: &str) -> WorkerResult<()> {
        let Some(mut job) = self.manager.get_job(delivery.job_id()).await? else {
            return Ok(());
        };
        if job.status.is_terminal() {
            return Ok(());
        }
        job.fail(JobError::dead_lettered(attempts, reason))?;
        metrics::record_job_failed("scan", "dead_lettered");
        self.publisher.report(&job, Some("scan"), None).await
    }
}

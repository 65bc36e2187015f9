//! Persist-then-publish progress reporting.

use std::sync::Arc;

use tracing::{debug, warn};

use mm_models::{Job, ProgressUpdate};
use mm_queue::{JobStore, ProgressSink};

use crate::error::WorkerResult;
use crate::metrics;

/// Writes the job record, then announces the change.
///
/// The status query reads the record, so a save failure is an error for the
/// caller. Publishing is best-effort: failures are logged and swallowed.
#[derive(Clone)]
pub struct ProgressPublisher {
    store: Arc<dyn JobStore>,
    sink: Arc<dyn ProgressSink>,
}

impl ProgressPublisher {
    pub fn new(store: Arc<dyn JobStore>, sink: Arc<dyn ProgressSink>) -> Self {
        Self { store, sink }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Save `job` and publish its current state.
    pub async fn report(&self, job: &Job, stage: Option<&str>, message: Option<String>) -> WorkerResult<()> {
        self.store.save(job).await?;
        self.publish(&ProgressUpdate::from_job(job, stage, message)).await;
        Ok(())
    }

    async fn publish(&self, update: &ProgressUpdate) {
        match self.sink.publish(update).await {
            Ok(()) => debug!(
                job_id = %update.job_id,
                status = %update.status,
                progress = update.progress,
                "Published progress"
            ),
            Err(e) => {
                metrics::record_publish_failure();
                warn!(job_id = %update.job_id, "Failed to publish progress: {}", e);
            }
        }
    }
}

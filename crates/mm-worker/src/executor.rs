//! Job executor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use mm_queue::{Delivery, FailDisposition, JobBroker, QueueKind};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics;

/// Maximum deliveries pulled per consume call.
const MAX_BATCH: usize = 5;

/// Maximum stale deliveries reclaimed per queue and sweep.
const MAX_CLAIM_BATCH: usize = 10;

/// Processes deliveries of one queue.
///
/// `handle` returning `Ok` means the outcome (success or terminal failure)
/// is durably recorded and the delivery can be acked. `Err` hands the
/// delivery back to the broker for retry.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> WorkerResult<()>;

    /// The broker gave up on a delivery; record the terminal failure.
    async fn on_dead_letter(&self, delivery: &Delivery, attempts: u32, reason: &str) -> WorkerResult<()>;
}

type Handlers = Arc<Vec<(QueueKind, Arc<dyn JobHandler>)>>;

/// Job executor that processes jobs from one or more queues.
///
/// Queues are polled in priority order; only the lowest-priority queue is
/// consumed with a blocking read.
pub struct JobExecutor {
    config: WorkerConfig,
    broker: Arc<dyn JobBroker>,
    handlers: Handlers,
    max_concurrent_jobs: usize,
    job_semaphore: Arc<Semaphore>,
    shutdown: tokio::sync::watch::Sender<bool>,
    consumer_name: String,
}

impl JobExecutor {
    /// Create a new job executor.
    pub fn new(
        config: WorkerConfig,
        broker: Arc<dyn JobBroker>,
        handlers: Vec<(QueueKind, Arc<dyn JobHandler>)>,
        max_concurrent_jobs: usize,
    ) -> Self {
        let mut handlers = handlers;
        handlers.sort_by_key(|(kind, _)| std::cmp::Reverse(kind.priority()));
        let max_concurrent_jobs = max_concurrent_jobs.max(1);
        let job_semaphore = Arc::new(Semaphore::new(max_concurrent_jobs));
        let (shutdown, _) = tokio::sync::watch::channel(false);
        let roles: Vec<&str> = handlers.iter().map(|(k, _)| k.as_str()).collect();
        let consumer_name = format!("worker-{}-{}", roles.join("-"), Uuid::new_v4());

        Self {
            config,
            broker,
            handlers: Arc::new(handlers),
            max_concurrent_jobs,
            job_semaphore,
            shutdown,
            consumer_name,
        }
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Run until [`JobExecutor::shutdown`] is called.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            "Starting job executor '{}' with {} max concurrent jobs",
            self.consumer_name, self.max_concurrent_jobs
        );

        self.broker.init().await?;

        let mut shutdown_rx = self.shutdown.subscribe();
        let claim_task = self.spawn_claim_task();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping executor");
                        break;
                    }
                }
                result = self.consume_jobs() => {
                    if let Err(e) = result {
                        error!("Error consuming jobs: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }

        claim_task.abort();

        info!("Waiting for in-flight jobs to complete...");
        if tokio::time::timeout(self.config.shutdown_timeout, self.wait_for_jobs())
            .await
            .is_err()
        {
            warn!("Shutdown timeout reached with jobs still running; they will be redelivered");
        }

        info!("Job executor stopped");
        Ok(())
    }

    /// Periodically take over deliveries abandoned by crashed workers.
    fn spawn_claim_task(&self) -> tokio::task::JoinHandle<()> {
        let broker = Arc::clone(&self.broker);
        let handlers = Arc::clone(&self.handlers);
        let consumer_name = self.consumer_name.clone();
        let interval_period = self.config.claim_interval;
        let min_idle = self.config.claim_min_idle;
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_period);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        for (kind, handler) in handlers.iter() {
                            match broker.claim_stale(*kind, &consumer_name, min_idle, MAX_CLAIM_BATCH).await {
                                Ok(reclaimed) if !reclaimed.is_empty() => {
                                    info!(queue = %kind, "Reclaimed {} stale deliveries", reclaimed.len());
                                    for r in reclaimed {
                                        if let FailDisposition::DeadLettered { attempts } = r.disposition {
                                            Self::dead_letter(handler, &r.delivery, attempts, "visibility timeout expired").await;
                                        }
                                    }
                                }
                                Ok(_) => {}
                                Err(e) => warn!(queue = %kind, "Failed to claim stale deliveries: {}", e),
                            }
                        }
                    }
                }
            }
        })
    }

    /// Consume and dispatch one batch.
    async fn consume_jobs(&self) -> WorkerResult<()> {
        let available = self.job_semaphore.available_permits();
        if available == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        let count = available.min(MAX_BATCH);
        let last = self.handlers.len().saturating_sub(1);
        for (i, (kind, handler)) in self.handlers.iter().enumerate() {
            let block = (i == last).then_some(self.config.consume_block);
            let deliveries = self
                .broker
                .consume(*kind, &self.consumer_name, block, count)
                .await?;
            if deliveries.is_empty() {
                continue;
            }

            debug!(queue = %kind, "Consumed {} deliveries", deliveries.len());
            for delivery in deliveries {
                let permit = self
                    .job_semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| WorkerError::job_failed("Semaphore closed"))?;
                let broker = Arc::clone(&self.broker);
                let handler = Arc::clone(handler);
                let consumer = self.consumer_name.clone();
                let heartbeat = self.config.job_heartbeat_interval;
                let in_flight = self.max_concurrent_jobs - self.job_semaphore.available_permits();
                metrics::set_jobs_in_flight(kind.as_str(), in_flight);

                tokio::spawn(async move {
                    let _permit = permit;
                    Self::execute_job(broker, handler, delivery, consumer, heartbeat).await;
                });
            }
            // Re-check higher priority queues before touching lower ones.
            return Ok(());
        }

        if self.handlers.is_empty() {
            tokio::time::sleep(self.config.consume_block).await;
        }
        Ok(())
    }

    /// Execute a single delivery, then ack or hand it back for retry.
    async fn execute_job(
        broker: Arc<dyn JobBroker>,
        handler: Arc<dyn JobHandler>,
        delivery: Delivery,
        consumer: String,
        heartbeat_interval: Duration,
    ) {
        let queue = delivery.kind.as_str();
        let logger = JobLogger::new(delivery.job_id(), queue);
        let span = logger.create_span();

        async {
            logger.log_start(&format!("attempt {}", delivery.attempt()));
            metrics::record_job_started(queue);

            let heartbeat = {
                let broker = Arc::clone(&broker);
                let delivery = delivery.clone();
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(heartbeat_interval);
                    interval.tick().await;
                    loop {
                        interval.tick().await;
                        if let Err(e) = broker.touch(&delivery, &consumer).await {
                            warn!(job_id = %delivery.job_id(), "Heartbeat failed: {}", e);
                        }
                    }
                })
            };

            let result = handler.handle(&delivery).await;
            heartbeat.abort();

            match result {
                Ok(()) => {
                    if let Err(e) = broker.ack(&delivery).await {
                        logger.log_error(&format!("failed to ack: {}", e));
                    } else {
                        logger.log_completion("delivery acknowledged");
                    }
                }
                Err(e) => {
                    logger.log_error(&e.to_string());
                    match broker.fail(&delivery, &e.to_string()).await {
                        Ok(FailDisposition::Retrying { next_attempt, delay }) => {
                            logger.log_warning(&format!(
                                "will be retried (attempt {}) in {:?}",
                                next_attempt, delay
                            ));
                        }
                        Ok(FailDisposition::DeadLettered { attempts }) => {
                            Self::dead_letter(&handler, &delivery, attempts, &e.to_string()).await;
                        }
                        Err(fail_err) => {
                            logger.log_error(&format!("failed to report failure to broker: {}", fail_err));
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn dead_letter(handler: &Arc<dyn JobHandler>, delivery: &Delivery, attempts: u32, reason: &str) {
        warn!(
            job_id = %delivery.job_id(),
            queue = %delivery.kind,
            attempts,
            "Delivery exhausted its retries, moved to dead-letter queue"
        );
        metrics::record_dead_lettered(delivery.kind.as_str());
        if let Err(e) = handler.on_dead_letter(delivery, attempts, reason).await {
            error!(job_id = %delivery.job_id(), "Failed to record dead-lettered job: {}", e);
        }
    }

    /// Wait for all in-flight jobs to complete.
    async fn wait_for_jobs(&self) {
        loop {
            if self.job_semaphore.available_permits() == self.max_concurrent_jobs {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

//! Worker binary: one scan executor and one compute executor.

use std::sync::Arc;

use tracing::{error, info};

use mm_inference::{create_adapter, InferenceConfig};
use mm_media::{ClamAvScanner, ScanConfig};
use mm_queue::{
    JobBroker, ProgressChannel, QueueKind, QueueManager, RedisJobQueue, RedisJobStore,
};
use mm_storage::{LocalFsStore, ObjectStore};
use mm_worker::{
    logging, metrics, ComputeWorker, JobExecutor, JobHandler, Pipeline, ProgressPublisher,
    ScanWorker, WorkerConfig,
};

fn exit_on_error<T, E: std::fmt::Display>(result: Result<T, E>, what: &str) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            error!("Failed to create {}: {}", what, e);
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    logging::init_tracing();

    info!("Starting mm-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    if let Some(port) = config.metrics_port {
        metrics::install_exporter(port);
    }

    let queue = exit_on_error(RedisJobQueue::from_env(), "job queue");
    let redis_url = queue.config().redis_url.clone();
    let broker: Arc<dyn JobBroker> = Arc::new(queue);
    let job_store = Arc::new(exit_on_error(RedisJobStore::new(&redis_url), "job store"));
    let progress = Arc::new(exit_on_error(ProgressChannel::new(&redis_url), "progress channel"));
    let objects: Arc<dyn ObjectStore> = Arc::new(LocalFsStore::from_env());

    let manager = QueueManager::new(Arc::clone(&broker), job_store.clone());
    let publisher = ProgressPublisher::new(job_store, progress);

    let scanner = Arc::new(ClamAvScanner::new(ScanConfig::from_env(), Arc::clone(&objects)));
    let adapter = exit_on_error(
        create_adapter(&InferenceConfig::from_env(), Arc::clone(&objects)),
        "inference adapter",
    );
    let pipeline = Pipeline::new(
        Arc::clone(&objects),
        adapter,
        config.stage_timeouts.clone(),
        config.max_image_dimension,
    );

    let scan_worker: Arc<dyn JobHandler> = Arc::new(ScanWorker::new(
        manager,
        scanner,
        publisher.clone(),
        config.scan_policy,
    ));
    let compute_worker: Arc<dyn JobHandler> = Arc::new(
        ComputeWorker::new(pipeline, publisher, objects).with_lease_ttl(config.lease_ttl()),
    );

    let scan_executor = Arc::new(JobExecutor::new(
        config.clone(),
        Arc::clone(&broker),
        vec![(QueueKind::Scan, scan_worker)],
        config.scan_concurrency,
    ));
    let compute_executor = Arc::new(JobExecutor::new(
        config.clone(),
        broker,
        vec![(QueueKind::Compute, compute_worker)],
        config.max_concurrent_jobs,
    ));

    {
        let scan_executor = Arc::clone(&scan_executor);
        let compute_executor = Arc::clone(&compute_executor);
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Received shutdown signal");
            scan_executor.shutdown();
            compute_executor.shutdown();
        });
    }

    let (scan_result, compute_result) = tokio::join!(scan_executor.run(), compute_executor.run());
    for result in [scan_result, compute_result] {
        if let Err(e) = result {
            error!("Executor error: {}", e);
            std::process::exit(1);
        }
    }

    info!("Worker shutdown complete");
}

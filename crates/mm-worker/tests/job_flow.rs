//! End-to-end job flow over in-memory queues, storage and pub/sub.

use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use mockall::mock;

use mm_inference::{InferenceAdapter, InferenceError, InferenceRequest, InferenceResult, ProgressTx, StubAdapter};
use mm_media::{ScanBackend, StaticScanner};
use mm_models::{
    GenerationParams, InputRef, Job, JobErrorKind, JobId, JobStatus, ProgressUpdate, ScanState,
};
use mm_queue::{
    Delivery, JobBroker, JobStore, MemoryBroker, MemoryJobStore, MemoryProgressBus, QueueKind,
    QueueManager, RetryPolicy,
};
use mm_storage::{MemoryStore, ObjectStore};
use mm_worker::{
    ComputeWorker, JobExecutor, JobHandler, Pipeline, ProgressPublisher, ScanWorker, StageTimeouts,
    WorkerConfig, WorkerError, WorkerResult,
};

mock! {
    pub Adapter {}

    #[async_trait]
    impl InferenceAdapter for Adapter {
        fn name(&self) -> &'static str;
        async fn infer(&self, request: &InferenceRequest, progress: ProgressTx) -> InferenceResult<String>;
        async fn health_check(&self) -> bool;
    }
}

fn png(width: u32, height: u32) -> Bytes {
    let img = image::RgbaImage::from_fn(width, height, |x, y| {
        image::Rgba([(x * 3 % 255) as u8, (y * 5 % 255) as u8, 90, 255])
    });
    let mut cursor = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut cursor, image::ImageFormat::Png)
        .unwrap();
    Bytes::from(cursor.into_inner())
}

fn test_config() -> WorkerConfig {
    WorkerConfig {
        consume_block: Duration::from_millis(50),
        claim_interval: Duration::from_secs(3600),
        shutdown_timeout: Duration::from_secs(5),
        ..WorkerConfig::default()
    }
}

struct System {
    broker: Arc<MemoryBroker>,
    jobs: Arc<MemoryJobStore>,
    objects: Arc<MemoryStore>,
    bus: MemoryProgressBus,
    manager: QueueManager,
    executors: Vec<Arc<JobExecutor>>,
    handles: Vec<tokio::task::JoinHandle<WorkerResult<()>>>,
}

impl System {
    fn new(scanner: Arc<dyn ScanBackend>, adapter: Option<Arc<dyn InferenceAdapter>>) -> Self {
        let broker = Arc::new(MemoryBroker::new(RetryPolicy::new(3, Duration::from_millis(10))));
        let jobs = Arc::new(MemoryJobStore::new());
        let objects = Arc::new(MemoryStore::new());
        let bus = MemoryProgressBus::new(256);

        let manager = QueueManager::new(broker.clone(), jobs.clone());
        let publisher = ProgressPublisher::new(jobs.clone(), Arc::new(bus.clone()));
        let adapter = adapter.unwrap_or_else(|| Arc::new(StubAdapter::new(objects.clone())));
        let pipeline = Pipeline::new(objects.clone(), adapter, StageTimeouts::default(), 256);

        let scan: Arc<dyn JobHandler> = Arc::new(ScanWorker::new(
            manager.clone(),
            scanner,
            publisher.clone(),
            Default::default(),
        ));
        let compute: Arc<dyn JobHandler> = Arc::new(ComputeWorker::new(pipeline, publisher, objects.clone()));

        let executor = Arc::new(JobExecutor::new(
            test_config(),
            broker.clone(),
            vec![(QueueKind::Compute, compute), (QueueKind::Scan, scan)],
            2,
        ));

        Self {
            broker,
            jobs,
            objects,
            bus,
            manager,
            executors: vec![executor],
            handles: Vec::new(),
        }
    }

    fn start(&mut self) {
        for executor in &self.executors {
            let executor = Arc::clone(executor);
            self.handles.push(tokio::spawn(async move { executor.run().await }));
        }
    }

    async fn stop(&mut self) {
        for executor in &self.executors {
            executor.shutdown();
        }
        for handle in self.handles.drain(..) {
            handle.await.unwrap().unwrap();
        }
    }

    async fn wait_for_terminal(&self, id: &JobId) -> Job {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(job) = self.jobs.load(id).await.unwrap() {
                    if job.status.is_terminal() {
                        return job;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("job did not reach a terminal state")
    }

    async fn upload(&self, key: &str) -> Job {
        self.objects.put(key, png(640, 480)).await.unwrap();
        Job::new(InputRef::object(key), Some("user-1".into()), GenerationParams::default())
    }
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<ProgressUpdate>) -> Vec<ProgressUpdate> {
    let mut updates = Vec::new();
    while let Ok(update) = rx.try_recv() {
        updates.push(update);
    }
    updates
}

#[tokio::test]
async fn uploaded_image_flows_through_scan_and_all_stages() {
    let mut system = System::new(Arc::new(StaticScanner::clean()), None);
    let mut rx = system.bus.receiver();
    system.start();

    let job = system.upload("uploads/user-1/page.png").await;
    system.manager.submit(job.clone()).await.unwrap();

    let done = system.wait_for_terminal(&job.id).await;
    system.stop().await;

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 100);
    assert_eq!(done.scan, ScanState::Clean);
    let result_ref = done.result_ref.clone().unwrap();
    assert_eq!(result_ref, format!("outputs/{}/result.png", job.id));
    assert!(system.objects.exists(&result_ref).await.unwrap());
    let thumbnail_ref = done.thumbnail_ref.clone().unwrap();
    let thumbnail = system.objects.get(&thumbnail_ref).await.unwrap();
    assert_eq!(image::guess_format(&thumbnail).unwrap(), image::ImageFormat::Jpeg);
    assert!(system
        .objects
        .exists(&format!("outputs/{}/manifest.json", job.id))
        .await
        .unwrap());
    assert!(system
        .objects
        .keys()
        .await
        .iter()
        .all(|k| !k.starts_with(&format!("work/{}/", job.id))));

    let updates = drain(&mut rx);
    assert!(!updates.is_empty());
    assert!(updates.iter().all(|u| u.owner_id.as_deref() == Some("user-1")));
    let progress: Vec<u8> = updates.iter().map(|u| u.progress).collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
    assert_eq!(updates.first().unwrap().status, JobStatus::Scanning);
    assert_eq!(updates.first().unwrap().progress, 5);
    assert_eq!(updates.last().unwrap().status, JobStatus::Completed);
    assert_eq!(updates.last().unwrap().progress, 100);

    let stats = system.broker.stats(QueueKind::Compute).await.unwrap();
    assert_eq!(stats.ready, 0);
    assert_eq!(stats.dead_lettered, 0);
}

#[tokio::test]
async fn infected_upload_never_reaches_inference() {
    let mut adapter = MockAdapter::new();
    adapter.expect_name().return_const("mock");
    adapter.expect_infer().times(0);

    let mut system = System::new(Arc::new(StaticScanner::flagging("eicar")), Some(Arc::new(adapter)));
    system.start();

    let job = system.upload("uploads/user-1/eicar.png").await;
    system.manager.submit(job.clone()).await.unwrap();

    let done = system.wait_for_terminal(&job.id).await;
    system.stop().await;

    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.scan, ScanState::Infected);
    assert_eq!(done.error.unwrap().kind, JobErrorKind::Infected);
    assert!(done.result_ref.is_none());
    assert_eq!(system.broker.stats(QueueKind::Compute).await.unwrap().ready, 0);
}

#[tokio::test]
async fn inference_failure_fails_job_with_frozen_progress() {
    let mut adapter = MockAdapter::new();
    adapter.expect_name().return_const("mock");
    adapter.expect_infer().times(1).returning(|_, progress| {
        progress.report(0.5);
        Err(InferenceError::request_failed("model crashed"))
    });

    let mut system = System::new(Arc::new(StaticScanner::clean()), Some(Arc::new(adapter)));
    let mut rx = system.bus.receiver();
    system.start();

    let job = Job::new(InputRef::prompt("a knight at dawn"), Some("user-1".into()), GenerationParams::default());
    system.manager.submit(job.clone()).await.unwrap();

    let done = system.wait_for_terminal(&job.id).await;
    system.stop().await;

    assert_eq!(done.status, JobStatus::Failed);
    let error = done.error.clone().unwrap();
    assert_eq!(error.kind, JobErrorKind::Stage);
    assert_eq!(error.stage.as_deref(), Some("inference"));
    assert!(error.message.contains("model crashed"));
    assert_eq!(done.progress, 42);
    assert!(done.thumbnail_ref.is_none());

    let updates = drain(&mut rx);
    let last = updates.last().unwrap();
    assert_eq!(last.status, JobStatus::Failed);
    assert_eq!(last.progress, 42);
    assert!(updates.iter().all(|u| u.progress <= 65));
    // A stage failure is a recorded outcome, not a delivery failure.
    assert!(system.broker.dead_letters(QueueKind::Compute).is_empty());
}

struct AlwaysFails {
    attempts: AtomicU32,
    dead_lettered: AtomicU32,
}

#[async_trait]
impl JobHandler for AlwaysFails {
    async fn handle(&self, _: &Delivery) -> WorkerResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(WorkerError::job_failed("job store unreachable"))
    }

    async fn on_dead_letter(&self, _: &Delivery, attempts: u32, reason: &str) -> WorkerResult<()> {
        assert_eq!(attempts, 3);
        assert!(reason.contains("job store unreachable"));
        self.dead_lettered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn delivery_errors_retry_then_dead_letter() {
    let broker = Arc::new(MemoryBroker::new(RetryPolicy::new(3, Duration::from_millis(10))));
    let handler = Arc::new(AlwaysFails {
        attempts: AtomicU32::new(0),
        dead_lettered: AtomicU32::new(0),
    });
    let executor = Arc::new(JobExecutor::new(
        test_config(),
        broker.clone(),
        vec![(QueueKind::Compute, handler.clone() as Arc<dyn JobHandler>)],
        1,
    ));
    let running = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.run().await })
    };

    let job = Job::new(InputRef::prompt("x"), None, GenerationParams::default());
    broker.enqueue(mm_queue::QueueJob::compute(job)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        while handler.dead_lettered.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("delivery was never dead-lettered");

    executor.shutdown();
    running.await.unwrap().unwrap();

    assert_eq!(handler.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(broker.dead_letters(QueueKind::Compute).len(), 1);
}

//! The five-stage compute pipeline.
//!
//! Stages run strictly in order and each owns a disjoint slice of the
//! progress scale (see [`StageName::progress_range`]). The first failing
//! fatal stage stops the pipeline; a failing thumbnail only loses the
//! preview. The pipeline never retries: redelivery is the broker's job.

mod assemble;
mod inference;
mod postprocess;
mod preprocess;
mod thumbnail;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use mm_inference::InferenceAdapter;
use mm_models::{InputRef, Job, JobId, PipelineStageResult, StageName};
use mm_storage::ObjectStore;

use crate::config::StageTimeouts;
use crate::error::{WorkerError, WorkerResult};
use crate::metrics;

pub use assemble::AssembleStage;
pub use inference::InferenceStage;
pub use postprocess::PostprocessStage;
pub use preprocess::PreprocessStage;
pub use thumbnail::ThumbnailStage;

/// Storage prefix for intermediate artifacts of a job.
pub fn work_prefix(job_id: &JobId) -> String {
    format!("work/{}/", job_id)
}

/// Storage prefix for deliverables of a job.
pub fn outputs_prefix(job_id: &JobId) -> String {
    format!("outputs/{}/", job_id)
}

/// Everything the stages need to know about the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRequest {
    pub job_id: JobId,
    pub input: InputRef,
    pub prompt: Option<String>,
    pub style: Option<String>,
    pub seed: Option<u64>,
}

impl PipelineRequest {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            input: job.input.clone(),
            prompt: job
                .params
                .prompt
                .clone()
                .or_else(|| job.input.prompt_text().map(str::to_string)),
            style: job.params.style.clone(),
            seed: job.params.seed,
        }
    }
}

/// Progress event emitted while the pipeline runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineEvent {
    pub stage: StageName,
    pub progress: u8,
}

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed {
        output_ref: String,
        thumbnail_ref: Option<String>,
        stages: Vec<PipelineStageResult>,
    },
    Failed {
        stage: StageName,
        error: String,
        stages: Vec<PipelineStageResult>,
    },
}

impl PipelineOutcome {
    pub fn stages(&self) -> &[PipelineStageResult] {
        match self {
            PipelineOutcome::Completed { stages, .. } | PipelineOutcome::Failed { stages, .. } => stages,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, PipelineOutcome::Completed { .. })
    }
}

/// Monotonic progress emitter shared by all stages of one run.
#[derive(Debug, Clone)]
struct ProgressTracker {
    last: Arc<AtomicU8>,
    events: mpsc::UnboundedSender<PipelineEvent>,
}

impl ProgressTracker {
    fn new(events: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        Self {
            last: Arc::new(AtomicU8::new(0)),
            events,
        }
    }

    fn emit(&self, stage: StageName, progress: u8) {
        let progress = progress.min(100);
        let previous = self.last.fetch_max(progress, Ordering::SeqCst);
        if progress > previous {
            let _ = self.events.send(PipelineEvent { stage, progress });
        }
    }
}

/// Per-stage view handed to [`PipelineStage::run`].
pub struct StageContext<'a> {
    pub request: &'a PipelineRequest,
    pub store: &'a Arc<dyn ObjectStore>,
    stage: StageName,
    tracker: ProgressTracker,
}

impl StageContext<'_> {
    /// Report a fraction of this stage's work; it is mapped into the
    /// stage's progress range and only ever moves forward.
    pub fn report(&self, fraction: f32) {
        self.tracker.emit(self.stage, self.stage.scale(fraction));
    }

    pub fn work_key(&self, name: &str) -> String {
        format!("{}{}", work_prefix(&self.request.job_id), name)
    }

    pub fn output_key(&self, name: &str) -> String {
        format!("{}{}", outputs_prefix(&self.request.job_id), name)
    }
}

/// One step of the compute pipeline.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> StageName;

    /// Transform the artifact at `input_ref` and return the new artifact's
    /// reference. The first stage receives the job's object key, or an empty
    /// string for prompt-only jobs.
    async fn run(&self, ctx: &StageContext<'_>, input_ref: &str) -> WorkerResult<String>;
}

/// Ordered stage list plus timeouts.
#[derive(Clone)]
pub struct Pipeline {
    stages: Vec<Arc<dyn PipelineStage>>,
    store: Arc<dyn ObjectStore>,
    timeouts: StageTimeouts,
}

impl Pipeline {
    /// The standard five stages.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        adapter: Arc<dyn InferenceAdapter>,
        timeouts: StageTimeouts,
        max_image_dimension: u32,
    ) -> Self {
        let stages: Vec<Arc<dyn PipelineStage>> = vec![
            Arc::new(PreprocessStage::new(max_image_dimension)),
            Arc::new(InferenceStage::new(adapter)),
            Arc::new(PostprocessStage),
            Arc::new(AssembleStage),
            Arc::new(ThumbnailStage::default()),
        ];
        Self {
            stages,
            store,
            timeouts,
        }
    }

    /// Replace the stage with the same name.
    pub fn with_stage(mut self, stage: Arc<dyn PipelineStage>) -> Self {
        let name = stage.name();
        if let Some(slot) = self.stages.iter_mut().find(|s| s.name() == name) {
            *slot = stage;
        }
        self
    }

    pub fn stage_names(&self) -> Vec<StageName> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    async fn run_stage(
        &self,
        stage: &Arc<dyn PipelineStage>,
        ctx: &StageContext<'_>,
        input_ref: &str,
    ) -> WorkerResult<String> {
        let name = stage.name();
        let timeout = self.timeouts.for_stage(name);
        match tokio::time::timeout(timeout, stage.run(ctx, input_ref)).await {
            Ok(result) => result,
            Err(_) => Err(WorkerError::StageTimeout {
                stage: name.to_string(),
                secs: timeout.as_secs(),
            }),
        }
    }

    /// Run every stage in order, streaming progress into `events`.
    pub async fn execute(
        &self,
        request: PipelineRequest,
        events: mpsc::UnboundedSender<PipelineEvent>,
    ) -> PipelineOutcome {
        let tracker = ProgressTracker::new(events);
        let mut results = Vec::with_capacity(self.stages.len());
        let mut current = request.input.object_key().unwrap_or_default().to_string();
        let mut thumbnail_ref = None;

        for stage in &self.stages {
            let name = stage.name();
            let (start, end) = name.progress_range();
            tracker.emit(name, start);

            let ctx = StageContext {
                request: &request,
                store: &self.store,
                stage: name,
                tracker: tracker.clone(),
            };
            let started = Instant::now();
            let result = self.run_stage(stage, &ctx, &current).await;
            let elapsed = started.elapsed();
            let duration_ms = elapsed.as_millis() as u64;
            metrics::record_stage_duration(name.as_str(), result.is_ok(), elapsed.as_secs_f64());

            match result {
                Ok(output_ref) => {
                    debug!(job_id = %request.job_id, stage = %name, output = %output_ref, duration_ms, "Stage succeeded");
                    tracker.emit(name, end);
                    results.push(PipelineStageResult::succeeded(name, output_ref.clone(), duration_ms));
                    if name == StageName::Thumbnail {
                        thumbnail_ref = Some(output_ref);
                    } else {
                        current = output_ref;
                    }
                }
                Err(e) if !name.is_fatal() => {
                    warn!(job_id = %request.job_id, stage = %name, "Non-fatal stage failed: {}", e);
                    results.push(PipelineStageResult::failed(name, e.to_string(), duration_ms));
                }
                Err(e) => {
                    warn!(job_id = %request.job_id, stage = %name, "Stage failed: {}", e);
                    results.push(PipelineStageResult::failed(name, e.to_string(), duration_ms));
                    return PipelineOutcome::Failed {
                        stage: name,
                        error: e.to_string(),
                        stages: results,
                    };
                }
            }
        }

        PipelineOutcome::Completed {
            output_ref: current,
            thumbnail_ref,
            stages: results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mm_inference::StubAdapter;
    use mm_storage::MemoryStore;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Failing(StageName);

    #[async_trait]
    impl PipelineStage for Failing {
        fn name(&self) -> StageName {
            self.0
        }

        async fn run(&self, _: &StageContext<'_>, _: &str) -> WorkerResult<String> {
            Err(WorkerError::stage_failed(self.0.as_str(), "boom"))
        }
    }

    struct Counting(StageName, Arc<AtomicUsize>);

    #[async_trait]
    impl PipelineStage for Counting {
        fn name(&self) -> StageName {
            self.0
        }

        async fn run(&self, _: &StageContext<'_>, input_ref: &str) -> WorkerResult<String> {
            self.1.fetch_add(1, Ordering::SeqCst);
            Ok(input_ref.to_string())
        }
    }

    struct Sleepy;

    #[async_trait]
    impl PipelineStage for Sleepy {
        fn name(&self) -> StageName {
            StageName::Inference
        }

        async fn run(&self, _: &StageContext<'_>, _: &str) -> WorkerResult<String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("never".into())
        }
    }

    fn pipeline(store: Arc<dyn ObjectStore>) -> Pipeline {
        Pipeline::new(
            store.clone(),
            Arc::new(StubAdapter::new(store)),
            StageTimeouts::default(),
            512,
        )
    }

    fn prompt_request() -> PipelineRequest {
        PipelineRequest {
            job_id: JobId::from("job-1"),
            input: InputRef::prompt("a robot in the rain"),
            prompt: Some("a robot in the rain".into()),
            style: Some("shonen".into()),
            seed: Some(42),
        }
    }

    fn drain(mut rx: mpsc::UnboundedReceiver<PipelineEvent>) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_prompt_job_runs_all_stages() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let outcome = pipeline(store.clone()).execute(prompt_request(), tx).await;

        match &outcome {
            PipelineOutcome::Completed { output_ref, stages, .. } => {
                assert!(output_ref.starts_with("outputs/job-1/"));
                assert_eq!(stages.len(), 5);
                assert!(store.exists(output_ref).await.unwrap());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let progress: Vec<u8> = drain(rx).iter().map(|e| e.progress).collect();
        assert!(progress.windows(2).all(|w| w[0] < w[1]), "{progress:?}");
        assert_eq!(progress.first(), Some(&10));
        // Prompt manifests are not images, so the thumbnail stage fails.
        assert_eq!(progress.last(), Some(&90));
    }

    #[tokio::test]
    async fn test_failure_stops_later_stages() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let later = Arc::new(AtomicUsize::new(0));
        let pipeline = pipeline(store)
            .with_stage(Arc::new(Failing(StageName::Postprocess)))
            .with_stage(Arc::new(Counting(StageName::Assemble, later.clone())))
            .with_stage(Arc::new(Counting(StageName::Thumbnail, later.clone())));

        let (tx, rx) = mpsc::unbounded_channel();
        let outcome = pipeline.execute(prompt_request(), tx).await;

        match outcome {
            PipelineOutcome::Failed { stage, stages, .. } => {
                assert_eq!(stage, StageName::Postprocess);
                assert_eq!(stages.len(), 3);
                assert!(!stages[2].success);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(later.load(Ordering::SeqCst), 0);
        let events = drain(rx);
        assert!(events.iter().all(|e| e.progress <= 65));
    }

    #[tokio::test]
    async fn test_thumbnail_failure_is_not_fatal() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let pipeline = pipeline(store).with_stage(Arc::new(Failing(StageName::Thumbnail)));
        let (tx, _rx) = mpsc::unbounded_channel();

        match pipeline.execute(prompt_request(), tx).await {
            PipelineOutcome::Completed {
                thumbnail_ref,
                stages,
                ..
            } => {
                assert!(thumbnail_ref.is_none());
                assert!(!stages[4].success);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_timeout_is_a_stage_failure() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let pipeline = Pipeline::new(
            store.clone(),
            Arc::new(StubAdapter::new(store)),
            StageTimeouts::uniform(Duration::from_secs(5)),
            512,
        )
        .with_stage(Arc::new(Sleepy));
        let (tx, _rx) = mpsc::unbounded_channel();

        match pipeline.execute(prompt_request(), tx).await {
            PipelineOutcome::Failed { stage, error, .. } => {
                assert_eq!(stage, StageName::Inference);
                assert!(error.contains("timed out"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_object_fails_preprocess() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        store.put("uploads/other.png", Bytes::from_static(b"x")).await.unwrap();
        let request = PipelineRequest {
            input: InputRef::object("uploads/missing.png"),
            ..prompt_request()
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        match pipeline(store).execute(request, tx).await {
            PipelineOutcome::Failed { stage, .. } => assert_eq!(stage, StageName::Preprocess),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_with_stage_keeps_order() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let pipeline = pipeline(store).with_stage(Arc::new(Failing(StageName::Assemble)));
        assert_eq!(pipeline.stage_names(), StageName::ALL.to_vec());
    }
}

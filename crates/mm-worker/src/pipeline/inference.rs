//! Model inference through the configured adapter.

use std::sync::Arc;

use async_trait::async_trait;

use mm_inference::{InferenceAdapter, InferenceRequest, ProgressTx};
use mm_models::StageName;

use super::{work_prefix, PipelineStage, StageContext};
use crate::error::WorkerResult;

/// Forwards adapter progress fractions into the inference progress range.
pub struct InferenceStage {
    adapter: Arc<dyn InferenceAdapter>,
}

impl InferenceStage {
    pub fn new(adapter: Arc<dyn InferenceAdapter>) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl PipelineStage for InferenceStage {
    fn name(&self) -> StageName {
        StageName::Inference
    }

    async fn run(&self, ctx: &StageContext<'_>, input_ref: &str) -> WorkerResult<String> {
        let request = InferenceRequest {
            job_id: ctx.request.job_id.clone(),
            input_ref: input_ref.to_string(),
            prompt: ctx.request.prompt.clone(),
            style: ctx.request.style.clone(),
            seed: ctx.request.seed,
            output_prefix: work_prefix(&ctx.request.job_id),
        };

        let (tx, mut rx) = ProgressTx::channel();
        let infer = self.adapter.infer(&request, tx);
        tokio::pin!(infer);

        let output = loop {
            tokio::select! {
                result = &mut infer => break result,
                Some(fraction) = rx.recv() => ctx.report(fraction),
            }
        };
        while let Ok(fraction) = rx.try_recv() {
            ctx.report(fraction);
        }

        Ok(output?)
    }
}

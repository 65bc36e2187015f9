//! Normalise the job input into a canonical working artifact.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;

use mm_media::ArtifactKind;
use mm_models::{InputRef, StageName};

use super::{PipelineStage, StageContext};
use crate::error::{WorkerError, WorkerResult};

/// Images are re-encoded to PNG within `max_dimension`, other media is
/// copied as-is and prompt-only jobs become a JSON prompt manifest.
pub struct PreprocessStage {
    max_dimension: u32,
}

impl PreprocessStage {
    pub fn new(max_dimension: u32) -> Self {
        Self { max_dimension }
    }
}

#[async_trait]
impl PipelineStage for PreprocessStage {
    fn name(&self) -> StageName {
        StageName::Preprocess
    }

    async fn run(&self, ctx: &StageContext<'_>, _input_ref: &str) -> WorkerResult<String> {
        match &ctx.request.input {
            InputRef::Prompt { text } => {
                let manifest = json!({
                    "jobId": ctx.request.job_id,
                    "prompt": text,
                    "style": ctx.request.style,
                    "seed": ctx.request.seed,
                });
                let data = Bytes::from(serde_json::to_vec_pretty(&manifest)?);
                Ok(ctx.store.put(&ctx.work_key("prompt.json"), data).await?)
            }
            InputRef::Object { key } => {
                let data = ctx.store.get(key).await?;
                ctx.report(0.3);

                let kind = ArtifactKind::detect(&data);
                if !kind.is_image() {
                    let name = format!("input.{}", kind.extension());
                    return Ok(ctx.store.put(&ctx.work_key(&name), data).await?);
                }

                let max_dimension = self.max_dimension;
                let png = tokio::task::spawn_blocking(move || mm_media::normalize_image(&data, max_dimension))
                    .await
                    .map_err(|e| WorkerError::stage_failed("preprocess", e.to_string()))??;
                ctx.report(0.8);
                Ok(ctx.store.put(&ctx.work_key("input.png"), Bytes::from(png)).await?)
            }
        }
    }
}

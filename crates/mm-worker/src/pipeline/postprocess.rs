//! Refinement of the raw model output.

use async_trait::async_trait;
use bytes::Bytes;

use mm_media::ArtifactKind;
use mm_models::StageName;

use super::{PipelineStage, StageContext};
use crate::error::{WorkerError, WorkerResult};

/// Contrast and sharpening for image outputs; anything else passes through.
pub struct PostprocessStage;

#[async_trait]
impl PipelineStage for PostprocessStage {
    fn name(&self) -> StageName {
        StageName::Postprocess
    }

    async fn run(&self, ctx: &StageContext<'_>, input_ref: &str) -> WorkerResult<String> {
        let data = ctx.store.get(input_ref).await?;
        if !ArtifactKind::detect(&data).is_image() {
            return Ok(input_ref.to_string());
        }

        ctx.report(0.2);
        let refined = tokio::task::spawn_blocking(move || mm_media::refine_image(&data))
            .await
            .map_err(|e| WorkerError::stage_failed("postprocess", e.to_string()))??;
        Ok(ctx.store.put(&ctx.work_key("refined.png"), Bytes::from(refined)).await?)
    }
}

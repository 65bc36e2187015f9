//! Final deliverable and manifest.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde_json::json;

use mm_media::ArtifactKind;
use mm_models::StageName;

use super::{PipelineStage, StageContext};
use crate::error::WorkerResult;

/// Copies the refined artifact to `outputs/{job_id}/result.{ext}` next to a
/// `manifest.json` describing it.
pub struct AssembleStage;

#[async_trait]
impl PipelineStage for AssembleStage {
    fn name(&self) -> StageName {
        StageName::Assemble
    }

    async fn run(&self, ctx: &StageContext<'_>, input_ref: &str) -> WorkerResult<String> {
        let data = ctx.store.get(input_ref).await?;
        let kind = ArtifactKind::detect(&data);
        let size = data.len();

        let result_ref = ctx
            .store
            .put(&ctx.output_key(&format!("result.{}", kind.extension())), data)
            .await?;
        ctx.report(0.6);

        let manifest = json!({
            "jobId": ctx.request.job_id,
            "result": result_ref,
            "contentType": kind.content_type(),
            "sizeBytes": size,
            "style": ctx.request.style,
            "seed": ctx.request.seed,
            "assembledAt": Utc::now(),
        });
        ctx.store
            .put(
                &ctx.output_key("manifest.json"),
                Bytes::from(serde_json::to_vec_pretty(&manifest)?),
            )
            .await?;

        Ok(result_ref)
    }
}

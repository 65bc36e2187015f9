//! Preview image for the deliverable.

use async_trait::async_trait;
use bytes::Bytes;

use mm_media::THUMBNAIL_SIZE;
use mm_models::StageName;

use super::{PipelineStage, StageContext};
use crate::error::{WorkerError, WorkerResult};

/// JPEG thumbnail at `outputs/{job_id}/thumbnail.jpg`.
pub struct ThumbnailStage {
    size: u32,
}

impl Default for ThumbnailStage {
    fn default() -> Self {
        Self {
            size: THUMBNAIL_SIZE,
        }
    }
}

#[async_trait]
impl PipelineStage for ThumbnailStage {
    fn name(&self) -> StageName {
        StageName::Thumbnail
    }

    async fn run(&self, ctx: &StageContext<'_>, input_ref: &str) -> WorkerResult<String> {
        let data = ctx.store.get(input_ref).await?;
        let size = self.size;
        let jpeg = tokio::task::spawn_blocking(move || mm_media::thumbnail_jpeg(&data, size))
            .await
            .map_err(|e| WorkerError::stage_failed("thumbnail", e.to_string()))??;
        Ok(ctx
            .store
            .put(&ctx.output_key("thumbnail.jpg"), Bytes::from(jpeg))
            .await?)
    }
}

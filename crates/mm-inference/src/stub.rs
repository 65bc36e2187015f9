//! Deterministic passthrough adapter for development and tests.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use mm_storage::ObjectStore;

use crate::adapter::InferenceAdapter;
use crate::error::InferenceResult;
use crate::types::{InferenceRequest, ProgressTx};

/// Copies the working artifact to `{output_prefix}inference.{ext}`,
/// reporting progress in steps of 0.2.
pub struct StubAdapter {
    store: Arc<dyn ObjectStore>,
}

impl StubAdapter {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

fn extension(key: &str) -> &str {
    let name = key.rsplit('/').next().unwrap_or(key);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext,
        _ => "bin",
    }
}

#[async_trait]
impl InferenceAdapter for StubAdapter {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn infer(&self, request: &InferenceRequest, progress: ProgressTx) -> InferenceResult<String> {
        progress.report(0.0);
        let data = self.store.get(&request.input_ref).await?;
        for step in 1..=4 {
            progress.report(step as f32 * 0.2);
            tokio::task::yield_now().await;
        }
        let key = format!("{}inference.{}", request.output_prefix, extension(&request.input_ref));
        let output = self.store.put(&key, data).await?;
        progress.report(1.0);
        debug!(job_id = %request.job_id, output = %output, "Stub inference finished");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mm_models::JobId;
    use mm_storage::MemoryStore;

    #[test]
    fn test_extension() {
        assert_eq!(extension("work/a/input.png"), "png");
        assert_eq!(extension("work/a/prompt"), "bin");
        assert_eq!(extension("work/a.b/.hidden"), "bin");
    }

    #[tokio::test]
    async fn test_stub_copies_input_and_reports_monotonic_progress() {
        let store = Arc::new(MemoryStore::new());
        store.put("work/j/input.png", Bytes::from_static(b"png")).await.unwrap();
        let adapter = StubAdapter::new(store.clone());

        let (tx, mut rx) = ProgressTx::channel();
        let request = InferenceRequest {
            job_id: JobId::from("j"),
            input_ref: "work/j/input.png".into(),
            prompt: None,
            style: None,
            seed: None,
            output_prefix: "work/j/".into(),
        };
        let output = adapter.infer(&request, tx).await.unwrap();
        assert_eq!(output, "work/j/inference.png");
        assert_eq!(store.get(&output).await.unwrap(), Bytes::from_static(b"png"));

        let mut seen = Vec::new();
        while let Ok(fraction) = rx.try_recv() {
            seen.push(fraction);
        }
        assert_eq!(seen.first(), Some(&0.0));
        assert_eq!(seen.last(), Some(&1.0));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }
}

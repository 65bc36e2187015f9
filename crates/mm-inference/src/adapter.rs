//! The inference adapter seam.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use mm_storage::ObjectStore;

use crate::config::{AdapterKind, InferenceConfig};
use crate::error::InferenceResult;
use crate::http::HttpAdapter;
use crate::stub::StubAdapter;
use crate::subprocess::SubprocessAdapter;
use crate::types::{InferenceRequest, ProgressTx};

/// Runs the model for one job. The model is opaque: adapters only report
/// progress fractions and return a storage reference to the generated output.
#[async_trait]
pub trait InferenceAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn infer(&self, request: &InferenceRequest, progress: ProgressTx) -> InferenceResult<String>;

    /// Whether the runner can currently accept work.
    async fn health_check(&self) -> bool {
        true
    }
}

/// Build the adapter selected by `config`.
pub fn create_adapter(
    config: &InferenceConfig,
    store: Arc<dyn ObjectStore>,
) -> InferenceResult<Arc<dyn InferenceAdapter>> {
    let adapter: Arc<dyn InferenceAdapter> = match config.kind {
        AdapterKind::Subprocess => Arc::new(SubprocessAdapter::new(config)?),
        AdapterKind::Http => Arc::new(HttpAdapter::new(config)?),
        AdapterKind::Stub => Arc::new(StubAdapter::new(store)),
    };
    info!(adapter = adapter.name(), "Inference adapter configured");
    Ok(adapter)
}

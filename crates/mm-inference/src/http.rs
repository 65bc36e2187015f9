//! Remote inference service adapter.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use crate::adapter::InferenceAdapter;
use crate::config::InferenceConfig;
use crate::error::{InferenceError, InferenceResult};
use crate::types::{HealthResponse, InferenceRequest, InferenceResponse, ProgressTx};

/// Calls `POST {base_url}/infer` on a remote model service.
///
/// The service is synchronous from our side, so progress jumps from 0 to 1
/// when the response arrives.
pub struct HttpAdapter {
    http: Client,
    base_url: String,
    max_retries: u32,
}

impl HttpAdapter {
    pub fn new(config: &InferenceConfig) -> InferenceResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(InferenceError::Network)?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
        })
    }

    async fn post_infer(&self, request: &InferenceRequest) -> InferenceResult<InferenceResponse> {
        let url = format!("{}/infer", self.base_url);
        debug!(job_id = %request.job_id, "Sending inference request to {}", url);

        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(InferenceError::Network)?;

        let status = response.status();
        if status == StatusCode::SERVICE_UNAVAILABLE || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(InferenceError::ServiceUnavailable(format!(
                "inference service returned {}",
                status
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::request_failed(format!(
                "inference service returned {}: {}",
                status, body
            )));
        }

        let body: InferenceResponse = response.json().await?;
        if body.output_ref.trim().is_empty() {
            return Err(InferenceError::invalid_response("empty output_ref"));
        }
        Ok(body)
    }

    /// Execute with retry logic.
    async fn with_retry<F, Fut, T>(&self, operation: F) -> InferenceResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = InferenceResult<T>>,
    {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = Duration::from_millis(500 * 2u64.pow(attempt));
                    warn!(
                        "Inference request failed (attempt {}), retrying in {:?}: {}",
                        attempt + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| InferenceError::request_failed("Unknown error")))
    }
}

#[async_trait]
impl InferenceAdapter for HttpAdapter {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn infer(&self, request: &InferenceRequest, progress: ProgressTx) -> InferenceResult<String> {
        progress.report(0.0);
        let response = self.with_retry(|| self.post_infer(request)).await?;
        progress.report(1.0);
        Ok(response.output_ref)
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url);

        match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => match response.json::<HealthResponse>().await {
                Ok(health) => health.status == "healthy" || health.status == "ok",
                Err(e) => {
                    warn!("Inference health response unreadable: {}", e);
                    false
                }
            },
            Ok(response) => {
                warn!("Inference service health check failed: {}", response.status());
                false
            }
            Err(e) => {
                warn!("Inference service health check error: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mm_models::JobId;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> InferenceRequest {
        InferenceRequest {
            job_id: JobId::from("job-1"),
            input_ref: "work/job-1/input.png".into(),
            prompt: Some("a cat".into()),
            style: None,
            seed: Some(7),
            output_prefix: "work/job-1/".into(),
        }
    }

    fn adapter(server: &MockServer, max_retries: u32) -> HttpAdapter {
        HttpAdapter::new(&InferenceConfig {
            base_url: server.uri(),
            timeout: Duration::from_secs(5),
            max_retries,
            ..InferenceConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_infer_returns_output_ref() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/infer"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "output_ref": "work/job-1/inference.png" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (tx, mut rx) = ProgressTx::channel();
        let output = adapter(&server, 0).infer(&request(), tx).await.unwrap();
        assert_eq!(output, "work/job-1/inference.png");
        assert_eq!(rx.recv().await, Some(0.0));
        assert_eq!(rx.recv().await, Some(1.0));
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/infer"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad prompt"))
            .expect(1)
            .mount(&server)
            .await;

        let (tx, _rx) = ProgressTx::channel();
        let err = adapter(&server, 2).infer(&request(), tx).await.unwrap_err();
        assert!(matches!(err, InferenceError::RequestFailed(_)));
    }

    #[tokio::test]
    async fn test_unavailable_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/infer"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let (tx, _rx) = ProgressTx::channel();
        let err = adapter(&server, 1).infer(&request(), tx).await.unwrap_err();
        assert!(matches!(err, InferenceError::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_health_check() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "status": "ok" })))
            .mount(&server)
            .await;

        assert!(adapter(&server, 0).health_check().await);
    }
}

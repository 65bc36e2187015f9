//! Inference request/response types and the progress channel.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use mm_models::JobId;

/// Request handed to a model runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub job_id: JobId,
    /// Preprocessed working artifact.
    pub input_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Storage prefix the runner writes its output under.
    pub output_prefix: String,
}

/// Response from the remote inference service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub output_ref: String,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: Option<String>,
}

/// Sender half of an adapter's progress channel. Values are fractions of the
/// inference work done, in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct ProgressTx {
    tx: mpsc::UnboundedSender<f32>,
}

impl ProgressTx {
    pub fn new(tx: mpsc::UnboundedSender<f32>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<f32>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Report a fraction. Out-of-range values are clamped, NaN is ignored and
    /// a closed receiver is not an error.
    pub fn report(&self, fraction: f32) {
        if fraction.is_nan() {
            return;
        }
        let _ = self.tx.send(fraction.clamp(0.0, 1.0));
    }

    /// Report a 0-100 percentage.
    pub fn report_percent(&self, percent: u32) {
        self.report(percent as f32 / 100.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_clamps() {
        let (tx, mut rx) = ProgressTx::channel();
        tx.report(-1.0);
        tx.report(f32::NAN);
        tx.report(0.5);
        tx.report_percent(250);
        assert_eq!(rx.try_recv().unwrap(), 0.0);
        assert_eq!(rx.try_recv().unwrap(), 0.5);
        assert_eq!(rx.try_recv().unwrap(), 1.0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_report_after_receiver_dropped() {
        let (tx, rx) = ProgressTx::channel();
        drop(rx);
        tx.report(0.3);
    }
}

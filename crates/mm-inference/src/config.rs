//! Inference adapter configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Which model runner to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdapterKind {
    /// Spawn a local model process per job.
    Subprocess,
    /// Call a remote inference service.
    Http,
    /// Deterministic passthrough for development and tests.
    #[default]
    Stub,
}

impl AdapterKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "subprocess" | "process" | "local" => Some(AdapterKind::Subprocess),
            "http" | "remote" => Some(AdapterKind::Http),
            "stub" | "mock" => Some(AdapterKind::Stub),
            _ => None,
        }
    }
}

/// Configuration for inference adapters.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub kind: AdapterKind,
    /// Interpreter or binary for the subprocess adapter
    pub command: String,
    /// Script passed as first argument to `command`
    pub script: Option<PathBuf>,
    /// Base URL of the remote inference service
    pub base_url: String,
    /// Per-call timeout
    pub timeout: Duration,
    /// Max retries for the remote adapter
    pub max_retries: u32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            kind: AdapterKind::Stub,
            command: "python3".to_string(),
            script: Some(PathBuf::from("python-worker/worker_main.py")),
            base_url: "http://localhost:8001".to_string(),
            timeout: Duration::from_secs(600),
            max_retries: 2,
        }
    }
}

impl InferenceConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            kind: std::env::var("INFERENCE_ADAPTER")
                .ok()
                .and_then(|s| AdapterKind::parse(&s))
                .unwrap_or(defaults.kind),
            command: std::env::var("INFERENCE_COMMAND").unwrap_or(defaults.command),
            script: std::env::var("INFERENCE_SCRIPT")
                .ok()
                .map(|s| if s.is_empty() { None } else { Some(PathBuf::from(s)) })
                .unwrap_or(defaults.script),
            base_url: std::env::var("INFERENCE_SERVICE_URL").unwrap_or(defaults.base_url),
            timeout: Duration::from_secs(
                std::env::var("INFERENCE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(600),
            ),
            max_retries: std::env::var("INFERENCE_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_kind_parse() {
        assert_eq!(AdapterKind::parse("HTTP"), Some(AdapterKind::Http));
        assert_eq!(AdapterKind::parse(" subprocess "), Some(AdapterKind::Subprocess));
        assert_eq!(AdapterKind::parse("stub"), Some(AdapterKind::Stub));
        assert_eq!(AdapterKind::parse("gpu"), None);
    }

    #[test]
    fn test_config_defaults() {
        let config = InferenceConfig::default();
        assert_eq!(config.kind, AdapterKind::Stub);
        assert_eq!(config.timeout, Duration::from_secs(600));
    }
}

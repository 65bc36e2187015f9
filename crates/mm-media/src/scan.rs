//! Malware scan backends.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use clamav_client::Tcp;
use tracing::{debug, info, warn};

use mm_models::ScanOutcome;
use mm_storage::ObjectStore;

use crate::error::{MediaError, MediaResult};

/// Scanner configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    pub host: String,
    pub port: u16,
    /// Per-file scan timeout
    pub timeout: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3310,
            timeout: Duration::from_secs(30),
        }
    }
}

impl ScanConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("CLAMAV_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("CLAMAV_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3310),
            timeout: Duration::from_secs(
                std::env::var("CLAMAV_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A malware scanner for stored objects.
///
/// `scan` never errors: an unreachable scanner or unreadable object is a
/// [`ScanOutcome::Error`], left to the caller's failure policy.
#[async_trait]
pub trait ScanBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn is_available(&self) -> bool;

    async fn scan(&self, refs: &[String]) -> ScanOutcome;
}

/// Verdict for a single buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    Clean,
    Infected(String),
}

/// Extract the signature name from a clamd reply like
/// `stream: Eicar-Test-Signature FOUND`.
fn signature_name(reply: &[u8]) -> String {
    let text = String::from_utf8_lossy(reply);
    let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    text.split_once(':')
        .map(|(_, rest)| rest)
        .unwrap_or(text)
        .trim()
        .trim_end_matches("FOUND")
        .trim()
        .to_string()
}

/// Classify a clamd INSTREAM reply.
///
/// Only a `FOUND` reply is a detection. `ERROR` replies (size limits, broken
/// streams) and anything unrecognised are scan failures.
fn classify_reply(reply: &[u8]) -> MediaResult<Verdict> {
    let text = String::from_utf8_lossy(reply);
    let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if text.ends_with("FOUND") {
        Ok(Verdict::Infected(signature_name(reply)))
    } else if text.ends_with("ERROR") {
        Err(MediaError::scan_failed(format!("clamd error: {}", text)))
    } else if text.ends_with("OK") {
        Ok(Verdict::Clean)
    } else {
        Err(MediaError::scan_failed(format!("unexpected clamd reply: {:?}", text)))
    }
}

/// ClamAV daemon over TCP.
pub struct ClamAvScanner {
    config: ScanConfig,
    store: Arc<dyn ObjectStore>,
}

impl ClamAvScanner {
    pub fn new(config: ScanConfig, store: Arc<dyn ObjectStore>) -> Self {
        Self { config, store }
    }

    /// Scan one buffer with the sync client on the blocking pool.
    async fn scan_bytes(&self, data: Bytes) -> MediaResult<Verdict> {
        let address = self.config.address();
        let timeout = self.config.timeout;
        let task = tokio::task::spawn_blocking(move || -> MediaResult<Verdict> {
            let connection = Tcp {
                host_address: address.as_str(),
            };
            let reply = clamav_client::scan_buffer(&data, connection, None)
                .map_err(|e| MediaError::ScannerUnavailable(e.to_string()))?;
            classify_reply(&reply)
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(MediaError::Task(e.to_string())),
            Err(_) => Err(MediaError::Timeout(timeout.as_secs())),
        }
    }
}

#[async_trait]
impl ScanBackend for ClamAvScanner {
    fn name(&self) -> &'static str {
        "clamav"
    }

    async fn is_available(&self) -> bool {
        let address = self.config.address();
        let ping = tokio::task::spawn_blocking(move || {
            clamav_client::ping(Tcp {
                host_address: address.as_str(),
            })
        });
        match tokio::time::timeout(self.config.timeout, ping).await {
            Ok(Ok(Ok(reply))) => reply == clamav_client::PONG,
            Ok(Ok(Err(e))) => {
                debug!(error = %e, "ClamAV ping failed");
                false
            }
            _ => false,
        }
    }

    /// Every file is scanned even after a failure. Detections take
    /// precedence over failures.
    async fn scan(&self, refs: &[String]) -> ScanOutcome {
        let start = Instant::now();
        let mut flagged = Vec::new();
        let mut first_error = None;

        for file_ref in refs {
            let verdict = match self.store.get(file_ref).await {
                Ok(data) => self.scan_bytes(data).await,
                Err(e) => Err(MediaError::scan_failed(format!("could not read {}: {}", file_ref, e))),
            };
            match verdict {
                Ok(Verdict::Clean) => {}
                Ok(Verdict::Infected(signature)) => {
                    warn!(file = %file_ref, signature = %signature, "Malware detected");
                    flagged.push(file_ref.clone());
                }
                Err(e) => {
                    warn!(file = %file_ref, error = %e, "File could not be scanned");
                    first_error.get_or_insert_with(|| e.to_string());
                }
            }
        }

        info!(
            files = refs.len(),
            flagged = flagged.len(),
            failed = first_error.is_some(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Scan finished"
        );
        if !flagged.is_empty() {
            return ScanOutcome::Infected { flagged };
        }
        match first_error {
            Some(reason) => ScanOutcome::Error { reason },
            None => ScanOutcome::Clean,
        }
    }
}

/// Scripted backend for tests and scanner-less development.
///
/// Files whose ref contains one of `infected_markers` are flagged.
#[derive(Debug, Clone, Default)]
pub struct StaticScanner {
    pub available: bool,
    pub infected_markers: Vec<String>,
    pub error: Option<String>,
}

impl StaticScanner {
    pub fn clean() -> Self {
        Self {
            available: true,
            ..Self::default()
        }
    }

    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn flagging(marker: impl Into<String>) -> Self {
        Self {
            available: true,
            infected_markers: vec![marker.into()],
            error: None,
        }
    }
}

#[async_trait]
impl ScanBackend for StaticScanner {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn scan(&self, refs: &[String]) -> ScanOutcome {
        if !self.available {
            return ScanOutcome::Error {
                reason: "scanner unavailable".into(),
            };
        }
        if let Some(reason) = &self.error {
            return ScanOutcome::Error {
                reason: reason.clone(),
            };
        }
        let flagged: Vec<String> = refs
            .iter()
            .filter(|r| self.infected_markers.iter().any(|m| r.contains(m.as_str())))
            .cloned()
            .collect();
        if flagged.is_empty() {
            ScanOutcome::Clean
        } else {
            ScanOutcome::Infected { flagged }
        }
    }
}

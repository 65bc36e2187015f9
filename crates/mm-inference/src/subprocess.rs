//! Local model process adapter.
//!
//! The model runs as a child process that receives the request as a JSON
//! argument and reports on stdout, one directive per line:
//!
//! ```text
//! PROGRESS:40
//! OUTPUT:work/{job_id}/inference.png
//! ```

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::adapter::InferenceAdapter;
use crate::config::InferenceConfig;
use crate::error::{InferenceError, InferenceResult};
use crate::types::{InferenceRequest, ProgressTx};

const STDERR_TAIL_BYTES: usize = 2048;

/// One parsed stdout line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Directive {
    Progress(u32),
    Output(String),
}

fn parse_line(line: &str) -> Option<Directive> {
    let (key, value) = line.trim().split_once(':')?;
    let value = value.trim();
    match key.trim().to_ascii_uppercase().as_str() {
        "PROGRESS" => value.parse().ok().map(Directive::Progress),
        "OUTPUT" if !value.is_empty() => Some(Directive::Output(value.to_string())),
        _ => None,
    }
}

/// Spawns `command [args..] <request-json>` per inference call.
pub struct SubprocessAdapter {
    command: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl SubprocessAdapter {
    /// Resolve the interpreter on `PATH` up front so a missing binary is a
    /// startup error, not a per-job one.
    pub fn new(config: &InferenceConfig) -> InferenceResult<Self> {
        let command = which::which(&config.command).map_err(|e| {
            InferenceError::config(format!("model command '{}' not found: {}", config.command, e))
        })?;
        let args = config
            .script
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        Ok(Self {
            command,
            args,
            timeout: config.timeout,
        })
    }

    /// Use an explicit program and argument list.
    pub fn with_command(command: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
        }
    }

    async fn run(&self, request: &InferenceRequest, progress: &ProgressTx) -> InferenceResult<String> {
        let payload = serde_json::to_string(request)?;
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .arg(payload)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| InferenceError::request_failed("child stdout not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| InferenceError::request_failed("child stderr not captured"))?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        });

        let mut output = None;
        // Model chatter is not guaranteed to be UTF-8.
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']);
            match parse_line(line) {
                Some(Directive::Progress(percent)) => progress.report_percent(percent),
                Some(Directive::Output(path)) => output = Some(path),
                None => debug!(job_id = %request.job_id, "model: {}", line),
            }
        }

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
            return Err(InferenceError::ProcessFailed {
                code: status.code(),
                stderr: String::from_utf8_lossy(&stderr[start..]).trim().to_string(),
            });
        }

        output.ok_or_else(|| InferenceError::invalid_response("model process reported no OUTPUT line"))
    }
}

#[async_trait]
impl InferenceAdapter for SubprocessAdapter {
    fn name(&self) -> &'static str {
        "subprocess"
    }

    async fn infer(&self, request: &InferenceRequest, progress: ProgressTx) -> InferenceResult<String> {
        match tokio::time::timeout(self.timeout, self.run(request, &progress)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(job_id = %request.job_id, "Model process timed out, killing it");
                Err(InferenceError::Timeout(self.timeout.as_secs()))
            }
        }
    }

    async fn health_check(&self) -> bool {
        self.command.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mm_models::JobId;

    fn request() -> InferenceRequest {
        InferenceRequest {
            job_id: JobId::from("job-1"),
            input_ref: "work/job-1/input.png".into(),
            prompt: None,
            style: None,
            seed: None,
            output_prefix: "work/job-1/".into(),
        }
    }

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line("PROGRESS:40"), Some(Directive::Progress(40)));
        assert_eq!(parse_line("progress: 7 "), Some(Directive::Progress(7)));
        assert_eq!(
            parse_line("OUTPUT:/outputs/result.mp4"),
            Some(Directive::Output("/outputs/result.mp4".into()))
        );
        assert_eq!(parse_line("OUTPUT:"), None);
        assert_eq!(parse_line("PROGRESS:abc"), None);
        assert_eq!(parse_line("loading weights"), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_process_and_streams_progress() {
        let adapter = SubprocessAdapter::with_command(
            "sh",
            vec![
                "-c".into(),
                "echo PROGRESS:10; echo warming up; echo PROGRESS:80; echo OUTPUT:work/job-1/out.png".into(),
            ],
            Duration::from_secs(10),
        );
        let (tx, mut rx) = ProgressTx::channel();
        let output = adapter.infer(&request(), tx).await.unwrap();
        assert_eq!(output, "work/job-1/out.png");
        assert_eq!(rx.recv().await, Some(0.1));
        assert_eq!(rx.recv().await, Some(0.8));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_utf8_output_does_not_abort_the_run() {
        let adapter = SubprocessAdapter::with_command(
            "sh",
            vec![
                "-c".into(),
                r"printf '\377\376 weights\nPROGRESS:50\r\nOUTPUT:work/job-1/out.png\n'".into(),
            ],
            Duration::from_secs(10),
        );
        let (tx, mut rx) = ProgressTx::channel();
        let output = adapter.infer(&request(), tx).await.unwrap();
        assert_eq!(output, "work/job-1/out.png");
        assert_eq!(rx.recv().await, Some(0.5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_an_error() {
        let adapter = SubprocessAdapter::with_command(
            "sh",
            vec!["-c".into(), "echo out of memory >&2; exit 3".into()],
            Duration::from_secs(10),
        );
        let (tx, _rx) = ProgressTx::channel();
        match adapter.infer(&request(), tx).await.unwrap_err() {
            InferenceError::ProcessFailed { code, stderr } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "out of memory");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_output_line() {
        let adapter = SubprocessAdapter::with_command(
            "sh",
            vec!["-c".into(), "echo PROGRESS:100".into()],
            Duration::from_secs(10),
        );
        let (tx, _rx) = ProgressTx::channel();
        let err = adapter.infer(&request(), tx).await.unwrap_err();
        assert!(matches!(err, InferenceError::InvalidResponse(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout() {
        let adapter = SubprocessAdapter::with_command(
            "sh",
            vec!["-c".into(), "sleep 5".into()],
            Duration::from_millis(100),
        );
        let (tx, _rx) = ProgressTx::channel();
        let err = adapter.infer(&request(), tx).await.unwrap_err();
        assert!(matches!(err, InferenceError::Timeout(_)));
    }
}

//! Malware scan outcome and the policy applied when the scanner is unusable.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Result of scanning a job's input files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ScanOutcome {
    Clean,
    Infected { flagged: Vec<String> },
    /// Scanner unreachable or the scan could not complete.
    Error { reason: String },
}

impl ScanOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, ScanOutcome::Clean)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanOutcome::Clean => "clean",
            ScanOutcome::Infected { .. } => "infected",
            ScanOutcome::Error { .. } => "error",
        }
    }
}

/// What to do with a job when its scan ends in [`ScanOutcome::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanPolicy {
    /// Proceed unscanned and log a warning.
    #[default]
    FailOpen,
    /// Fail the job.
    FailClosed,
}

impl ScanPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanPolicy::FailOpen => "fail_open",
            ScanPolicy::FailClosed => "fail_closed",
        }
    }
}

impl FromStr for ScanPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "fail_open" | "open" | "skip" => Ok(ScanPolicy::FailOpen),
            "fail_closed" | "closed" | "strict" => Ok(ScanPolicy::FailClosed),
            other => Err(format!("unknown scan policy: {other}")),
        }
    }
}

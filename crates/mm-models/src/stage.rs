//! Pipeline stages and their progress ranges.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The fixed, ordered stages of the compute pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Preprocess,
    Inference,
    Postprocess,
    Assemble,
    Thumbnail,
}

impl StageName {
    /// Execution order.
    pub const ALL: [StageName; 5] = [
        StageName::Preprocess,
        StageName::Inference,
        StageName::Postprocess,
        StageName::Assemble,
        StageName::Thumbnail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Preprocess => "preprocess",
            StageName::Inference => "inference",
            StageName::Postprocess => "postprocess",
            StageName::Assemble => "assemble",
            StageName::Thumbnail => "thumbnail",
        }
    }

    /// Sub-range of the 0-100 progress scale owned by this stage.
    /// Ranges are disjoint apart from shared boundaries and increase with
    /// execution order.
    pub fn progress_range(&self) -> (u8, u8) {
        match self {
            StageName::Preprocess => (10, 20),
            StageName::Inference => (20, 65),
            StageName::Postprocess => (65, 75),
            StageName::Assemble => (75, 90),
            StageName::Thumbnail => (90, 100),
        }
    }

    /// Map a fraction of this stage's work onto the global progress scale.
    pub fn scale(&self, fraction: f32) -> u8 {
        let (start, end) = self.progress_range();
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        let span = f32::from(end - start);
        start + (span * fraction).floor() as u8
    }

    /// Whether a failure of this stage fails the whole job.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, StageName::Thumbnail)
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient result of one stage execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStageResult {
    pub stage: StageName,
    pub success: bool,
    /// Artifact handed to the next stage.
    pub output_ref: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl PipelineStageResult {
    pub fn succeeded(stage: StageName, output_ref: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            stage,
            success: true,
            output_ref: Some(output_ref.into()),
            error: None,
            duration_ms,
        }
    }

    pub fn failed(stage: StageName, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            stage,
            success: false,
            output_ref: None,
            error: Some(error.into()),
            duration_ms,
        }
    }
}

//! Processing stages and the per-stage outcome rows kept for status reporting.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ContextType, ProcessingStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Stage 1: metadata and frames.
    Extraction,
    /// Stage 2: one caption per stored frame.
    Captioning,
    /// Stage 3: transcript segments and object detections, in parallel.
    TranscriptionDetection,
}

impl Stage {
    pub const ORDER: [Stage; 3] = [
        Stage::Extraction,
        Stage::Captioning,
        Stage::TranscriptionDetection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extraction => "extraction",
            Stage::Captioning => "captioning",
            Stage::TranscriptionDetection => "transcription_detection",
        }
    }

    /// Status the video carries while this stage runs.
    pub fn status(&self) -> ProcessingStatus {
        match self {
            Stage::Extraction => ProcessingStatus::Extracting,
            Stage::Captioning => ProcessingStatus::Captioning,
            Stage::TranscriptionDetection => ProcessingStatus::Transcribing,
        }
    }

    pub fn context_types(&self) -> &'static [ContextType] {
        match self {
            Stage::Extraction => &[ContextType::Frame, ContextType::Metadata],
            Stage::Captioning => &[ContextType::Caption],
            Stage::TranscriptionDetection => {
                &[ContextType::TranscriptSegment, ContextType::ObjectDetection]
            }
        }
    }

    /// Types derived from this stage's output by later stages, cleared
    /// whenever this stage's output is replaced.
    pub fn invalidates(&self) -> &'static [ContextType] {
        match self {
            Stage::Extraction => &[ContextType::Caption, ContextType::ObjectDetection],
            Stage::Captioning | Stage::TranscriptionDetection => &[],
        }
    }

    /// Stages that follow this one, in order.
    pub fn following(&self) -> &'static [Stage] {
        match self {
            Stage::Extraction => &[Stage::Captioning, Stage::TranscriptionDetection],
            Stage::Captioning => &[Stage::TranscriptionDetection],
            Stage::TranscriptionDetection => &[],
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageRunStatus {
    Running,
    Succeeded,
    Partial,
    Failed,
    Cancelled,
}

impl StageRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageRunStatus::Running => "running",
            StageRunStatus::Succeeded => "succeeded",
            StageRunStatus::Partial => "partial",
            StageRunStatus::Failed => "failed",
            StageRunStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRun {
    pub video_id: String,
    pub stage: Stage,
    pub status: StageRunStatus,
    pub expected: u64,
    pub stored: u64,
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageRun {
    pub fn started(video_id: &str, stage: Stage) -> Self {
        Self {
            video_id: video_id.to_string(),
            stage,
            status: StageRunStatus::Running,
            expected: 0,
            stored: 0,
            warnings: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

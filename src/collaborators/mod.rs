//! Contracts for the external ML and LLM services the pipeline drives.
//!
//! Every collaborator is synchronous and may block for a long time, so the
//! pipeline only ever calls them through [`invoke`], which moves the call onto
//! the blocking pool and bounds it with a per-operation timeout.

use std::{fmt, path::Path, sync::Arc, time::Duration};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::db::models::DetectedObject;
use crate::error::{PipelineError, PipelineResult};

mod file_store;

pub use file_store::{LocalFileStore, VideoFileStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaboratorOp {
    ExtractFrames,
    Caption,
    Transcribe,
    DetectObjects,
    Complete,
}

impl CollaboratorOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollaboratorOp::ExtractFrames => "extract_frames",
            CollaboratorOp::Caption => "caption",
            CollaboratorOp::Transcribe => "transcribe",
            CollaboratorOp::DetectObjects => "detect_objects",
            CollaboratorOp::Complete => "complete",
        }
    }
}

impl fmt::Display for CollaboratorOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFrame {
    pub timestamp: f64,
    pub image_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub duration: f64,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionOutput {
    pub text: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptOutput {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionOutput {
    pub objects: Vec<DetectedObject>,
}

pub trait FrameExtractor: Send + Sync {
    /// Frames at `0, interval, 2 * interval, ...`, at most `max_frames`.
    fn extract(&self, video_path: &Path, interval_secs: f64, max_frames: usize) -> Result<Vec<ExtractedFrame>>;

    /// Grab a single frame; returns the stored image path.
    fn extract_at(&self, video_path: &Path, timestamp: f64) -> Result<String>;

    fn metadata(&self, video_path: &Path) -> Result<VideoMetadata>;
}

pub trait Captioner: Send + Sync {
    /// One caption per input path, index aligned.
    fn caption_batch(&self, image_paths: &[String]) -> Result<Vec<CaptionOutput>>;
}

pub trait Transcriber: Send + Sync {
    fn transcribe(&self, video_path: &Path) -> Result<Vec<TranscriptOutput>>;
}

pub trait ObjectDetector: Send + Sync {
    /// One detection result per input path, index aligned.
    fn detect_batch(&self, image_paths: &[String]) -> Result<Vec<DetectionOutput>>;
}

pub trait LanguageModel: Send + Sync {
    fn complete(
        &self,
        prompt: &str,
        system_prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String>;
}

/// Every external service the assistant talks to, built once and shared.
#[derive(Clone)]
pub struct Collaborators {
    pub frames: Arc<dyn FrameExtractor>,
    pub captioner: Arc<dyn Captioner>,
    pub transcriber: Arc<dyn Transcriber>,
    pub detector: Arc<dyn ObjectDetector>,
    pub language_model: Arc<dyn LanguageModel>,
    pub files: Arc<dyn VideoFileStore>,
}

/// Run a blocking collaborator call on the blocking pool under `budget`.
///
/// A timeout abandons the call; the worker thread finishes on its own and its
/// result is dropped.
pub async fn invoke<T, F>(op: CollaboratorOp, budget: Duration, call: F) -> PipelineResult<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let worker = tokio::task::spawn_blocking(call);
    match tokio::time::timeout(budget, worker).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(err))) => Err(PipelineError::Collaborator {
            op,
            message: format!("{err:#}"),
        }),
        Ok(Err(join_err)) => Err(PipelineError::Collaborator {
            op,
            message: format!("worker failed to join: {join_err}"),
        }),
        Err(_) => Err(PipelineError::CollaboratorTimeout { op, timeout: budget }),
    }
}

//! Time-indexed context records extracted from a video.
//!
//! The payload is a closed union over the five context types. In the
//! database the variant lives in the `context_type` column and the variant
//! body is stored as JSON in `payload_json`; `crate::validation` turns that
//! JSON back into a checked [`ContextPayload`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    Frame,
    Caption,
    TranscriptSegment,
    ObjectDetection,
    Metadata,
}

impl ContextType {
    pub const ALL: [ContextType; 5] = [
        ContextType::Frame,
        ContextType::Caption,
        ContextType::TranscriptSegment,
        ContextType::ObjectDetection,
        ContextType::Metadata,
    ];

    /// The four evidence types that count towards completeness.
    pub const EVIDENCE: [ContextType; 4] = [
        ContextType::Frame,
        ContextType::Caption,
        ContextType::TranscriptSegment,
        ContextType::ObjectDetection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextType::Frame => "frame",
            ContextType::Caption => "caption",
            ContextType::TranscriptSegment => "transcript_segment",
            ContextType::ObjectDetection => "object_detection",
            ContextType::Metadata => "metadata",
        }
    }
}

impl fmt::Display for ContextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FramePayload {
    pub image_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionPayload {
    pub text: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptPayload {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl TranscriptPayload {
    pub fn contains(&self, timestamp: f64) -> bool {
        self.start <= timestamp && timestamp <= self.end
    }

    /// Distance from `timestamp` to the segment interval; zero when inside.
    pub fn distance_to(&self, timestamp: f64) -> f64 {
        if self.contains(timestamp) {
            0.0
        } else if timestamp < self.start {
            self.start - timestamp
        } else {
            timestamp - self.end
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub class_name: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionPayload {
    pub objects: Vec<DetectedObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataPayload {
    pub duration: f64,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextPayload {
    Frame(FramePayload),
    Caption(CaptionPayload),
    TranscriptSegment(TranscriptPayload),
    ObjectDetection(DetectionPayload),
    Metadata(MetadataPayload),
}

impl ContextPayload {
    pub fn context_type(&self) -> ContextType {
        match self {
            ContextPayload::Frame(_) => ContextType::Frame,
            ContextPayload::Caption(_) => ContextType::Caption,
            ContextPayload::TranscriptSegment(_) => ContextType::TranscriptSegment,
            ContextPayload::ObjectDetection(_) => ContextType::ObjectDetection,
            ContextPayload::Metadata(_) => ContextType::Metadata,
        }
    }

    /// Serialise the variant body, without the type tag, for `payload_json`.
    pub fn to_document(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            ContextPayload::Frame(body) => serde_json::to_value(body),
            ContextPayload::Caption(body) => serde_json::to_value(body),
            ContextPayload::TranscriptSegment(body) => serde_json::to_value(body),
            ContextPayload::ObjectDetection(body) => serde_json::to_value(body),
            ContextPayload::Metadata(body) => serde_json::to_value(body),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextRecord {
    pub id: String,
    pub video_id: String,
    /// Seconds from the start of the video. Transcript segments use their start.
    pub timestamp: f64,
    pub payload: ContextPayload,
    pub created_at: DateTime<Utc>,
}

impl ContextRecord {
    pub fn new(video_id: &str, timestamp: f64, payload: ContextPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            video_id: video_id.to_string(),
            timestamp,
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn frame(video_id: &str, timestamp: f64, image_path: String) -> Self {
        Self::new(
            video_id,
            timestamp,
            ContextPayload::Frame(FramePayload {
                image_path,
                width: None,
                height: None,
            }),
        )
    }

    pub fn caption(
        video_id: &str,
        timestamp: f64,
        text: String,
        confidence: f64,
        frame_path: Option<String>,
    ) -> Self {
        Self::new(
            video_id,
            timestamp,
            ContextPayload::Caption(CaptionPayload {
                text,
                confidence,
                frame_path,
            }),
        )
    }

    pub fn transcript_segment(video_id: &str, segment: TranscriptPayload) -> Self {
        Self::new(
            video_id,
            segment.start,
            ContextPayload::TranscriptSegment(segment),
        )
    }

    pub fn context_type(&self) -> ContextType {
        self.payload.context_type()
    }

    pub fn as_frame(&self) -> Option<&FramePayload> {
        match &self.payload {
            ContextPayload::Frame(frame) => Some(frame),
            _ => None,
        }
    }

    pub fn as_caption(&self) -> Option<&CaptionPayload> {
        match &self.payload {
            ContextPayload::Caption(caption) => Some(caption),
            _ => None,
        }
    }

    pub fn as_transcript(&self) -> Option<&TranscriptPayload> {
        match &self.payload {
            ContextPayload::TranscriptSegment(segment) => Some(segment),
            _ => None,
        }
    }

    pub fn as_detection(&self) -> Option<&DetectionPayload> {
        match &self.payload {
            ContextPayload::ObjectDetection(detection) => Some(detection),
            _ => None,
        }
    }

    pub fn as_metadata(&self) -> Option<&MetadataPayload> {
        match &self.payload {
            ContextPayload::Metadata(metadata) => Some(metadata),
            _ => None,
        }
    }
}

/// Inclusive time range in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    /// `[center - window, center + window]`, clamped at zero.
    pub fn around(center: f64, window: f64) -> Self {
        let window = window.abs();
        Self {
            start: (center - window).max(0.0),
            end: center + window,
        }
    }

    pub fn contains(&self, timestamp: f64) -> bool {
        self.start <= timestamp && timestamp <= self.end
    }
}

/// Per-type record counts for one video.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextCounts {
    pub frames: u64,
    pub captions: u64,
    pub transcript_segments: u64,
    pub object_detections: u64,
    pub metadata: u64,
}

impl ContextCounts {
    pub fn get(&self, context_type: ContextType) -> u64 {
        match context_type {
            ContextType::Frame => self.frames,
            ContextType::Caption => self.captions,
            ContextType::TranscriptSegment => self.transcript_segments,
            ContextType::ObjectDetection => self.object_detections,
            ContextType::Metadata => self.metadata,
        }
    }

    pub fn set(&mut self, context_type: ContextType, count: u64) {
        match context_type {
            ContextType::Frame => self.frames = count,
            ContextType::Caption => self.captions = count,
            ContextType::TranscriptSegment => self.transcript_segments = count,
            ContextType::ObjectDetection => self.object_detections = count,
            ContextType::Metadata => self.metadata = count,
        }
    }
}

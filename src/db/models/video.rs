//! Video records and their processing status.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Extracting,
    Captioning,
    Transcribing,
    Complete,
    Error,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Extracting => "extracting",
            ProcessingStatus::Captioning => "captioning",
            ProcessingStatus::Transcribing => "transcribing",
            ProcessingStatus::Complete => "complete",
            ProcessingStatus::Error => "error",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            ProcessingStatus::Pending => 0,
            ProcessingStatus::Extracting => 1,
            ProcessingStatus::Captioning => 2,
            ProcessingStatus::Transcribing => 3,
            ProcessingStatus::Complete => 4,
            ProcessingStatus::Error => 5,
        }
    }

    /// Status only moves forward through the pipeline. `error` is reachable
    /// from anywhere and can only be left by re-entering `extracting`.
    pub fn can_transition_to(&self, next: ProcessingStatus) -> bool {
        match (self, next) {
            (_, ProcessingStatus::Error) => true,
            (ProcessingStatus::Error, ProcessingStatus::Extracting) => true,
            (ProcessingStatus::Error, _) => false,
            (current, next) => next.rank() >= current.rank(),
        }
    }

    /// True when `self` is already at or beyond `target` in pipeline order.
    pub fn has_reached(&self, target: ProcessingStatus) -> bool {
        *self != ProcessingStatus::Error && self.rank() >= target.rank()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStatus::Complete | ProcessingStatus::Error)
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    pub id: String,
    pub filename: String,
    pub storage_path: String,
    /// Seconds; zero until Stage 1 has read the container metadata.
    pub duration_secs: f64,
    pub uploaded_at: DateTime<Utc>,
    pub status: ProcessingStatus,
    pub thumbnail_path: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Video {
    pub fn new(id: String, filename: String, storage_path: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            filename,
            storage_path,
            duration_secs: 0.0,
            uploaded_at: now,
            status: ProcessingStatus::Pending,
            thumbnail_path: None,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ProcessingStatus::*;

    #[test]
    fn status_moves_forward_only() {
        assert!(Pending.can_transition_to(Extracting));
        assert!(Extracting.can_transition_to(Transcribing));
        assert!(Captioning.can_transition_to(Captioning));
        assert!(!Transcribing.can_transition_to(Captioning));
        assert!(!Complete.can_transition_to(Pending));
    }

    #[test]
    fn error_is_reachable_and_only_left_through_extracting() {
        assert!(Captioning.can_transition_to(Error));
        assert!(Complete.can_transition_to(Error));
        assert!(Error.can_transition_to(Extracting));
        assert!(!Error.can_transition_to(Complete));
        assert!(!Error.has_reached(Pending));
    }
}

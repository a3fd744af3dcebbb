//! Cross-checks of stored record counts for one video.
//!
//! The auditor only reports. Excess captions are flagged as critical but never
//! deleted here; cleanup goes through a stage rerun.

use serde::{Deserialize, Serialize};

use crate::db::{ContextCounts, ContextType, Database};
use crate::error::{PipelineError, PipelineResult};

pub const NO_CAPTIONS: &str = "frames extracted but no captions generated";
pub const EXCESS_CAPTIONS: &str = "more captions than frames: possible duplicate insert";
pub const NO_FRAMES: &str = "no frames extracted";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletenessReport {
    pub video_id: String,
    pub counts: ContextCounts,
    pub critical_issues: Vec<String>,
    pub warnings: Vec<String>,
    /// Share of the four evidence types with at least one record.
    pub score: f64,
    pub complete: bool,
    pub ready_for_chat: bool,
}

impl CompletenessReport {
    pub fn has_critical_issues(&self) -> bool {
        !self.critical_issues.is_empty()
    }
}

/// Build a report from counts alone.
pub fn assess(video_id: &str, counts: ContextCounts) -> CompletenessReport {
    let mut critical_issues = Vec::new();
    let mut warnings = Vec::new();

    if counts.frames == 0 {
        critical_issues.push(NO_FRAMES.to_string());
    } else {
        if counts.captions == 0 {
            critical_issues.push(NO_CAPTIONS.to_string());
        }
        if counts.transcript_segments == 0 {
            warnings.push("no transcript segments stored".to_string());
        }
        if counts.object_detections == 0 {
            warnings.push("no object detections stored".to_string());
        }
    }
    if counts.captions > counts.frames {
        critical_issues.push(format!(
            "{EXCESS_CAPTIONS} ({} captions, {} frames)",
            counts.captions, counts.frames
        ));
    }

    let present = ContextType::EVIDENCE
        .iter()
        .filter(|context_type| counts.get(**context_type) > 0)
        .count();
    let score = present as f64 / ContextType::EVIDENCE.len() as f64;

    CompletenessReport {
        video_id: video_id.to_string(),
        counts,
        complete: critical_issues.is_empty() && counts.frames > 0,
        ready_for_chat: counts.frames > 0,
        critical_issues,
        warnings,
        score,
    }
}

#[derive(Clone)]
pub struct ConsistencyAuditor {
    db: Database,
}

impl ConsistencyAuditor {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn check_completeness(&self, video_id: &str) -> PipelineResult<CompletenessReport> {
        let counts = self.db.count_context_by_type(video_id).await?;
        Ok(assess(video_id, counts))
    }

    /// Fail only on critical issues; warnings pass through in the report.
    pub async fn verify_or_raise(&self, video_id: &str) -> PipelineResult<CompletenessReport> {
        let report = self.check_completeness(video_id).await?;
        if report.has_critical_issues() {
            return Err(PipelineError::Consistency {
                video_id: video_id.to_string(),
                issues: report.critical_issues.clone(),
            });
        }
        Ok(report)
    }
}

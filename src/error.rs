//! Error taxonomy shared by the store, pipeline, retrieval and chat layers.
//!
//! Database plumbing works in `anyhow` internally; everything that crosses a
//! component boundary is converted into [`PipelineError`].

use std::time::Duration;

use thiserror::Error;

use crate::collaborators::CollaboratorOp;
use crate::db::ProcessingStatus;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// A single rule violation found while validating a record.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("{operation} failed after {attempts} attempt(s): {message}")]
    Persistence {
        operation: String,
        attempts: u32,
        message: String,
    },

    #[error("consistency check failed for video {video_id}: {}", issues.join("; "))]
    Consistency {
        video_id: String,
        issues: Vec<String>,
    },

    #[error("{op} timed out after {timeout:?}")]
    CollaboratorTimeout { op: CollaboratorOp, timeout: Duration },

    #[error("{op} failed: {message}")]
    Collaborator { op: CollaboratorOp, message: String },

    #[error("frame extraction produced no frames for video {video_id}: {reason}")]
    ExtractionFailed { video_id: String, reason: String },

    #[error("video {video_id} cannot move from {from} to {to}")]
    StatusRegression {
        video_id: String,
        from: ProcessingStatus,
        to: ProcessingStatus,
    },

    #[error("{message}")]
    Query {
        message: String,
        suggestion: Option<String>,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("processing cancelled for video {0}")]
    Cancelled(String),
}

impl PipelineError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn query(message: impl Into<String>, suggestion: Option<String>) -> Self {
        Self::Query {
            message: message.into(),
            suggestion,
        }
    }

    pub fn persistence(operation: impl Into<String>, attempts: u32, err: &anyhow::Error) -> Self {
        Self::Persistence {
            operation: operation.into(),
            attempts,
            message: format!("{err:#}"),
        }
    }

    /// Converts an error raised inside a database task.
    ///
    /// Validation and pipeline errors raised by the task keep their kind; any
    /// other failure becomes [`PipelineError::Persistence`].
    pub fn from_store(operation: &str, attempts: u32, err: anyhow::Error) -> Self {
        let err = match err.downcast::<ValidationError>() {
            Ok(validation) => return Self::Validation(validation),
            Err(err) => err,
        };
        match err.downcast::<PipelineError>() {
            Ok(pipeline) => pipeline,
            Err(err) => Self::persistence(operation, attempts, &err),
        }
    }

    /// Stage-local failures degrade a stage; they never abort sibling stages.
    pub fn is_stage_local(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::Persistence { .. }
                | Self::CollaboratorTimeout { .. }
                | Self::Collaborator { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_keep_validation_kind() {
        let raised = anyhow::Error::new(ValidationError::new("confidence", "must be within [0, 1]"));
        let converted = PipelineError::from_store("insert_context_record", 1, raised);
        assert!(matches!(converted, PipelineError::Validation(ref v) if v.field == "confidence"));
    }

    #[test]
    fn store_errors_keep_pipeline_kind_through_context() {
        let raised = anyhow::Error::new(PipelineError::not_found("video", "abc"))
            .context("while updating status");
        let converted = PipelineError::from_store("update_video_status", 1, raised);
        assert!(matches!(converted, PipelineError::NotFound { entity: "video", .. }));
    }

    #[test]
    fn other_store_errors_become_persistence() {
        let raised = anyhow::anyhow!("disk I/O error");
        let converted = PipelineError::from_store("insert_context_record", 3, raised);
        match converted {
            PipelineError::Persistence {
                operation,
                attempts,
                message,
            } => {
                assert_eq!(operation, "insert_context_record");
                assert_eq!(attempts, 3);
                assert!(message.contains("disk I/O"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}

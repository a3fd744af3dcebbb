use std::convert::TryFrom;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};

use crate::db::models::{
    ContextType, ProcessingStatus, Stage, StageRunStatus, TurnRole,
};

pub fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

pub fn to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("{field} contains negative value {value}"))
}

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

pub fn parse_optional_datetime(
    value: Option<String>,
    field: &str,
) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(raw) => parse_datetime(&raw, field).map(Some),
        None => Ok(None),
    }
}

pub fn parse_processing_status(value: &str) -> Result<ProcessingStatus> {
    match value {
        "pending" => Ok(ProcessingStatus::Pending),
        "extracting" => Ok(ProcessingStatus::Extracting),
        "captioning" => Ok(ProcessingStatus::Captioning),
        "transcribing" => Ok(ProcessingStatus::Transcribing),
        "complete" => Ok(ProcessingStatus::Complete),
        "error" => Ok(ProcessingStatus::Error),
        other => Err(anyhow!("unknown processing status {other}")),
    }
}

pub fn parse_context_type(value: &str) -> Result<ContextType> {
    ContextType::ALL
        .into_iter()
        .find(|candidate| candidate.as_str() == value)
        .ok_or_else(|| anyhow!("unknown context type {value}"))
}

pub fn parse_turn_role(value: &str) -> Result<TurnRole> {
    match value {
        "user" => Ok(TurnRole::User),
        "assistant" => Ok(TurnRole::Assistant),
        other => Err(anyhow!("unknown turn role {other}")),
    }
}

pub fn parse_stage(value: &str) -> Result<Stage> {
    Stage::ORDER
        .into_iter()
        .find(|candidate| candidate.as_str() == value)
        .ok_or_else(|| anyhow!("unknown stage {value}"))
}

pub fn parse_stage_run_status(value: &str) -> Result<StageRunStatus> {
    match value {
        "running" => Ok(StageRunStatus::Running),
        "succeeded" => Ok(StageRunStatus::Succeeded),
        "partial" => Ok(StageRunStatus::Partial),
        "failed" => Ok(StageRunStatus::Failed),
        "cancelled" => Ok(StageRunStatus::Cancelled),
        other => Err(anyhow!("unknown stage run status {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_columns_round_trip_through_as_str() {
        for context_type in ContextType::ALL {
            assert_eq!(parse_context_type(context_type.as_str()).unwrap(), context_type);
        }
        for stage in Stage::ORDER {
            assert_eq!(parse_stage(stage.as_str()).unwrap(), stage);
        }
        assert!(parse_processing_status("stalled").is_err());
    }

    #[test]
    fn negative_counts_are_rejected() {
        assert!(to_u64(-1, "stored_count").is_err());
        assert_eq!(to_u64(7, "stored_count").unwrap(), 7);
    }
}

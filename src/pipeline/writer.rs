//! Atomic per-stage writes with post-commit count verification.

use std::collections::BTreeMap;

use crate::db::{ContextRecord, ContextType, Database};
use crate::error::PipelineResult;
use crate::utils::format_timestamp;
use crate::validation::validate_record;
use crate::{log_debug, log_warn};

const ENABLE_LOGS: bool = true;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteOutcome {
    /// Records that passed validation and were handed to the store.
    pub expected: u64,
    /// Records the store reports after commit.
    pub stored: u64,
    /// Records dropped because they failed validation.
    pub rejected: u64,
    pub warnings: Vec<String>,
}

/// Replace every record of `types` for the video with `records`.
///
/// Invalid records are dropped with a warning before the write. The clear and
/// the inserts share one transaction, so readers see either the old set or
/// the new one. After commit the stored counts are checked; a mismatch is
/// retried once and then reported as a warning.
pub async fn write_stage(
    db: &Database,
    video_id: &str,
    stage_label: &str,
    types: &[ContextType],
    records: Vec<ContextRecord>,
) -> PipelineResult<WriteOutcome> {
    let mut outcome = WriteOutcome::default();
    let mut accepted = Vec::with_capacity(records.len());

    for record in records {
        let context_type = record.context_type();
        let timestamp = record.timestamp;
        match validate_record(record) {
            Ok(record) => accepted.push(record),
            Err(err) => {
                let warning = format!(
                    "dropped {context_type} at {}: {err}",
                    format_timestamp(timestamp.max(0.0))
                );
                log_warn!("[{stage_label}] video {video_id}: {warning}");
                outcome.rejected += 1;
                outcome.warnings.push(warning);
            }
        }
    }

    let mut expected_by_type: BTreeMap<ContextType, u64> =
        types.iter().map(|context_type| (*context_type, 0)).collect();
    for record in &accepted {
        *expected_by_type.entry(record.context_type()).or_insert(0) += 1;
    }
    outcome.expected = accepted.len() as u64;

    let mut shortfall = Vec::new();
    for attempt in 1..=2 {
        replace_records(db, video_id, types, &accepted).await?;
        shortfall = verify_counts(db, video_id, &expected_by_type).await?;
        if shortfall.is_empty() {
            break;
        }
        if attempt == 1 {
            log_warn!(
                "[{stage_label}] video {video_id}: stored counts did not match, rewriting once"
            );
        }
    }

    let mut stored = 0;
    for context_type in expected_by_type.keys() {
        stored += db.count_context(video_id, *context_type).await?;
    }
    outcome.stored = stored;

    for (context_type, expected, actual) in shortfall {
        let warning = format!("stored {actual} of {expected} {context_type} records");
        log_warn!("[{stage_label}] video {video_id}: {warning}");
        outcome.warnings.push(warning);
    }

    log_debug!(
        "[{stage_label}] video {video_id}: wrote {} records ({} rejected)",
        outcome.stored,
        outcome.rejected
    );
    Ok(outcome)
}

async fn replace_records(
    db: &Database,
    video_id: &str,
    types: &[ContextType],
    records: &[ContextRecord],
) -> PipelineResult<()> {
    let video_id = video_id.to_string();
    let types = types.to_vec();
    let records = records.to_vec();
    db.transaction("write_stage", move |tx| {
        tx.delete_context(&video_id, &types)?;
        for record in &records {
            tx.insert_context_record(record.clone())?;
        }
        Ok(())
    })
    .await
}

async fn verify_counts(
    db: &Database,
    video_id: &str,
    expected_by_type: &BTreeMap<ContextType, u64>,
) -> PipelineResult<Vec<(ContextType, u64, u64)>> {
    let mut shortfall = Vec::new();
    for (context_type, expected) in expected_by_type {
        let actual = db.count_context(video_id, *context_type).await?;
        if actual != *expected {
            shortfall.push((*context_type, *expected, actual));
        }
    }
    Ok(shortfall)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::db::Video;

    async fn seeded() -> Database {
        let db = Database::in_memory().unwrap();
        db.upsert_video(&Video::new(
            "v1".into(),
            "clip.mp4".into(),
            "/tmp/clip.mp4".into(),
            Utc::now(),
        ))
        .await
        .unwrap();
        db
    }

    fn captions(count: usize) -> Vec<ContextRecord> {
        (0..count)
            .map(|index| {
                ContextRecord::caption("v1", index as f64 * 5.0, format!("scene {index}"), 0.8, None)
            })
            .collect()
    }

    #[tokio::test]
    async fn invalid_items_are_dropped_with_warning() {
        let db = seeded().await;
        let mut batch = captions(3);
        batch.push(ContextRecord::caption("v1", 15.0, "   ".into(), 0.8, None));

        let outcome = write_stage(&db, "v1", "captioning", &[ContextType::Caption], batch)
            .await
            .unwrap();
        assert_eq!(outcome.expected, 3);
        assert_eq!(outcome.stored, 3);
        assert_eq!(outcome.rejected, 1);
        assert!(outcome.warnings[0].contains("0:15"));
    }

    #[tokio::test]
    async fn rerunning_replaces_instead_of_appending() {
        let db = seeded().await;
        for _ in 0..2 {
            let outcome = write_stage(&db, "v1", "captioning", &[ContextType::Caption], captions(4))
                .await
                .unwrap();
            assert!(outcome.warnings.is_empty());
        }
        assert_eq!(db.count_context("v1", ContextType::Caption).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn empty_write_clears_the_stage_types_only() {
        let db = seeded().await;
        db.insert_context_record(ContextRecord::frame("v1", 0.0, "/f0.jpg".into()))
            .await
            .unwrap();
        write_stage(&db, "v1", "captioning", &[ContextType::Caption], captions(2))
            .await
            .unwrap();

        let outcome = write_stage(&db, "v1", "captioning", &[ContextType::Caption], Vec::new())
            .await
            .unwrap();
        assert_eq!(outcome.stored, 0);
        assert_eq!(db.count_context("v1", ContextType::Frame).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn short_count_is_rewritten_once_then_reported() {
        let db = seeded().await;
        // Swallow captions from 0:05 on and log every attempt that reaches them.
        db.execute(|conn| {
            conn.execute_batch(
                "CREATE TABLE lost_writes (timestamp REAL NOT NULL);
                 CREATE TRIGGER lose_late_captions AFTER INSERT ON context_records
                 WHEN NEW.context_type = 'caption' AND NEW.timestamp >= 5
                 BEGIN
                     INSERT INTO lost_writes (timestamp) VALUES (NEW.timestamp);
                     DELETE FROM context_records WHERE id = NEW.id;
                 END;",
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let outcome = write_stage(&db, "v1", "captioning", &[ContextType::Caption], captions(2))
            .await
            .unwrap();
        assert_eq!(outcome.expected, 2);
        assert_eq!(outcome.stored, 1);
        assert_eq!(outcome.warnings, vec!["stored 1 of 2 caption records".to_string()]);

        let attempts: i64 = db
            .execute(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM lost_writes", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(attempts, 2);
    }
}

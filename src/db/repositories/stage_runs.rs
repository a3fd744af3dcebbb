use anyhow::{Context, Result};
use rusqlite::params;
use serde_json::{from_str, to_string};

use crate::db::{
    connection::Database,
    helpers::{parse_datetime, parse_optional_datetime, parse_stage, parse_stage_run_status, to_i64, to_u64},
    models::{Stage, StageRun},
};
use crate::error::PipelineResult;

struct StageRunRow {
    video_id: String,
    stage: String,
    status: String,
    expected_count: i64,
    stored_count: i64,
    warnings_json: String,
    started_at: String,
    finished_at: Option<String>,
}

fn into_stage_run(row: StageRunRow) -> Result<StageRun> {
    let warnings: Vec<String> =
        from_str(&row.warnings_json).context("failed to decode stage warnings")?;
    Ok(StageRun {
        stage: parse_stage(&row.stage)?,
        status: parse_stage_run_status(&row.status)?,
        expected: to_u64(row.expected_count, "expected_count")?,
        stored: to_u64(row.stored_count, "stored_count")?,
        warnings,
        started_at: parse_datetime(&row.started_at, "started_at")?,
        finished_at: parse_optional_datetime(row.finished_at, "finished_at")?,
        video_id: row.video_id,
    })
}

impl Database {
    /// Insert or replace the row for this (video, stage) pair.
    pub async fn record_stage_run(&self, run: &StageRun) -> PipelineResult<()> {
        let run = run.clone();
        self.execute_write("record_stage_run", move |conn| {
            let warnings_json = to_string(&run.warnings).context("failed to encode stage warnings")?;
            conn.execute(
                "INSERT INTO stage_runs (
                    video_id,
                    stage,
                    status,
                    expected_count,
                    stored_count,
                    warnings_json,
                    started_at,
                    finished_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(video_id, stage) DO UPDATE SET
                    status = excluded.status,
                    expected_count = excluded.expected_count,
                    stored_count = excluded.stored_count,
                    warnings_json = excluded.warnings_json,
                    started_at = excluded.started_at,
                    finished_at = excluded.finished_at",
                params![
                    run.video_id,
                    run.stage.as_str(),
                    run.status.as_str(),
                    to_i64(run.expected)?,
                    to_i64(run.stored)?,
                    warnings_json,
                    run.started_at.to_rfc3339(),
                    run.finished_at.map(|at| at.to_rfc3339()),
                ],
            )
            .context("failed to record stage run")?;
            Ok(())
        })
        .await
    }

    /// Stage rows for a video in pipeline order.
    pub async fn get_stage_runs(&self, video_id: &str) -> PipelineResult<Vec<StageRun>> {
        let video_id = video_id.to_string();
        self.read("get_stage_runs", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT
                    video_id,
                    stage,
                    status,
                    expected_count,
                    stored_count,
                    warnings_json,
                    started_at,
                    finished_at
                FROM stage_runs
                WHERE video_id = ?1",
            )?;
            let rows = stmt.query_map(params![video_id], |row| {
                Ok(StageRunRow {
                    video_id: row.get(0)?,
                    stage: row.get(1)?,
                    status: row.get(2)?,
                    expected_count: row.get(3)?,
                    stored_count: row.get(4)?,
                    warnings_json: row.get(5)?,
                    started_at: row.get(6)?,
                    finished_at: row.get(7)?,
                })
            })?;

            let mut runs = Vec::new();
            for row in rows {
                runs.push(into_stage_run(row?)?);
            }
            runs.sort_by_key(|run| Stage::ORDER.iter().position(|stage| *stage == run.stage));
            Ok(runs)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::db::models::{StageRunStatus, Video};

    #[tokio::test]
    async fn stage_run_upsert_replaces_previous_attempt() {
        let db = Database::in_memory().unwrap();
        db.upsert_video(&Video::new(
            "v1".into(),
            "clip.mp4".into(),
            "/tmp/clip.mp4".into(),
            Utc::now(),
        ))
        .await
        .unwrap();

        let mut captioning = StageRun::started("v1", Stage::Captioning);
        db.record_stage_run(&captioning).await.unwrap();
        db.record_stage_run(&StageRun::started("v1", Stage::Extraction))
            .await
            .unwrap();

        captioning.status = StageRunStatus::Partial;
        captioning.expected = 12;
        captioning.stored = 10;
        captioning.warnings.push("2 captions failed validation".into());
        captioning.finished_at = Some(Utc::now());
        db.record_stage_run(&captioning).await.unwrap();

        let runs = db.get_stage_runs("v1").await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].stage, Stage::Extraction);
        assert_eq!(runs[1].status, StageRunStatus::Partial);
        assert_eq!(runs[1].stored, 10);
        assert_eq!(runs[1].warnings.len(), 1);
    }
}

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::{
    connection::Database,
    helpers::{parse_datetime, parse_processing_status},
    models::{ProcessingStatus, Video},
};
use crate::error::{PipelineError, PipelineResult};

const VIDEO_COLUMNS: &str = "id, filename, storage_path, duration_secs, uploaded_at, status, thumbnail_path, updated_at";

struct VideoRow {
    id: String,
    filename: String,
    storage_path: String,
    duration_secs: f64,
    uploaded_at: String,
    status: String,
    thumbnail_path: Option<String>,
    updated_at: String,
}

fn read_video_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VideoRow> {
    Ok(VideoRow {
        id: row.get(0)?,
        filename: row.get(1)?,
        storage_path: row.get(2)?,
        duration_secs: row.get(3)?,
        uploaded_at: row.get(4)?,
        status: row.get(5)?,
        thumbnail_path: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn into_video(row: VideoRow) -> Result<Video> {
    Ok(Video {
        uploaded_at: parse_datetime(&row.uploaded_at, "uploaded_at")?,
        updated_at: parse_datetime(&row.updated_at, "updated_at")?,
        status: parse_processing_status(&row.status)?,
        id: row.id,
        filename: row.filename,
        storage_path: row.storage_path,
        duration_secs: row.duration_secs,
        thumbnail_path: row.thumbnail_path,
    })
}

fn load_video(conn: &Connection, video_id: &str) -> Result<Option<Video>> {
    let row = conn
        .query_row(
            &format!("SELECT {VIDEO_COLUMNS} FROM videos WHERE id = ?1"),
            params![video_id],
            read_video_row,
        )
        .optional()
        .context("failed to load video")?;
    row.map(into_video).transpose()
}

fn current_status(conn: &Connection, video_id: &str) -> Result<ProcessingStatus> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM videos WHERE id = ?1",
            params![video_id],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read video status")?;
    match raw {
        Some(raw) => parse_processing_status(&raw),
        None => Err(PipelineError::not_found("video", video_id).into()),
    }
}

fn write_status(conn: &Connection, video_id: &str, status: ProcessingStatus) -> Result<()> {
    conn.execute(
        "UPDATE videos SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), Utc::now().to_rfc3339(), video_id],
    )
    .context("failed to update video status")?;
    Ok(())
}

impl Database {
    /// Insert a video or refresh its descriptive columns.
    ///
    /// An existing row keeps its status; only the orchestrator moves status.
    pub async fn upsert_video(&self, video: &Video) -> PipelineResult<()> {
        let video = video.clone();
        self.execute_write("upsert_video", move |conn| {
            conn.execute(
                "INSERT INTO videos (
                    id,
                    filename,
                    storage_path,
                    duration_secs,
                    uploaded_at,
                    status,
                    thumbnail_path,
                    updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(id) DO UPDATE SET
                    filename = excluded.filename,
                    storage_path = excluded.storage_path,
                    duration_secs = excluded.duration_secs,
                    thumbnail_path = COALESCE(excluded.thumbnail_path, videos.thumbnail_path),
                    updated_at = excluded.updated_at",
                params![
                    video.id,
                    video.filename,
                    video.storage_path,
                    video.duration_secs,
                    video.uploaded_at.to_rfc3339(),
                    video.status.as_str(),
                    video.thumbnail_path,
                    video.updated_at.to_rfc3339(),
                ],
            )
            .context("failed to upsert video")?;
            Ok(())
        })
        .await
    }

    pub async fn get_video(&self, video_id: &str) -> PipelineResult<Option<Video>> {
        let video_id = video_id.to_string();
        self.read("get_video", move |conn| load_video(conn, &video_id))
            .await
    }

    /// Like [`Database::get_video`] but a missing row is an error.
    pub async fn require_video(&self, video_id: &str) -> PipelineResult<Video> {
        self.get_video(video_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("video", video_id))
    }

    /// Move a video to `next`, rejecting any backwards step.
    pub async fn update_video_status(
        &self,
        video_id: &str,
        next: ProcessingStatus,
    ) -> PipelineResult<()> {
        let video_id = video_id.to_string();
        self.execute_write("update_video_status", move |conn| {
            let current = current_status(conn, &video_id)?;
            if !current.can_transition_to(next) {
                return Err(PipelineError::StatusRegression {
                    video_id: video_id.clone(),
                    from: current,
                    to: next,
                }
                .into());
            }
            write_status(conn, &video_id, next)
        })
        .await
    }

    /// Move a video towards `target` unless it is already there or further.
    ///
    /// Returns the status the video holds afterwards. A video in `error` only
    /// leaves it when `target` is `extracting`.
    pub async fn advance_video_status(
        &self,
        video_id: &str,
        target: ProcessingStatus,
    ) -> PipelineResult<ProcessingStatus> {
        let video_id = video_id.to_string();
        self.execute_write("advance_video_status", move |conn| {
            let current = current_status(conn, &video_id)?;
            if current.has_reached(target) || !current.can_transition_to(target) {
                return Ok(current);
            }
            write_status(conn, &video_id, target)?;
            Ok(target)
        })
        .await
    }

    pub async fn set_video_duration(&self, video_id: &str, duration_secs: f64) -> PipelineResult<()> {
        let video_id = video_id.to_string();
        self.execute_write("set_video_duration", move |conn| {
            let updated = conn
                .execute(
                    "UPDATE videos SET duration_secs = ?1, updated_at = ?2 WHERE id = ?3",
                    params![duration_secs, Utc::now().to_rfc3339(), video_id],
                )
                .context("failed to set video duration")?;
            if updated == 0 {
                return Err(PipelineError::not_found("video", video_id.clone()).into());
            }
            Ok(())
        })
        .await
    }

    pub async fn set_thumbnail(&self, video_id: &str, thumbnail_path: &str) -> PipelineResult<()> {
        let video_id = video_id.to_string();
        let thumbnail_path = thumbnail_path.to_string();
        self.execute_write("set_thumbnail", move |conn| {
            let updated = conn
                .execute(
                    "UPDATE videos SET thumbnail_path = ?1, updated_at = ?2 WHERE id = ?3",
                    params![thumbnail_path, Utc::now().to_rfc3339(), video_id],
                )
                .context("failed to set thumbnail")?;
            if updated == 0 {
                return Err(PipelineError::not_found("video", video_id.clone()).into());
            }
            Ok(())
        })
        .await
    }

    /// Videos whose status is one of `statuses`, oldest upload first.
    pub async fn list_videos_with_status(
        &self,
        statuses: &[ProcessingStatus],
    ) -> PipelineResult<Vec<Video>> {
        let wanted: Vec<&'static str> = statuses.iter().map(ProcessingStatus::as_str).collect();
        self.read("list_videos_with_status", move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {VIDEO_COLUMNS} FROM videos ORDER BY uploaded_at ASC, rowid ASC"
            ))?;
            let rows = stmt.query_map([], read_video_row)?;

            let mut videos = Vec::new();
            for row in rows {
                let row = row?;
                if wanted.contains(&row.status.as_str()) {
                    videos.push(into_video(row)?);
                }
            }
            Ok(videos)
        })
        .await
    }

    /// Delete a video and, through the foreign keys, everything keyed to it.
    pub async fn delete_video(&self, video_id: &str) -> PipelineResult<bool> {
        let video_id = video_id.to_string();
        self.execute_write("delete_video", move |conn| {
            let deleted = conn
                .execute("DELETE FROM videos WHERE id = ?1", params![video_id])
                .context("failed to delete video")?;
            Ok(deleted > 0)
        })
        .await
    }
}

use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection};
use serde_json::{from_str, to_string};

use crate::db::{
    connection::{Database, StoreTx},
    helpers::{parse_context_type, parse_datetime, to_u64},
    models::{ContextCounts, ContextRecord, ContextType, TimeRange},
};
use crate::error::PipelineResult;
use crate::validation::{validate_document, validate_record};

struct ContextRow {
    id: String,
    video_id: String,
    context_type: String,
    timestamp: f64,
    payload_json: String,
    created_at: String,
}

fn read_context_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContextRow> {
    Ok(ContextRow {
        id: row.get(0)?,
        video_id: row.get(1)?,
        context_type: row.get(2)?,
        timestamp: row.get(3)?,
        payload_json: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Decode a stored row, re-checking the payload against its type tag.
fn into_record(row: ContextRow) -> Result<ContextRecord> {
    let context_type = parse_context_type(&row.context_type)?;
    let document: serde_json::Value = from_str(&row.payload_json)
        .with_context(|| format!("context record {} has malformed payload_json", row.id))?;
    let payload = validate_document(context_type, &document)
        .with_context(|| format!("context record {} failed validation on read", row.id))?;

    Ok(ContextRecord {
        created_at: parse_datetime(&row.created_at, "created_at")?,
        id: row.id,
        video_id: row.video_id,
        timestamp: row.timestamp,
        payload,
    })
}

/// Validate and insert one record. Returns the normalised record.
fn insert_record(conn: &Connection, record: ContextRecord) -> Result<ContextRecord> {
    let record = validate_record(record)?;
    let payload_json = to_string(
        &record
            .payload
            .to_document()
            .context("failed to serialize context payload")?,
    )
    .context("failed to encode context payload")?;

    conn.execute(
        "INSERT INTO context_records (
            id,
            video_id,
            context_type,
            timestamp,
            payload_json,
            created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record.id,
            record.video_id,
            record.context_type().as_str(),
            record.timestamp,
            payload_json,
            record.created_at.to_rfc3339(),
        ],
    )
    .context("failed to insert context record")?;

    Ok(record)
}

fn delete_types(conn: &Connection, video_id: &str, types: &[ContextType]) -> Result<u64> {
    let mut removed = 0;
    for context_type in types {
        removed += conn
            .execute(
                "DELETE FROM context_records WHERE video_id = ?1 AND context_type = ?2",
                params![video_id, context_type.as_str()],
            )
            .with_context(|| format!("failed to clear {context_type} records"))? as u64;
    }
    Ok(removed)
}

fn count_type(conn: &Connection, video_id: &str, context_type: ContextType) -> Result<u64> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM context_records WHERE video_id = ?1 AND context_type = ?2",
            params![video_id, context_type.as_str()],
            |row| row.get(0),
        )
        .context("failed to count context records")?;
    to_u64(count, "count")
}

impl StoreTx<'_> {
    /// Validate and insert inside the surrounding transaction. A validation
    /// failure aborts the closure and rolls back everything written so far.
    pub fn insert_context_record(&mut self, record: ContextRecord) -> Result<ContextRecord> {
        insert_record(self.connection(), record)
    }

    pub fn delete_context(&mut self, video_id: &str, types: &[ContextType]) -> Result<u64> {
        delete_types(self.connection(), video_id, types)
    }

    pub fn count_context(&self, video_id: &str, context_type: ContextType) -> Result<u64> {
        count_type(self.connection(), video_id, context_type)
    }
}

impl Database {
    pub async fn insert_context_record(&self, record: ContextRecord) -> PipelineResult<ContextRecord> {
        let record = validate_record(record)?;
        self.execute_write("insert_context_record", move |conn| {
            insert_record(conn, record.clone())
        })
        .await
    }

    /// Insert a batch atomically; one invalid record rejects the whole batch.
    pub async fn insert_context_records(&self, records: Vec<ContextRecord>) -> PipelineResult<usize> {
        self.transaction("insert_context_records", move |tx| {
            for record in &records {
                tx.insert_context_record(record.clone())?;
            }
            Ok(records.len())
        })
        .await
    }

    pub async fn delete_context(&self, video_id: &str, types: &[ContextType]) -> PipelineResult<u64> {
        let video_id = video_id.to_string();
        let types = types.to_vec();
        self.execute_write("delete_context", move |conn| {
            delete_types(conn, &video_id, &types)
        })
        .await
    }

    /// Records for a video in ascending timestamp order, insertion order on ties.
    ///
    /// `context_type` is an exact filter and `range` is inclusive at both ends.
    pub async fn query_context(
        &self,
        video_id: &str,
        context_type: Option<ContextType>,
        range: Option<TimeRange>,
    ) -> PipelineResult<Vec<ContextRecord>> {
        let video_id = video_id.to_string();
        self.read("query_context", move |conn| {
            let mut sql = String::from(
                "SELECT id, video_id, context_type, timestamp, payload_json, created_at
                FROM context_records
                WHERE video_id = ?",
            );
            let mut bindings = vec![SqlValue::Text(video_id)];

            if let Some(context_type) = context_type {
                sql.push_str(" AND context_type = ?");
                bindings.push(SqlValue::Text(context_type.as_str().to_string()));
            }
            if let Some(range) = range {
                sql.push_str(" AND timestamp >= ? AND timestamp <= ?");
                bindings.push(SqlValue::Real(range.start));
                bindings.push(SqlValue::Real(range.end));
            }
            sql.push_str(" ORDER BY timestamp ASC, rowid ASC");

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(bindings), read_context_row)?;

            let mut records = Vec::new();
            for row in rows {
                records.push(into_record(row?)?);
            }
            Ok(records)
        })
        .await
    }

    pub async fn count_context(&self, video_id: &str, context_type: ContextType) -> PipelineResult<u64> {
        let video_id = video_id.to_string();
        self.read("count_context", move |conn| {
            count_type(conn, &video_id, context_type)
        })
        .await
    }

    pub async fn count_context_by_type(&self, video_id: &str) -> PipelineResult<ContextCounts> {
        let video_id = video_id.to_string();
        self.read("count_context_by_type", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT context_type, COUNT(*)
                FROM context_records
                WHERE video_id = ?1
                GROUP BY context_type",
            )?;
            let rows = stmt.query_map(params![video_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;

            let mut counts = ContextCounts::default();
            for row in rows {
                let (raw_type, count) = row?;
                counts.set(parse_context_type(&raw_type)?, to_u64(count, "count")?);
            }
            Ok(counts)
        })
        .await
    }

    /// Lowercased class names seen in any detection for the video, sorted.
    pub async fn distinct_object_classes(&self, video_id: &str) -> PipelineResult<Vec<String>> {
        let video_id = video_id.to_string();
        self.read("distinct_object_classes", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT lower(json_extract(object.value, '$.class_name')) AS class_name
                FROM context_records AS record, json_each(record.payload_json, '$.objects') AS object
                WHERE record.video_id = ?1
                    AND record.context_type = 'object_detection'
                    AND json_extract(object.value, '$.class_name') IS NOT NULL
                ORDER BY class_name ASC",
            )?;
            let rows = stmt.query_map(params![video_id], |row| row.get::<_, String>(0))?;

            let mut classes = Vec::new();
            for row in rows {
                classes.push(row?);
            }
            Ok(classes)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::db::models::{
        CaptionPayload, ContextPayload, DetectedObject, DetectionPayload, Video,
    };
    use crate::error::PipelineError;

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

    fn detection(timestamp: f64, classes: &[&str]) -> ContextRecord {
        ContextRecord::new(
            "v1",
            timestamp,
            ContextPayload::ObjectDetection(DetectionPayload {
                objects: classes
                    .iter()
                    .map(|name| DetectedObject {
                        class_name: name.to_string(),
                        confidence: 0.8,
                        bbox: None,
                    })
                    .collect(),
                image_path: None,
            }),
        )
    }

    #[tokio::test]
    async fn query_orders_by_timestamp_and_filters_range() {
        let db = seeded().await;
        for timestamp in [10.0, 0.0, 5.0, 15.0] {
            db.insert_context_record(ContextRecord::frame("v1", timestamp, format!("/f{timestamp}.jpg")))
                .await
                .unwrap();
        }

        let all = db
            .query_context("v1", Some(ContextType::Frame), None)
            .await
            .unwrap();
        let stamps: Vec<f64> = all.iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, vec![0.0, 5.0, 10.0, 15.0]);

        let windowed = db
            .query_context("v1", None, Some(TimeRange::new(5.0, 10.0)))
            .await
            .unwrap();
        assert_eq!(windowed.len(), 2);
    }

    #[tokio::test]
    async fn invalid_record_in_batch_persists_nothing() {
        let db = seeded().await;
        let batch = vec![
            ContextRecord::caption("v1", 0.0, "a dog".into(), 0.9, None),
            ContextRecord::new(
                "v1",
                5.0,
                ContextPayload::Caption(CaptionPayload {
                    text: "a cat".into(),
                    confidence: 1.5,
                    frame_path: None,
                }),
            ),
        ];

        let err = db.insert_context_records(batch).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(ref v) if v.field == "confidence"));
        assert_eq!(db.count_context("v1", ContextType::Caption).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn counts_by_type_and_clears_selected_types() {
        let db = seeded().await;
        db.insert_context_records(vec![
            ContextRecord::frame("v1", 0.0, "/f0.jpg".into()),
            ContextRecord::frame("v1", 5.0, "/f5.jpg".into()),
            ContextRecord::caption("v1", 0.0, "a dog".into(), 0.9, None),
        ])
        .await
        .unwrap();

        let counts = db.count_context_by_type("v1").await.unwrap();
        assert_eq!(counts.frames, 2);
        assert_eq!(counts.captions, 1);

        let removed = db.delete_context("v1", &[ContextType::Caption]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(db.count_context("v1", ContextType::Frame).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn distinct_classes_are_lowercased() {
        let db = seeded().await;
        db.insert_context_records(vec![
            detection(0.0, &["Dog", "person"]),
            detection(5.0, &["dog"]),
        ])
        .await
        .unwrap();

        let classes = db.distinct_object_classes("v1").await.unwrap();
        assert_eq!(classes, vec!["dog".to_string(), "person".to_string()]);
    }

    #[tokio::test]
    async fn deleting_video_cascades_to_records() {
        let db = seeded().await;
        db.insert_context_record(ContextRecord::frame("v1", 0.0, "/f0.jpg".into()))
            .await
            .unwrap();
        db.delete_video("v1").await.unwrap();
        assert_eq!(db.count_context("v1", ContextType::Frame).await.unwrap(), 0);
    }
}

//! Query-time assembly of ranked, time-ordered evidence for one video.

pub mod config;
pub mod scoring;

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::db::{
    ContextRecord, ContextType, ConversationTurn, Database, MetadataPayload, TimeRange,
    TranscriptPayload, Video,
};
use crate::error::{PipelineError, PipelineResult};
use crate::utils::format_timestamp;

pub use config::RetrievalConfig;
use scoring::{normalize_phrase, score_caption, tokenize};

/// Timestamps closer than this are the same sampled instant.
const TIMESTAMP_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptionHit {
    pub timestamp: f64,
    pub text: String,
    pub confidence: f64,
    pub frame_path: Option<String>,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSighting {
    pub timestamp: f64,
    pub class_name: String,
    pub confidence: f64,
    pub image_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimestampContext {
    pub timestamp: f64,
    pub window: f64,
    /// Every record inside `[timestamp - window, timestamp + window]`.
    pub records: Vec<ContextRecord>,
    /// Segment containing the timestamp, else the nearest one.
    pub segment: Option<TranscriptPayload>,
}

/// Everything stored for a video, split by type, plus recent memory.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoContext {
    pub video: Video,
    pub metadata: Option<MetadataPayload>,
    pub frames: Vec<ContextRecord>,
    pub captions: Vec<ContextRecord>,
    pub transcripts: Vec<ContextRecord>,
    pub detections: Vec<ContextRecord>,
    pub recent_turns: Vec<ConversationTurn>,
}

impl VideoContext {
    pub fn has_evidence(&self) -> bool {
        !(self.frames.is_empty()
            && self.captions.is_empty()
            && self.transcripts.is_empty()
            && self.detections.is_empty())
    }
}

#[derive(Clone)]
pub struct ContextRetriever {
    db: Database,
    config: RetrievalConfig,
}

impl ContextRetriever {
    pub fn new(db: Database, config: RetrievalConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Rank captions against `query`. Equal caption texts collapse into their
    /// best hit; ties on score go to the earlier timestamp.
    pub async fn search_captions(
        &self,
        video_id: &str,
        query: &str,
        top_k: usize,
    ) -> PipelineResult<Vec<CaptionHit>> {
        let captions = self
            .db
            .query_context(video_id, Some(ContextType::Caption), None)
            .await?;

        let mut best: HashMap<String, CaptionHit> = HashMap::new();
        for record in &captions {
            let Some(caption) = record.as_caption() else {
                continue;
            };
            let score = score_caption(query, &caption.text, caption.confidence, &self.config);
            if !score.is_match() {
                continue;
            }

            let hit = CaptionHit {
                timestamp: record.timestamp,
                text: caption.text.clone(),
                confidence: caption.confidence,
                frame_path: caption.frame_path.clone(),
                score: score.total,
            };
            // Records arrive in timestamp order, so only a strictly better
            // score replaces the earlier duplicate.
            best.entry(normalize_phrase(&caption.text))
                .and_modify(|existing| {
                    if hit.score > existing.score {
                        *existing = hit.clone();
                    }
                })
                .or_insert(hit);
        }

        let mut hits: Vec<CaptionHit> = best.into_values().collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.timestamp.total_cmp(&b.timestamp))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    /// Segments whose text contains `query`, case-insensitively, in time order.
    pub async fn search_transcripts(
        &self,
        video_id: &str,
        query: &str,
    ) -> PipelineResult<Vec<TranscriptPayload>> {
        let needle = normalize_phrase(query);
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let segments = self.transcripts(video_id).await?;
        Ok(segments
            .into_iter()
            .filter(|segment| normalize_phrase(&segment.text).contains(&needle))
            .collect())
    }

    /// Segments sharing at least one keyword with `query`, in time order,
    /// capped at `max_transcript_hits`.
    pub async fn search_transcripts_by_keywords(
        &self,
        video_id: &str,
        query: &str,
    ) -> PipelineResult<Vec<TranscriptPayload>> {
        let keywords: HashSet<String> = tokenize(query).into_iter().collect();
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        let segments = self.transcripts(video_id).await?;
        Ok(segments
            .into_iter()
            .filter(|segment| tokenize(&segment.text).iter().any(|token| keywords.contains(token)))
            .take(self.config.max_transcript_hits)
            .collect())
    }

    /// Detected objects whose class name matches `class_name` in either
    /// direction ("dog" finds "hot dog", "dogs" finds "dog").
    pub async fn find_object_sightings(
        &self,
        video_id: &str,
        class_name: &str,
    ) -> PipelineResult<Vec<ObjectSighting>> {
        let wanted = class_name.trim().to_lowercase();
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let detections = self
            .db
            .query_context(video_id, Some(ContextType::ObjectDetection), None)
            .await?;

        let mut sightings = Vec::new();
        for record in &detections {
            let Some(detection) = record.as_detection() else {
                continue;
            };
            for object in &detection.objects {
                let class = object.class_name.to_lowercase();
                if class.contains(&wanted) || wanted.contains(&class) {
                    sightings.push(ObjectSighting {
                        timestamp: record.timestamp,
                        class_name: object.class_name.clone(),
                        confidence: object.confidence,
                        image_path: detection.image_path.clone(),
                    });
                }
            }
        }
        Ok(sightings)
    }

    /// Frame records at the timestamps where `class_name` was detected.
    pub async fn get_frames_with_object(
        &self,
        video_id: &str,
        class_name: &str,
    ) -> PipelineResult<Vec<ContextRecord>> {
        let sightings = self.find_object_sightings(video_id, class_name).await?;
        if sightings.is_empty() {
            return Ok(Vec::new());
        }

        let frames = self
            .db
            .query_context(video_id, Some(ContextType::Frame), None)
            .await?;
        Ok(frames
            .into_iter()
            .filter(|frame| {
                sightings
                    .iter()
                    .any(|sighting| (sighting.timestamp - frame.timestamp).abs() < TIMESTAMP_EPSILON)
            })
            .collect())
    }

    /// Records within `window` seconds of `timestamp`, plus the transcript
    /// segment covering it (or the nearest one).
    pub async fn get_context_at_timestamp(
        &self,
        video_id: &str,
        timestamp: f64,
        window: Option<f64>,
    ) -> PipelineResult<TimestampContext> {
        if !timestamp.is_finite() || timestamp < 0.0 {
            return Err(PipelineError::query(
                format!("{timestamp} is not a valid position in the video"),
                Some("use a time such as 0:45 or 1:02:03".into()),
            ));
        }

        let video = self.db.require_video(video_id).await?;
        if video.duration_secs > 0.0 && timestamp > video.duration_secs {
            let last = format_timestamp(video.duration_secs);
            return Err(PipelineError::query(
                format!(
                    "{} is past the end of the video, which is {last} long",
                    format_timestamp(timestamp)
                ),
                Some(format!("the nearest valid time is {last}")),
            ));
        }

        let window = window.unwrap_or(self.config.default_window_secs).abs();
        let records = self
            .db
            .query_context(video_id, None, Some(TimeRange::around(timestamp, window)))
            .await?;

        let segment = self
            .transcripts(video_id)
            .await?
            .into_iter()
            .fold(None::<TranscriptPayload>, |nearest, segment| match nearest {
                Some(current) if current.distance_to(timestamp) <= segment.distance_to(timestamp) => {
                    Some(current)
                }
                _ => Some(segment),
            });

        Ok(TimestampContext {
            timestamp,
            window,
            records,
            segment,
        })
    }

    pub async fn build_video_context(
        &self,
        video_id: &str,
        history_limit: usize,
    ) -> PipelineResult<VideoContext> {
        let video = self.db.require_video(video_id).await?;
        let records = self.db.query_context(video_id, None, None).await?;
        let recent_turns = self.db.get_recent_turns(video_id, history_limit).await?;

        let mut context = VideoContext {
            video,
            metadata: None,
            frames: Vec::new(),
            captions: Vec::new(),
            transcripts: Vec::new(),
            detections: Vec::new(),
            recent_turns,
        };
        for record in records {
            match record.context_type() {
                ContextType::Frame => context.frames.push(record),
                ContextType::Caption => context.captions.push(record),
                ContextType::TranscriptSegment => context.transcripts.push(record),
                ContextType::ObjectDetection => context.detections.push(record),
                ContextType::Metadata => context.metadata = record.as_metadata().cloned(),
            }
        }
        Ok(context)
    }

    pub async fn available_object_classes(&self, video_id: &str) -> PipelineResult<Vec<String>> {
        self.db.distinct_object_classes(video_id).await
    }

    async fn transcripts(&self, video_id: &str) -> PipelineResult<Vec<TranscriptPayload>> {
        let records = self
            .db
            .query_context(video_id, Some(ContextType::TranscriptSegment), None)
            .await?;
        Ok(records
            .into_iter()
            .filter_map(|record| record.as_transcript().cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::db::{ContextPayload, DetectedObject, DetectionPayload};

    async fn seeded(duration: f64) -> (Database, ContextRetriever) {
        let db = Database::in_memory().unwrap();
        let mut video = Video::new("v1".into(), "clip.mp4".into(), "/tmp/clip.mp4".into(), Utc::now());
        video.duration_secs = duration;
        db.upsert_video(&video).await.unwrap();
        let retriever = ContextRetriever::new(db.clone(), RetrievalConfig::default());
        (db, retriever)
    }

    fn segment(start: f64, end: f64, text: &str) -> ContextRecord {
        ContextRecord::transcript_segment(
            "v1",
            TranscriptPayload {
                start,
                end,
                text: text.into(),
                confidence: None,
            },
        )
    }

    #[tokio::test]
    async fn caption_ranking_prefers_exact_phrase_and_dedupes() {
        let (db, retriever) = seeded(60.0).await;
        db.insert_context_records(vec![
            ContextRecord::caption("v1", 0.0, "a dog sleeping".into(), 0.95, None),
            ContextRecord::caption("v1", 5.0, "a dog running in a park".into(), 0.6, None),
            ContextRecord::caption("v1", 10.0, "people running".into(), 0.9, None),
            ContextRecord::caption("v1", 15.0, "a red car".into(), 0.99, None),
            ContextRecord::caption("v1", 20.0, "A dog running in a park".into(), 0.6, None),
        ])
        .await
        .unwrap();

        let hits = retriever.search_captions("v1", "dog running", 3).await.unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].text, "a dog running in a park");
        assert_eq!(hits[0].timestamp, 5.0);
        assert!(hits.iter().all(|hit| hit.text != "a red car"));
    }

    #[tokio::test]
    async fn window_query_is_inclusive() {
        let (db, retriever) = seeded(60.0).await;
        db.insert_context_records(
            [0.0, 5.0, 10.0, 15.0, 20.0]
                .into_iter()
                .map(|t| ContextRecord::frame("v1", t, format!("/f{t}.jpg")))
                .collect(),
        )
        .await
        .unwrap();

        let context = retriever
            .get_context_at_timestamp("v1", 10.0, Some(5.0))
            .await
            .unwrap();
        let stamps: Vec<f64> = context.records.iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, vec![5.0, 10.0, 15.0]);
    }

    #[tokio::test]
    async fn timestamp_lookup_finds_containing_segment() {
        let (db, retriever) = seeded(60.0).await;
        db.insert_context_records(vec![
            segment(30.0, 38.0, "intro music"),
            segment(40.0, 50.0, "hello world"),
        ])
        .await
        .unwrap();

        let context = retriever
            .get_context_at_timestamp("v1", 45.0, None)
            .await
            .unwrap();
        assert_eq!(context.segment.unwrap().text, "hello world");

        let nearest = retriever
            .get_context_at_timestamp("v1", 55.0, Some(1.0))
            .await
            .unwrap();
        assert_eq!(nearest.segment.unwrap().text, "hello world");
    }

    #[tokio::test]
    async fn timestamp_past_the_end_is_a_query_error() {
        let (_db, retriever) = seeded(60.0).await;
        let err = retriever
            .get_context_at_timestamp("v1", 90.0, None)
            .await
            .unwrap_err();
        match err {
            PipelineError::Query { suggestion, .. } => {
                assert!(suggestion.unwrap().contains("1:00"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn object_lookup_matches_partially_and_returns_frames() {
        let (db, retriever) = seeded(60.0).await;
        db.insert_context_records(vec![
            ContextRecord::frame("v1", 0.0, "/f0.jpg".into()),
            ContextRecord::frame("v1", 5.0, "/f5.jpg".into()),
            ContextRecord::new(
                "v1",
                5.0,
                ContextPayload::ObjectDetection(DetectionPayload {
                    objects: vec![
                        DetectedObject {
                            class_name: "dog".into(),
                            confidence: 0.9,
                            bbox: None,
                        },
                        DetectedObject {
                            class_name: "hot dog".into(),
                            confidence: 0.4,
                            bbox: None,
                        },
                    ],
                    image_path: Some("/f5.jpg".into()),
                }),
            ),
        ])
        .await
        .unwrap();

        let frames = retriever.get_frames_with_object("v1", "Dogs").await.unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].timestamp, 5.0);

        let sightings = retriever.find_object_sightings("v1", "dog").await.unwrap();
        assert_eq!(sightings.len(), 2);
        assert!(retriever.get_frames_with_object("v1", "cat").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transcript_search_is_case_insensitive() {
        let (db, retriever) = seeded(60.0).await;
        db.insert_context_records(vec![
            segment(0.0, 4.0, "Welcome to the Kitchen"),
            segment(4.0, 9.0, "today we bake bread"),
        ])
        .await
        .unwrap();

        let hits = retriever.search_transcripts("v1", "the kitchen").await.unwrap();
        assert_eq!(hits.len(), 1);
        let keyword_hits = retriever
            .search_transcripts_by_keywords("v1", "what bread did they bake?")
            .await
            .unwrap();
        assert_eq!(keyword_hits[0].start, 4.0);
    }
}

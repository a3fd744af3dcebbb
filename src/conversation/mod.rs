//! Turns a user message into a grounded reply.
//!
//! Flow per message: classify intent, pull matching evidence, fall back to an
//! overview when nothing matches, ask the language model, then store the
//! exchange in conversation memory.

pub mod intent;
pub mod prompt;
pub mod suggestions;

use std::{sync::Arc, time::Duration};

use serde::Serialize;

use crate::collaborators::{invoke, CollaboratorOp, LanguageModel};
use crate::config::ConversationSettings;
use crate::db::{ConversationTurn, Database, ProcessingStatus, Video};
use crate::error::{PipelineError, PipelineResult};
use crate::retrieval::{CaptionHit, ContextRetriever, ObjectSighting, TimestampContext};
use crate::{log_info, log_warn};

pub use intent::{classify, parse_timestamp, QueryIntent};
pub use prompt::{build_prompt, render_context, Evidence};
pub use suggestions::follow_up_suggestions;

use intent::topic_terms;

const ENABLE_LOGS: bool = true;

/// Object classes listed in an overview, at most.
const OVERVIEW_CLASSES: usize = 5;
/// Bare frame timestamps listed in an overview, at most.
const OVERVIEW_FRAMES: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub message_text: String,
    pub frame_refs: Vec<String>,
    pub timestamps: Vec<f64>,
    pub suggestions: Vec<String>,
    pub intent: QueryIntent,
    /// True when the reply was not built from evidence matching the question.
    pub fallback: bool,
}

#[derive(Clone)]
pub struct ConversationOrchestrator {
    db: Database,
    retriever: ContextRetriever,
    language_model: Arc<dyn LanguageModel>,
    settings: ConversationSettings,
    completion_timeout: Duration,
}

impl ConversationOrchestrator {
    pub fn new(
        db: Database,
        retriever: ContextRetriever,
        language_model: Arc<dyn LanguageModel>,
        settings: ConversationSettings,
        completion_timeout: Duration,
    ) -> Self {
        Self {
            db,
            retriever,
            language_model,
            settings,
            completion_timeout,
        }
    }

    pub async fn chat(&self, message: &str, video_id: &str) -> PipelineResult<ChatResponse> {
        let video = self.db.require_video(video_id).await?;
        let question = message.trim();
        let known_classes = self.retriever.available_object_classes(video_id).await?;
        let intent = classify(question, &known_classes);

        if question.is_empty() {
            return Ok(query_reply(
                intent,
                "Please ask a question about the video, for example: what happens at 0:30?",
                None,
                &known_classes,
            ));
        }

        let history = self
            .db
            .get_recent_turns(video_id, self.settings.history_limit)
            .await?;

        log_info!("video {video_id}: chat intent {}", intent.as_str());
        let response = match self.gather(video_id, question, &intent).await {
            Ok(evidence) => {
                self.answer(&video, question, intent, evidence, &history, &known_classes)
                    .await?
            }
            Err(PipelineError::Query {
                message,
                suggestion,
            }) => query_reply(intent, &message, suggestion.as_deref(), &known_classes),
            Err(err) => return Err(err),
        };

        self.db
            .insert_exchange(
                &ConversationTurn::user(video_id, question),
                &ConversationTurn::assistant(video_id, response.message_text.clone()),
            )
            .await?;
        Ok(response)
    }

    pub async fn reset_memory(&self, video_id: &str) -> PipelineResult<u64> {
        let removed = self.db.delete_turns(video_id).await?;
        log_info!("video {video_id}: cleared {removed} conversation turns");
        Ok(removed)
    }

    async fn gather(
        &self,
        video_id: &str,
        question: &str,
        intent: &QueryIntent,
    ) -> PipelineResult<Evidence> {
        let top_k = self.retriever.config().default_top_k;
        let mut evidence = Evidence::default();

        match intent {
            QueryIntent::Visual => {
                evidence.captions = self.retriever.search_captions(video_id, question, top_k).await?;
            }
            QueryIntent::Audio => {
                let topic = topic_terms(question).join(" ");
                if topic.is_empty() {
                    evidence.transcripts = self.overview(video_id).await?.transcripts;
                } else {
                    evidence.transcripts = self.retriever.search_transcripts(video_id, &topic).await?;
                    if evidence.transcripts.is_empty() {
                        evidence.transcripts = self
                            .retriever
                            .search_transcripts_by_keywords(video_id, &topic)
                            .await?;
                    }
                }
            }
            QueryIntent::Object { class_name } => {
                evidence.objects = self
                    .retriever
                    .find_object_sightings(video_id, class_name)
                    .await?;
                evidence.frames = self
                    .retriever
                    .get_frames_with_object(video_id, class_name)
                    .await?
                    .iter()
                    .filter_map(|record| {
                        record
                            .as_frame()
                            .map(|frame| (record.timestamp, frame.image_path.clone()))
                    })
                    .collect();
            }
            QueryIntent::Temporal { timestamp } => {
                let moment = self
                    .retriever
                    .get_context_at_timestamp(video_id, *timestamp, None)
                    .await?;
                evidence = evidence_at(&moment);
            }
            QueryIntent::General => {
                evidence.captions = self.retriever.search_captions(video_id, question, top_k).await?;
                evidence.transcripts = self
                    .retriever
                    .search_transcripts_by_keywords(video_id, &topic_terms(question).join(" "))
                    .await?;
            }
        }

        Ok(evidence)
    }

    async fn answer(
        &self,
        video: &Video,
        question: &str,
        intent: QueryIntent,
        evidence: Evidence,
        history: &[ConversationTurn],
        known_classes: &[String],
    ) -> PipelineResult<ChatResponse> {
        let (evidence, notice, mut fallback) = if evidence.is_empty() {
            let notice = missing_notice(video, &intent);
            log_info!("video {}: no {} evidence, answering from overview", video.id, intent.as_str());
            (self.overview(&video.id).await?, Some(notice), true)
        } else {
            (evidence, None, false)
        };

        let message_text = if evidence.is_empty() {
            notice.clone().unwrap_or_default()
        } else {
            let context = render_context(&evidence, self.settings.max_context_chars);
            let prompt = build_prompt(question, &context, history, notice.as_deref());
            match self.complete(prompt).await {
                Ok(answer) => with_notice(notice.as_deref(), answer.trim()),
                Err(err) => {
                    log_warn!("video {}: language model unavailable, replying with digest: {err}", video.id);
                    fallback = true;
                    let digest = evidence.digest(self.settings.max_context_chars);
                    with_notice(
                        notice.as_deref(),
                        &format!("I couldn't generate a full answer right now. Here is what the video data shows:\n{digest}"),
                    )
                }
            }
        };

        let suggestions = follow_up_suggestions(&intent, &evidence, known_classes);
        Ok(ChatResponse {
            message_text,
            frame_refs: evidence.frame_refs(),
            timestamps: evidence.timestamps(),
            suggestions,
            intent,
            fallback,
        })
    }

    async fn complete(&self, prompt: String) -> PipelineResult<String> {
        let model = self.language_model.clone();
        let system_prompt = self.settings.system_prompt.clone();
        let temperature = self.settings.temperature;
        let max_tokens = self.settings.max_tokens;
        let answer = invoke(CollaboratorOp::Complete, self.completion_timeout, move || {
            model.complete(&prompt, &system_prompt, temperature, max_tokens)
        })
        .await?;

        if answer.trim().is_empty() {
            return Err(PipelineError::Collaborator {
                op: CollaboratorOp::Complete,
                message: "empty completion".into(),
            });
        }
        Ok(answer)
    }

    /// A little of everything that exists, for questions with no direct match.
    async fn overview(&self, video_id: &str) -> PipelineResult<Evidence> {
        let context = self.retriever.build_video_context(video_id, 0).await?;
        let config = self.retriever.config();

        let captions = context
            .captions
            .iter()
            .filter_map(|record| {
                record.as_caption().map(|caption| CaptionHit {
                    timestamp: record.timestamp,
                    text: caption.text.clone(),
                    confidence: caption.confidence,
                    frame_path: caption.frame_path.clone(),
                    score: 0.0,
                })
            })
            .take(config.default_top_k)
            .collect();

        let transcripts = context
            .transcripts
            .iter()
            .filter_map(|record| record.as_transcript().cloned())
            .take(config.max_transcript_hits)
            .collect();

        let mut objects: Vec<ObjectSighting> = Vec::new();
        for record in &context.detections {
            let Some(detection) = record.as_detection() else {
                continue;
            };
            for object in &detection.objects {
                if objects.len() >= OVERVIEW_CLASSES
                    || objects.iter().any(|seen| seen.class_name == object.class_name)
                {
                    continue;
                }
                objects.push(ObjectSighting {
                    timestamp: record.timestamp,
                    class_name: object.class_name.clone(),
                    confidence: object.confidence,
                    image_path: detection.image_path.clone(),
                });
            }
        }

        let frames = if context.captions.is_empty() {
            context
                .frames
                .iter()
                .filter_map(|record| {
                    record
                        .as_frame()
                        .map(|frame| (record.timestamp, frame.image_path.clone()))
                })
                .take(OVERVIEW_FRAMES)
                .collect()
        } else {
            Vec::new()
        };

        Ok(Evidence {
            captions,
            transcripts,
            objects,
            frames,
        })
    }
}

/// Split the records around a timestamp into evidence sections.
fn evidence_at(moment: &TimestampContext) -> Evidence {
    let mut evidence = Evidence::default();
    for record in &moment.records {
        if let Some(caption) = record.as_caption() {
            evidence.captions.push(CaptionHit {
                timestamp: record.timestamp,
                text: caption.text.clone(),
                confidence: caption.confidence,
                frame_path: caption.frame_path.clone(),
                score: 1.0,
            });
        } else if let Some(segment) = record.as_transcript() {
            evidence.transcripts.push(segment.clone());
        } else if let Some(detection) = record.as_detection() {
            evidence
                .objects
                .extend(detection.objects.iter().map(|object| ObjectSighting {
                    timestamp: record.timestamp,
                    class_name: object.class_name.clone(),
                    confidence: object.confidence,
                    image_path: detection.image_path.clone(),
                }));
        } else if let Some(frame) = record.as_frame() {
            evidence.frames.push((record.timestamp, frame.image_path.clone()));
        }
    }

    if let Some(segment) = &moment.segment {
        let known = evidence
            .transcripts
            .iter()
            .any(|existing| existing.start == segment.start && existing.text == segment.text);
        if !known {
            evidence.transcripts.push(segment.clone());
            evidence
                .transcripts
                .sort_by(|a, b| a.start.total_cmp(&b.start));
        }
    }
    evidence
}

fn missing_notice(video: &Video, intent: &QueryIntent) -> String {
    let kind = match intent {
        QueryIntent::Visual => "scene descriptions".to_string(),
        QueryIntent::Audio => "transcript segments".to_string(),
        QueryIntent::Object { class_name } => format!("detections of \"{class_name}\""),
        QueryIntent::Temporal { .. } => "details for that moment".to_string(),
        QueryIntent::General => "details".to_string(),
    };
    match video.status {
        ProcessingStatus::Complete => {
            format!("No {kind} related to your question are available for this video.")
        }
        ProcessingStatus::Error => {
            format!("Processing failed for this video, so {kind} are not available.")
        }
        status => format!(
            "This video is still being processed (currently {status}), so {kind} may not be available yet."
        ),
    }
}

fn with_notice(notice: Option<&str>, body: &str) -> String {
    match notice {
        Some(notice) => format!("{notice}\n\n{body}"),
        None => body.to_string(),
    }
}

/// `message (suggestion).` with the inner punctuation trimmed.
fn with_suggestion(message: &str, suggestion: Option<&str>) -> String {
    let Some(suggestion) = suggestion else {
        return message.to_string();
    };
    let message = message.trim_end_matches('.');
    let suggestion = suggestion.trim_end_matches(['.', '?', '!']);
    format!("{message} ({suggestion}).")
}

fn query_reply(
    intent: QueryIntent,
    message: &str,
    suggestion: Option<&str>,
    known_classes: &[String],
) -> ChatResponse {
    ChatResponse {
        message_text: with_suggestion(message, suggestion),
        frame_refs: Vec::new(),
        timestamps: Vec::new(),
        suggestions: follow_up_suggestions(&intent, &Evidence::default(), known_classes),
        intent,
        fallback: true,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::db::{ContextRecord, TranscriptPayload};
    use crate::retrieval::TimestampContext;

    #[test]
    fn notice_depends_on_processing_status() {
        let mut video = Video::new("v1".into(), "a.mp4".into(), "/a.mp4".into(), Utc::now());
        video.status = ProcessingStatus::Captioning;
        let notice = missing_notice(&video, &QueryIntent::Audio);
        assert!(notice.contains("still being processed"));

        video.status = ProcessingStatus::Complete;
        let notice = missing_notice(&video, &QueryIntent::Audio);
        assert!(notice.starts_with("No transcript segments"));
    }

    #[test]
    fn moment_evidence_includes_nearest_segment_once() {
        let segment = TranscriptPayload {
            start: 40.0,
            end: 50.0,
            text: "hello world".into(),
            confidence: None,
        };
        let moment = TimestampContext {
            timestamp: 45.0,
            window: 5.0,
            records: vec![
                ContextRecord::frame("v1", 45.0, "/f45.jpg".into()),
                ContextRecord::transcript_segment("v1", segment.clone()),
            ],
            segment: Some(segment),
        };
        let evidence = evidence_at(&moment);
        assert_eq!(evidence.transcripts.len(), 1);
        assert_eq!(evidence.frames.len(), 1);
    }

    #[test]
    fn query_errors_become_replies() {
        let reply = query_reply(
            QueryIntent::Temporal { timestamp: 90.0 },
            "1:30 is past the end of the video, which is 1:00 long",
            Some("the nearest valid time is 1:00"),
            &[],
        );
        assert!(reply.message_text.contains("nearest valid time is 1:00"));
        assert!(!reply.suggestions.is_empty());
    }

    #[test]
    fn suggestions_do_not_double_punctuation() {
        assert_eq!(
            with_suggestion("No such moment.", Some("try 0:30?")),
            "No such moment (try 0:30)."
        );
        assert_eq!(with_suggestion("Ask something.", None), "Ask something.");
    }
}

//! Evidence gathered for one question and its rendering into a bounded prompt.

use std::collections::BTreeSet;

use crate::db::{ConversationTurn, TranscriptPayload, TurnRole};
use crate::retrieval::{CaptionHit, ObjectSighting};
use crate::utils::format_timestamp;

pub const TRUNCATION_MARKER: &str = "[... further context omitted ...]";

/// Frame references returned with one reply, at most.
const MAX_FRAME_REFS: usize = 6;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evidence {
    pub captions: Vec<CaptionHit>,
    pub transcripts: Vec<TranscriptPayload>,
    pub objects: Vec<ObjectSighting>,
    /// Frames with no richer data attached, as (timestamp, image path).
    pub frames: Vec<(f64, String)>,
}

impl Evidence {
    pub fn is_empty(&self) -> bool {
        self.captions.is_empty()
            && self.transcripts.is_empty()
            && self.objects.is_empty()
            && self.frames.is_empty()
    }

    /// Every timestamp the evidence points at, ascending and deduplicated.
    pub fn timestamps(&self) -> Vec<f64> {
        let mut stamps: Vec<f64> = self
            .captions
            .iter()
            .map(|caption| caption.timestamp)
            .chain(self.transcripts.iter().map(|segment| segment.start))
            .chain(self.objects.iter().map(|object| object.timestamp))
            .chain(self.frames.iter().map(|(timestamp, _)| *timestamp))
            .collect();
        stamps.sort_by(f64::total_cmp);
        stamps.dedup_by(|a, b| (*a - *b).abs() < 1e-6);
        stamps
    }

    /// Image paths to show next to the reply, in priority order.
    pub fn frame_refs(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.captions
            .iter()
            .filter_map(|caption| caption.frame_path.clone())
            .chain(self.objects.iter().filter_map(|object| object.image_path.clone()))
            .chain(self.frames.iter().map(|(_, path)| path.clone()))
            .filter(|path| seen.insert(path.clone()))
            .take(MAX_FRAME_REFS)
            .collect()
    }

    /// Plain-text summary used when the language model is unavailable.
    pub fn digest(&self, max_chars: usize) -> String {
        render_context(self, max_chars)
    }
}

/// Render evidence as prompt sections within `max_chars`.
///
/// Sections go in priority order: captions, transcripts, objects, then bare
/// frame timestamps. Empty sections are skipped. Once the budget runs out the
/// rest is replaced by [`TRUNCATION_MARKER`].
pub fn render_context(evidence: &Evidence, max_chars: usize) -> String {
    let sections: [(&str, Vec<String>); 4] = [
        (
            "Scene descriptions",
            evidence
                .captions
                .iter()
                .map(|caption| format!("[{}] {}", format_timestamp(caption.timestamp), caption.text))
                .collect(),
        ),
        (
            "Transcript",
            evidence
                .transcripts
                .iter()
                .map(|segment| {
                    format!(
                        "[{}-{}] {}",
                        format_timestamp(segment.start),
                        format_timestamp(segment.end),
                        segment.text
                    )
                })
                .collect(),
        ),
        (
            "Detected objects",
            evidence
                .objects
                .iter()
                .map(|object| {
                    format!(
                        "[{}] {} ({:.0}% confidence)",
                        format_timestamp(object.timestamp),
                        object.class_name,
                        object.confidence * 100.0
                    )
                })
                .collect(),
        ),
        (
            "Sampled frames",
            if evidence.frames.is_empty() {
                Vec::new()
            } else {
                vec![evidence
                    .frames
                    .iter()
                    .map(|(timestamp, _)| format_timestamp(*timestamp))
                    .collect::<Vec<_>>()
                    .join(", ")]
            },
        ),
    ];

    let mut out = String::new();
    for (title, lines) in sections {
        if lines.is_empty() {
            continue;
        }
        let header = format!("{title}:\n");
        if !fits(&out, &header, max_chars) {
            push_marker(&mut out);
            return out;
        }
        out.push_str(&header);
        for line in lines {
            let line = format!("{line}\n");
            if !fits(&out, &line, max_chars) {
                push_marker(&mut out);
                return out;
            }
            out.push_str(&line);
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

fn fits(out: &str, addition: &str, max_chars: usize) -> bool {
    out.chars().count() + addition.chars().count() + TRUNCATION_MARKER.len() + 1 <= max_chars
}

fn push_marker(out: &mut String) {
    out.push_str(TRUNCATION_MARKER);
}

/// Assemble the final prompt: history, an optional notice, evidence, question.
pub fn build_prompt(
    question: &str,
    context: &str,
    history: &[ConversationTurn],
    notice: Option<&str>,
) -> String {
    let mut prompt = String::new();

    if !history.is_empty() {
        prompt.push_str("Conversation so far:\n");
        for turn in history {
            let speaker = match turn.role {
                TurnRole::User => "User",
                TurnRole::Assistant => "Assistant",
            };
            prompt.push_str(&format!("{speaker}: {}\n", turn.content));
        }
        prompt.push('\n');
    }

    if let Some(notice) = notice {
        prompt.push_str(&format!("Note: {notice}\n\n"));
    }

    if context.is_empty() {
        prompt.push_str("Video evidence: none available yet.\n\n");
    } else {
        prompt.push_str("Video evidence:\n");
        prompt.push_str(context);
        prompt.push_str("\n\n");
    }

    prompt.push_str(&format!("Question: {question}\nAnswer:"));
    prompt
}

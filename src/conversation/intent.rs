//! Keyword intent classification and timestamp parsing for chat messages.

use serde::Serialize;

use crate::retrieval::scoring::tokenize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryIntent {
    /// What can be seen; answered from captions.
    Visual,
    /// What is said or heard; answered from transcripts.
    Audio,
    /// Whether or where something appears; answered from detections.
    Object { class_name: String },
    /// What happens at a given moment.
    Temporal { timestamp: f64 },
    General,
}

impl QueryIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryIntent::Visual => "visual",
            QueryIntent::Audio => "audio",
            QueryIntent::Object { .. } => "object",
            QueryIntent::Temporal { .. } => "temporal",
            QueryIntent::General => "general",
        }
    }
}

const AUDIO_WORDS: &[&str] = &[
    "say", "said", "says", "saying", "talk", "talking", "talks", "speak", "speaking", "spoke",
    "hear", "heard", "sound", "sounds", "audio", "transcript", "mention", "mentioned", "voice",
    "words", "dialogue", "narrator",
];

const VISUAL_WORDS: &[&str] = &[
    "see", "seen", "show", "shown", "shows", "look", "looks", "appear", "appears", "visible",
    "color", "colour", "wearing", "scene", "happen", "happens", "happening", "doing", "picture",
    "describe",
];

const OBJECT_PHRASES: &[&str] = &[
    "is there", "are there", "how many", "any", "where is", "where are", "find", "spot", "count",
];

const FILLER_WORDS: &[&str] = &[
    "many", "any", "there", "find", "spot", "count", "video", "clip", "me", "you", "can", "they",
];

/// Classify a message. `known_classes` are object classes detected in the video.
pub fn classify(message: &str, known_classes: &[String]) -> QueryIntent {
    if let Some(timestamp) = parse_timestamp(message) {
        return QueryIntent::Temporal { timestamp };
    }

    let words = word_list(&message.to_lowercase());
    let joined = format!(" {} ", words.join(" "));
    let has_word = |list: &[&str]| words.iter().any(|word| list.contains(&word.as_str()));

    if let Some(class_name) = mentioned_class(&joined, known_classes) {
        if !has_word(AUDIO_WORDS) {
            return QueryIntent::Object { class_name };
        }
    }
    if OBJECT_PHRASES
        .iter()
        .any(|phrase| joined.contains(&format!(" {phrase} ")))
    {
        if let Some(class_name) = topic_terms(message).pop() {
            return QueryIntent::Object { class_name };
        }
    }
    if has_word(AUDIO_WORDS) {
        return QueryIntent::Audio;
    }
    if has_word(VISUAL_WORDS) {
        return QueryIntent::Visual;
    }
    QueryIntent::General
}

/// Content words of a message with intent trigger words removed.
pub fn topic_terms(message: &str) -> Vec<String> {
    tokenize(message)
        .into_iter()
        .filter(|token| {
            !AUDIO_WORDS.contains(&token.as_str())
                && !VISUAL_WORDS.contains(&token.as_str())
                && !FILLER_WORDS.contains(&token.as_str())
        })
        .collect()
}

fn word_list(lowered: &str) -> Vec<String> {
    lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_string)
        .collect()
}

/// `joined` is the space-padded, lowercased word list of the message.
fn mentioned_class(joined: &str, known_classes: &[String]) -> Option<String> {
    known_classes
        .iter()
        .filter(|class| !class.trim().is_empty())
        .find(|class| {
            let class = class.to_lowercase();
            joined.contains(&format!(" {class} ")) || joined.contains(&format!(" {class}s "))
        })
        .cloned()
}

/// Find a time reference such as `0:45`, `1:02:03`, `45s`, `45 seconds`,
/// `2 min` or `1 minute 30 seconds`. Returns seconds.
pub fn parse_timestamp(message: &str) -> Option<f64> {
    let words: Vec<String> = message
        .split_whitespace()
        .map(|word| {
            word.trim_matches(|c: char| !c.is_alphanumeric() && c != ':' && c != '.')
                .trim_end_matches('.')
                .to_lowercase()
        })
        .filter(|word| !word.is_empty())
        .collect();

    for (index, word) in words.iter().enumerate() {
        if let Some(seconds) = parse_clock(word) {
            return Some(seconds);
        }
        if let Some(seconds) = parse_suffixed(word) {
            return Some(seconds);
        }

        let Ok(value) = word.parse::<f64>() else {
            continue;
        };
        if !value.is_finite() || value < 0.0 {
            continue;
        }
        match words.get(index + 1).map(String::as_str) {
            Some(unit) if is_seconds_unit(unit) => return Some(value),
            Some(unit) if is_minutes_unit(unit) => {
                let extra = match (words.get(index + 2), words.get(index + 3)) {
                    (Some(amount), Some(unit)) if is_seconds_unit(unit) => {
                        amount.parse::<f64>().unwrap_or(0.0)
                    }
                    _ => 0.0,
                };
                return Some(value * 60.0 + extra);
            }
            _ => {}
        }
    }
    None
}

fn parse_clock(word: &str) -> Option<f64> {
    if !word.contains(':') {
        return None;
    }
    let parts: Vec<&str> = word.split(':').collect();
    if parts.len() > 3 || parts.iter().any(|part| part.is_empty()) {
        return None;
    }
    let mut values = Vec::with_capacity(parts.len());
    for part in &parts {
        values.push(part.parse::<f64>().ok()?);
    }
    // Every field after the first is a two-digit 0..60 value.
    if values[1..].iter().any(|value| *value >= 60.0) {
        return None;
    }
    Some(values.iter().fold(0.0, |total, value| total * 60.0 + value))
}

fn parse_suffixed(word: &str) -> Option<f64> {
    for (suffix, scale) in [
        ("seconds", 1.0),
        ("second", 1.0),
        ("secs", 1.0),
        ("sec", 1.0),
        ("s", 1.0),
        ("minutes", 60.0),
        ("minute", 60.0),
        ("mins", 60.0),
        ("min", 60.0),
        ("m", 60.0),
    ] {
        if let Some(number) = word.strip_suffix(suffix) {
            if number.is_empty() || !number.starts_with(|c: char| c.is_ascii_digit()) {
                continue;
            }
            if let Ok(value) = number.parse::<f64>() {
                return Some(value * scale);
            }
        }
    }
    None
}

fn is_seconds_unit(word: &str) -> bool {
    matches!(word, "s" | "sec" | "secs" | "second" | "seconds")
}

fn is_minutes_unit(word: &str) -> bool {
    matches!(word, "m" | "min" | "mins" | "minute" | "minutes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clock_and_unit_forms() {
        assert_eq!(parse_timestamp("what did they say at 0:45"), Some(45.0));
        assert_eq!(parse_timestamp("what happens at 1:02:03?"), Some(3723.0));
        assert_eq!(parse_timestamp("show me 45s in"), Some(45.0));
        assert_eq!(parse_timestamp("what is at 45 seconds"), Some(45.0));
        assert_eq!(parse_timestamp("around 2 min"), Some(120.0));
        assert_eq!(parse_timestamp("at 1 minute 30 seconds"), Some(90.0));
        assert_eq!(parse_timestamp("is there a dog"), None);
        assert_eq!(parse_timestamp("the score was 3:75"), None);
    }

    #[test]
    fn timestamps_win_over_other_intents() {
        assert_eq!(
            classify("what did they say at 0:45", &[]),
            QueryIntent::Temporal { timestamp: 45.0 }
        );
    }

    #[test]
    fn known_classes_drive_object_intent() {
        let classes = vec!["dog".to_string(), "person".to_string()];
        assert_eq!(
            classify("Are there dogs here?", &classes),
            QueryIntent::Object {
                class_name: "dog".into()
            }
        );
        assert_eq!(
            classify("how many bicycles appear", &[]),
            QueryIntent::Object {
                class_name: "bicycles".into()
            }
        );
    }

    #[test]
    fn audio_visual_and_general() {
        assert_eq!(classify("What did the narrator say about bread?", &[]), QueryIntent::Audio);
        assert_eq!(classify("What color is the car?", &[]), QueryIntent::Visual);
        assert_eq!(classify("Summarize this", &[]), QueryIntent::General);
    }

    #[test]
    fn topic_terms_strip_trigger_words() {
        assert_eq!(topic_terms("What did they say about bread?"), vec!["about", "bread"]);
    }
}

use std::collections::HashSet;

use super::config::RetrievalConfig;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "did", "do", "does", "for", "from", "how",
    "in", "is", "it", "of", "on", "or", "that", "the", "there", "this", "to", "was", "were",
    "what", "when", "where", "which", "who", "with",
];

/// Lowercase word tokens with stopwords removed, in order of appearance.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .filter(|word| !STOPWORDS.contains(&word.as_str()))
        .collect()
}

/// Lowercase and collapse whitespace, for phrase containment checks.
pub fn normalize_phrase(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptionScore {
    pub total: f64,
    /// 1.0 when the whole query phrase appears in the caption
    pub exact: f64,
    /// Fraction of distinct query tokens present in the caption
    pub overlap: f64,
}

impl CaptionScore {
    /// A caption with no textual match is never returned, however confident.
    pub fn is_match(&self) -> bool {
        self.exact > 0.0 || self.overlap > 0.0
    }
}

pub fn score_caption(
    query: &str,
    caption: &str,
    confidence: f64,
    config: &RetrievalConfig,
) -> CaptionScore {
    let phrase = normalize_phrase(query);
    let exact = if !phrase.is_empty() && normalize_phrase(caption).contains(&phrase) {
        1.0
    } else {
        0.0
    };

    let query_tokens: HashSet<String> = tokenize(query).into_iter().collect();
    let overlap = if query_tokens.is_empty() {
        0.0
    } else {
        let caption_tokens: HashSet<String> = tokenize(caption).into_iter().collect();
        let shared = query_tokens.intersection(&caption_tokens).count();
        shared as f64 / query_tokens.len() as f64
    };

    let total = if exact > 0.0 || overlap > 0.0 {
        config.weight_exact * exact
            + config.weight_overlap * overlap
            + config.weight_confidence * confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };

    CaptionScore {
        total,
        exact,
        overlap,
    }
}

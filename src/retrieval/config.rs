use serde::{Deserialize, Serialize};

/// Tunable knobs for caption ranking and time-window lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Bonus when the whole query appears verbatim in the caption
    pub weight_exact: f64,
    /// Share of query tokens the caption contains
    pub weight_overlap: f64,
    /// Captioner confidence
    pub weight_confidence: f64,

    pub default_top_k: usize,
    /// Half-width in seconds of the window around a timestamp question
    pub default_window_secs: f64,
    /// Transcript matches kept for an audio question
    pub max_transcript_hits: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            weight_exact: 0.50,
            weight_overlap: 0.35,
            weight_confidence: 0.15,
            default_top_k: 5,
            default_window_secs: 5.0,
            max_transcript_hits: 8,
        }
    }
}

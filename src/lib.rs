//! Staged video context pipeline and grounded question answering.
//!
//! A [`VideoAssistant`] takes an uploaded video through extraction, captioning
//! and transcription/detection, keeps every piece of derived context in a
//! local SQLite store, and answers questions about the video from that store.

pub mod assistant;
pub mod audit;
pub mod collaborators;
pub mod config;
pub mod conversation;
pub mod db;
pub mod error;
pub mod pipeline;
pub mod retrieval;
pub mod utils;
pub mod validation;

pub use assistant::{VideoAssistant, VideoStatus};
pub use audit::{CompletenessReport, ConsistencyAuditor};
pub use collaborators::{
    Captioner, Collaborators, FrameExtractor, LanguageModel, LocalFileStore, ObjectDetector,
    Transcriber, VideoFileStore,
};
pub use config::{Settings, SettingsStore};
pub use conversation::{ChatResponse, ConversationOrchestrator, QueryIntent};
pub use db::Database;
pub use error::{PipelineError, PipelineResult, ValidationError};
pub use pipeline::{PipelineOrchestrator, PipelineProgress};
pub use retrieval::{ContextRetriever, RetrievalConfig};

pub mod context_record;
pub mod conversation;
pub mod stage_run;
pub mod video;

pub use context_record::{
    BoundingBox, CaptionPayload, ContextCounts, ContextPayload, ContextRecord, ContextType,
    DetectedObject, DetectionPayload, FramePayload, MetadataPayload, TimeRange, TranscriptPayload,
};
pub use conversation::{ConversationTurn, TurnRole};
pub use stage_run::{Stage, StageRun, StageRunStatus};
pub use video::{ProcessingStatus, Video};

pub mod controller;
mod orchestrator;
pub mod sampling;
pub mod writer;

pub use controller::{PipelineHandle, PipelineProgress, ProcessingTracker, Reservation};
pub use orchestrator::PipelineOrchestrator;
pub use writer::{write_stage, WriteOutcome};

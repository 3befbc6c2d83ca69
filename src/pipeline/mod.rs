//! Voice pipeline composition.
//!
//! A single conductor task routes captured frames to VAD, the barge-in
//! monitor, the pre-roll ring buffer, the wake detector and the active command
//! session, and drives replies through the playback engine. Component errors
//! are reported through an [`ErrorReporter`], never propagated across
//! components.

pub mod error;
pub mod orchestrator;

pub use error::{ComponentError, ErrorContext, ErrorReporter, LogReporter};
pub use orchestrator::{
    Collaborators, PipelineConfig, PipelineHandle, VoicePipeline, select_wake_detector,
};

//! Speech-to-text seams: batch transcription for wake checks and streaming
//! transcription for command capture.

pub mod stream;
pub mod transcriber;

pub use stream::{
    MockTranscriptionProvider, TranscriptEvent, TranscriptionProvider, TranscriptionStream,
};
pub use transcriber::{MockTranscriber, Transcriber};

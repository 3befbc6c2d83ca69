//! razor-voice - real-time voice command orchestration
//!
//! Wake word, streaming command capture, barge-in, device-enforced playback,
//! headset supervision and an attention window, composed around one state
//! machine.

// Enforce error handling discipline: propagate, never panic in library code.
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod attention;
pub mod audio;
pub mod bluetooth;
#[cfg(feature = "cli")]
pub mod cli;
pub mod command;
pub mod config;
pub mod defaults;
pub mod error;
pub mod events;
pub mod interrupt;
pub mod pipeline;
pub mod playback;
pub mod state;
pub mod stt;
pub mod system;
pub mod wake;

// Core seams (capture → detect → transcribe → speak)
pub use audio::{AudioSource, DeviceController};
pub use bluetooth::BluetoothController;
pub use playback::{AudioSink, Synthesizer};
pub use stt::{Transcriber, TranscriptionProvider};
pub use system::{CommandExecutor, SystemCommandExecutor};
pub use wake::KeywordSpotter;

// Pipeline
pub use pipeline::{Collaborators, PipelineConfig, PipelineHandle, VoicePipeline};
pub use state::{PipelineState, StateMachine, TransitionEvent, Trigger};

// Events
pub use events::{AssistantEvent, CommandSource, EventBus, WakeReason};

// Error handling
pub use error::{Result, VoiceError};
pub use pipeline::{ComponentError, ErrorReporter};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}

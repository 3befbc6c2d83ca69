//! Error types for razor-voice.

use crate::state::PipelineState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Audio capture errors
    #[error("Audio device not found: {device}")]
    AudioDeviceNotFound { device: String },

    #[error("Audio capture failed: {message}")]
    AudioCapture { message: String },

    #[error("No audio received from input device within {timeout_ms}ms")]
    NoAudioReceived { timeout_ms: u64 },

    // Output/input routing errors
    #[error("Device routing failed: {message}")]
    DeviceRouting { message: String },

    #[error("System tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("System tool {tool} failed: {message}")]
    ToolFailed { tool: String, message: String },

    // Wake word and transcription errors
    #[error("Invalid wake phrase {phrase:?}: {message}")]
    WakePhrase { phrase: String, message: String },

    #[error("Keyword spotter failed: {message}")]
    KeywordSpotter { message: String },

    #[error("Transcription error: {message}")]
    Transcription { message: String },

    #[error("Transcription stream failed to connect: {message}")]
    TranscriptionConnect { message: String },

    // Synthesis and playback errors
    #[error("Speech synthesis failed: {message}")]
    Synthesis { message: String },

    #[error("Playback failed: {message}")]
    Playback { message: String },

    // Bluetooth errors
    #[error("Bluetooth device not paired: {name}")]
    BluetoothDeviceNotFound { name: String },

    #[error("Bluetooth error: {message}")]
    Bluetooth { message: String },

    // State machine errors
    #[error("Illegal transition from {from} to {to}")]
    IllegalTransition {
        from: PipelineState,
        to: PipelineState,
    },

    #[error("Operation timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

impl VoiceError {
    /// Builds a `Timeout` error from an operation name and the elapsed limit.
    pub fn timeout(operation: &str, limit: std::time::Duration) -> Self {
        VoiceError::Timeout {
            operation: operation.to_string(),
            timeout_ms: limit.as_millis() as u64,
        }
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, VoiceError>;

//! Audio input side: sources, capture thread, mute gate, VAD and device routing.

pub mod capture;
pub mod device;
pub mod frame;
#[cfg(feature = "cpal-audio")]
pub mod microphone;
pub mod source;
pub mod vad;
pub mod wav;

pub use capture::{CapturedFrame, Capture, CaptureConfig, ManualFeed, MuteGate, apply_gain};
pub use device::{CommandDeviceController, DeviceController, MockDeviceController};
pub use frame::{AudioFrame, SpeechSegment};
pub use source::{AudioSource, AudioSourceConfig, MockAudioSource};
pub use vad::{Vad, VadConfig, VadEvent, VadState, calculate_rms};

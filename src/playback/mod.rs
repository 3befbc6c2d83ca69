//! Reply playback: synthesis, sinks and the device-enforcing engine.

pub mod engine;
pub mod sink;
pub mod synth;

pub use engine::{PlaybackConfig, PlaybackEngine, PlaybackOutcome, PlaybackTicket};
pub use sink::{
    AudioSink, CommandAudioSink, MockAudioSink, PaceConfig, SinkCompletion, SynthesizedAudio,
};
pub use synth::{MockSynthesizer, Synthesizer, synthesize_with_timeout};

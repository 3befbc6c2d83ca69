//! Voice Activity Detection (VAD) module.
//!
//! Detects speech in the frame stream using RMS-based thresholding, rejects
//! clicks shorter than a minimum voiced span, and closes a segment once
//! silence has lasted long enough. All timing comes from frame timestamps, so
//! the detector behaves identically on live audio, files and paused-clock tests.

use crate::audio::frame::{AudioFrame, SpeechSegment};
use crate::defaults;
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for Voice Activity Detection.
#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    /// RMS threshold for detecting speech (0.0 to 1.0).
    pub speech_threshold: f32,
    /// Duration of silence before speech is considered ended (milliseconds).
    pub silence_duration_ms: u32,
    /// Minimum voiced span before speech is announced (milliseconds).
    pub min_speech_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            speech_threshold: defaults::VAD_THRESHOLD,
            silence_duration_ms: defaults::SILENCE_DURATION_MS,
            min_speech_ms: defaults::MIN_SPEECH_MS,
        }
    }
}

/// Current state of voice activity detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    /// No speech detected.
    Idle,
    /// Energy seen, but the voiced span is still below the minimum.
    Pending,
    /// Speech has been announced.
    Speaking,
    /// Silence detected inside a segment, waiting to confirm speech end.
    MaybeSilence,
}

/// Events emitted by the VAD processor.
#[derive(Debug, Clone)]
pub enum VadEvent {
    /// The voiced span reached the minimum; `at` is the onset timestamp.
    SpeechStart { at: Instant },
    /// An announced segment closed after enough silence.
    SpeechEnd(SpeechSegment),
    /// A segment closed before reaching the minimum voiced span.
    Discarded { speech_ms: u32 },
}

/// Voice Activity Detector state machine.
pub struct Vad {
    config: VadConfig,
    frames: Vec<AudioFrame>,
    onset: Option<Instant>,
    last_voiced_end: Option<Instant>,
    silence_start: Option<Instant>,
    announced: bool,
    level: f32,
}

impl Vad {
    /// Creates a new VAD instance with the given configuration.
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            frames: Vec::new(),
            onset: None,
            last_voiced_end: None,
            silence_start: None,
            announced: false,
            level: 0.0,
        }
    }

    /// Processes one frame and returns the event it produced, if any.
    pub fn process(&mut self, frame: &AudioFrame) -> Option<VadEvent> {
        let rms = calculate_rms(&frame.samples);
        self.level = rms;
        let is_speech = rms > self.config.speech_threshold;

        let Some(onset) = self.onset else {
            if !is_speech {
                return None;
            }
            self.onset = Some(frame.timestamp);
            self.frames.push(frame.clone());
            self.last_voiced_end = Some(frame.end());
            return self.maybe_announce(frame.timestamp);
        };

        self.frames.push(frame.clone());

        if is_speech {
            self.silence_start = None;
            self.last_voiced_end = Some(frame.end());
            return self.maybe_announce(onset);
        }

        let silence_start = *self.silence_start.get_or_insert(frame.timestamp);
        let silence = frame.end().duration_since(silence_start);
        if silence >= Duration::from_millis(self.config.silence_duration_ms as u64) {
            return self.finalize();
        }
        None
    }

    /// Forces finalization of the segment in progress.
    ///
    /// Returns `SpeechEnd` for an announced segment, `Discarded` for one that
    /// never reached the minimum, and `None` when idle.
    pub fn flush(&mut self) -> Option<VadEvent> {
        self.onset?;
        self.finalize()
    }

    /// Drops any in-progress segment without emitting.
    pub fn reset(&mut self) {
        self.frames.clear();
        self.onset = None;
        self.last_voiced_end = None;
        self.silence_start = None;
        self.announced = false;
    }

    /// Returns the current VAD state.
    pub fn state(&self) -> VadState {
        match (self.onset, self.announced, self.silence_start) {
            (None, _, _) => VadState::Idle,
            (Some(_), _, Some(_)) => VadState::MaybeSilence,
            (Some(_), true, None) => VadState::Speaking,
            (Some(_), false, None) => VadState::Pending,
        }
    }

    /// RMS level of the most recent frame.
    pub fn level(&self) -> f32 {
        self.level
    }

    /// Updates the speech threshold without resetting state.
    pub fn set_threshold(&mut self, threshold: f32) {
        self.config.speech_threshold = threshold;
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    fn voiced_ms(&self) -> u32 {
        match (self.onset, self.last_voiced_end) {
            (Some(onset), Some(end)) => end.duration_since(onset).as_millis() as u32,
            _ => 0,
        }
    }

    fn maybe_announce(&mut self, onset: Instant) -> Option<VadEvent> {
        if self.announced || self.voiced_ms() < self.config.min_speech_ms {
            return None;
        }
        self.announced = true;
        Some(VadEvent::SpeechStart { at: onset })
    }

    fn finalize(&mut self) -> Option<VadEvent> {
        let speech_ms = self.voiced_ms();
        let announced = self.announced;
        let started_at = self.onset?;
        let frames = std::mem::take(&mut self.frames);
        self.reset();

        if !announced {
            return Some(VadEvent::Discarded { speech_ms });
        }
        let ended_at = frames.last().map(|f| f.end()).unwrap_or(started_at);
        Some(VadEvent::SpeechEnd(SpeechSegment {
            frames,
            speech_ms,
            started_at,
            ended_at,
        }))
    }
}

/// Calculates the Root Mean Square (RMS) of audio samples.
///
/// # Arguments
/// * `samples` - Audio samples as 16-bit PCM
///
/// # Returns
/// Normalized RMS value (0.0 to 1.0), where:
/// - 0.0 represents silence
/// - ~0.707 represents a full-scale sine wave
/// - 1.0 represents maximum amplitude
pub fn calculate_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&sample| {
            let normalized = sample as f64 / i16::MAX as f64;
            normalized * normalized
        })
        .sum();

    let mean_square = sum_squares / samples.len() as f64;
    mean_square.sqrt() as f32
}

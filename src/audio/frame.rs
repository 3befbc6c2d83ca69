//! Frame types shared by capture, VAD, wake detection and barge-in.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Fixed-length block of 16-bit mono PCM produced by capture.
///
/// Frames are immutable once produced; cloning shares the sample buffer so the
/// same frame can fan out to VAD, the ring buffer and a transcription stream.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Sequence number, monotonic per capture session.
    pub sequence: u64,
    /// Capture time of the first sample.
    pub timestamp: Instant,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Gain-adjusted samples.
    pub samples: Arc<[i16]>,
}

impl AudioFrame {
    /// Creates a frame from already gain-adjusted samples.
    pub fn new(sequence: u64, timestamp: Instant, sample_rate: u32, samples: Vec<i16>) -> Self {
        Self {
            sequence,
            timestamp,
            sample_rate,
            samples: samples.into(),
        }
    }

    /// Duration covered by the samples in this frame.
    pub fn duration(&self) -> Duration {
        samples_to_duration(self.samples.len(), self.sample_rate)
    }

    /// Returns the duration of this frame in milliseconds.
    pub fn duration_ms(&self) -> u32 {
        self.duration().as_millis() as u32
    }

    /// Timestamp just past the last sample.
    pub fn end(&self) -> Instant {
        self.timestamp + self.duration()
    }
}

/// A contiguous span of speech finalized by the VAD.
#[derive(Debug, Clone)]
pub struct SpeechSegment {
    /// Frames from speech onset through the trailing silence.
    pub frames: Vec<AudioFrame>,
    /// Time from onset to the last voiced frame.
    pub speech_ms: u32,
    /// Onset timestamp.
    pub started_at: Instant,
    /// End of the last frame in the segment.
    pub ended_at: Instant,
}

impl SpeechSegment {
    /// Total duration including trailing silence.
    pub fn duration_ms(&self) -> u32 {
        self.ended_at.duration_since(self.started_at).as_millis() as u32
    }

    /// Concatenates the samples of every frame.
    pub fn samples(&self) -> Vec<i16> {
        let total = self.frames.iter().map(|f| f.samples.len()).sum();
        let mut out = Vec::with_capacity(total);
        for frame in &self.frames {
            out.extend_from_slice(&frame.samples);
        }
        out
    }

    /// Sample rate of the segment (taken from the first frame).
    pub fn sample_rate(&self) -> u32 {
        self.frames
            .first()
            .map(|f| f.sample_rate)
            .unwrap_or(crate::defaults::SAMPLE_RATE)
    }
}

/// Converts a sample count to a duration at the given rate.
pub fn samples_to_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(samples as u64 * 1_000_000 / sample_rate as u64)
}

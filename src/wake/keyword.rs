//! Low-latency wake strategy: a keyword-spotting engine fed raw samples.

use super::{WakeEvent, WakeTrigger};
use crate::audio::frame::AudioFrame;
use crate::error::{Result, VoiceError};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// On-device keyword spotting engine.
///
/// Engines consume audio in a fixed native frame length, which rarely matches
/// the capture frame length.
pub trait KeywordSpotter: Send {
    /// Number of samples the engine expects per call.
    fn frame_length(&self) -> usize;

    /// Processes exactly `frame_length()` samples.
    ///
    /// Returns the index of the detected keyword, if any.
    fn process(&mut self, pcm: &[i16]) -> Result<Option<usize>>;
}

/// Re-chunks capture frames into the spotter's native frame length.
pub struct KeywordWake {
    spotter: Box<dyn KeywordSpotter>,
    pending: Vec<i16>,
}

impl KeywordWake {
    pub fn new(spotter: Box<dyn KeywordSpotter>) -> Self {
        let capacity = spotter.frame_length() * 2;
        Self {
            spotter,
            pending: Vec::with_capacity(capacity),
        }
    }

    /// Feeds one capture frame. Engine errors are logged and skipped.
    pub fn process(&mut self, frame: &AudioFrame) -> Option<WakeEvent> {
        let frame_length = self.spotter.frame_length();
        if frame_length == 0 {
            return None;
        }

        self.pending.extend_from_slice(&frame.samples);
        let mut detected = None;

        while self.pending.len() >= frame_length {
            let chunk: Vec<i16> = self.pending.drain(..frame_length).collect();
            match self.spotter.process(&chunk) {
                Ok(Some(index)) if detected.is_none() => {
                    debug!(index, sequence = frame.sequence, "Keyword detected");
                    detected = Some(index);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Keyword spotter failed on frame"),
            }
        }

        let index = detected?;
        self.pending.clear();
        Some(WakeEvent {
            trigger: WakeTrigger::Keyword { index },
            command: None,
            detected_at: frame.end(),
        })
    }

    /// Drops partially accumulated samples.
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }
}

/// Keyword spotter for tests.
///
/// Detects keyword 0 whenever a chunk contains the marker sample, or on a
/// specific call number.
#[derive(Debug, Clone)]
pub struct ScriptedKeywordSpotter {
    frame_length: usize,
    marker: Option<i16>,
    trigger_on_call: Option<usize>,
    fail: bool,
    calls: Arc<AtomicUsize>,
}

impl ScriptedKeywordSpotter {
    pub fn new(frame_length: usize) -> Self {
        Self {
            frame_length,
            marker: None,
            trigger_on_call: None,
            fail: false,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Detect whenever a chunk contains this exact sample value.
    pub fn with_marker(mut self, marker: i16) -> Self {
        self.marker = Some(marker);
        self
    }

    /// Detect on the n-th call (1-based).
    pub fn with_trigger_on_call(mut self, call: usize) -> Self {
        self.trigger_on_call = Some(call);
        self
    }

    pub fn with_failure(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Shared call counter, still readable after the spotter is boxed.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl KeywordSpotter for ScriptedKeywordSpotter {
    fn frame_length(&self) -> usize {
        self.frame_length
    }

    fn process(&mut self, pcm: &[i16]) -> Result<Option<usize>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail {
            return Err(VoiceError::KeywordSpotter {
                message: "scripted failure".to_string(),
            });
        }
        if self.trigger_on_call == Some(call) {
            return Ok(Some(0));
        }
        if let Some(marker) = self.marker
            && pcm.contains(&marker)
        {
            return Ok(Some(0));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::Instant;

    fn frame(seq: u64, start: Instant, samples: Vec<i16>) -> AudioFrame {
        AudioFrame::new(seq, start + Duration::from_millis(seq * 20), 16000, samples)
    }

    #[test]
    fn test_rechunks_capture_frames_to_native_length() {
        let spotter = ScriptedKeywordSpotter::new(512);
        let calls = spotter.call_counter();
        let mut wake = KeywordWake::new(Box::new(spotter));
        let start = Instant::now();

        // 4 x 320 = 1280 samples => two 512-sample calls, 256 left over
        for seq in 0..4 {
            assert!(wake.process(&frame(seq, start, vec![0; 320])).is_none());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(wake.pending_samples(), 256);
    }

    #[test]
    fn test_detection_carries_index_and_frame_end() {
        let spotter = ScriptedKeywordSpotter::new(320).with_marker(1234);
        let mut wake = KeywordWake::new(Box::new(spotter));
        let start = Instant::now();

        assert!(wake.process(&frame(0, start, vec![0; 320])).is_none());
        let hit = frame(1, start, vec![1234; 320]);
        let event = wake.process(&hit).unwrap();

        assert_eq!(event.trigger, WakeTrigger::Keyword { index: 0 });
        assert_eq!(event.command, None);
        assert_eq!(event.detected_at, hit.end());
        assert_eq!(wake.pending_samples(), 0);
    }

    #[test]
    fn test_engine_errors_are_skipped() {
        let spotter = ScriptedKeywordSpotter::new(160).with_failure();
        let calls = spotter.call_counter();
        let mut wake = KeywordWake::new(Box::new(spotter));

        assert!(wake.process(&frame(0, Instant::now(), vec![0; 320])).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_trigger_on_call_fires_once() {
        let spotter = ScriptedKeywordSpotter::new(320).with_trigger_on_call(3);
        let mut wake = KeywordWake::new(Box::new(spotter));
        let start = Instant::now();

        let hits: Vec<bool> = (0..5)
            .map(|seq| wake.process(&frame(seq, start, vec![0; 320])).is_some())
            .collect();
        assert_eq!(hits, vec![false, false, true, false, false]);
    }

    #[test]
    fn test_reset_drops_partial_chunk() {
        let mut wake = KeywordWake::new(Box::new(ScriptedKeywordSpotter::new(512)));
        wake.process(&frame(0, Instant::now(), vec![0; 320]));
        assert_eq!(wake.pending_samples(), 320);
        wake.reset();
        assert_eq!(wake.pending_samples(), 0);
    }
}

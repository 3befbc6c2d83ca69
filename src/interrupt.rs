//! Barge-in detection during playback.
//!
//! Runs on every raw frame, muted or not, since the microphone is muted while
//! the assistant speaks. The threshold sits well above the VAD threshold so
//! the assistant's own voice leaking into the microphone does not trip it.

use crate::audio::frame::AudioFrame;
use crate::audio::vad::calculate_rms;
use crate::defaults;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterruptConfig {
    /// RMS level a frame must exceed to count.
    pub threshold: f32,
    /// Frames in a row above `threshold` needed to fire.
    pub consecutive_frames: u32,
}

impl InterruptConfig {
    /// Derives the barge-in threshold from the VAD threshold.
    pub fn from_vad(vad_threshold: f32, multiplier: f32, consecutive_frames: u32) -> Self {
        Self {
            threshold: vad_threshold * multiplier,
            consecutive_frames: consecutive_frames.max(1),
        }
    }
}

impl Default for InterruptConfig {
    fn default() -> Self {
        Self::from_vad(
            defaults::VAD_THRESHOLD,
            defaults::INTERRUPT_THRESHOLD_MULTIPLIER,
            defaults::INTERRUPT_CONSECUTIVE_FRAMES,
        )
    }
}

/// Consecutive-frame energy debouncer that fires at most once per arming.
#[derive(Debug)]
pub struct InterruptMonitor {
    config: InterruptConfig,
    consecutive: u32,
    armed: bool,
}

impl InterruptMonitor {
    /// Creates a disarmed monitor.
    pub fn new(config: InterruptConfig) -> Self {
        Self {
            config,
            consecutive: 0,
            armed: false,
        }
    }

    /// Arms the monitor for a new playback.
    pub fn arm(&mut self) {
        self.armed = true;
        self.consecutive = 0;
    }

    pub fn disarm(&mut self) {
        self.armed = false;
        self.consecutive = 0;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Returns `true` exactly once when enough loud frames arrive in a row.
    pub fn process(&mut self, frame: &AudioFrame) -> bool {
        if !self.armed {
            return false;
        }

        let level = calculate_rms(&frame.samples);
        if level > self.config.threshold {
            self.consecutive += 1;
            debug!(level, consecutive = self.consecutive, "Loud frame during playback");
        } else {
            self.consecutive = 0;
        }

        if self.consecutive >= self.config.consecutive_frames {
            info!(level, sequence = frame.sequence, "Barge-in detected");
            self.disarm();
            return true;
        }
        false
    }

    pub fn config(&self) -> InterruptConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::Instant;

    fn frame(seq: u64, amplitude: i16) -> AudioFrame {
        AudioFrame::new(
            seq,
            Instant::now() + Duration::from_millis(seq * 20),
            16000,
            vec![amplitude; 320],
        )
    }

    // 0.02 * 3.0 = 0.06 => ~1966 in i16 terms
    const LOUD: i16 = 6000;
    const SPEECH: i16 = 1000;

    #[test]
    fn test_threshold_is_vad_times_multiplier() {
        let config = InterruptConfig::default();
        assert!((config.threshold - 0.06).abs() < 1e-6);
        assert_eq!(config.consecutive_frames, 3);
    }

    #[test]
    fn test_fires_after_consecutive_loud_frames() {
        let mut monitor = InterruptMonitor::new(InterruptConfig::default());
        monitor.arm();

        assert!(!monitor.process(&frame(0, LOUD)));
        assert!(!monitor.process(&frame(1, LOUD)));
        assert!(monitor.process(&frame(2, LOUD)));
    }

    #[test]
    fn test_quiet_frame_resets_the_count() {
        let mut monitor = InterruptMonitor::new(InterruptConfig::default());
        monitor.arm();

        let fired: Vec<bool> = [LOUD, LOUD, SPEECH, LOUD, LOUD]
            .iter()
            .enumerate()
            .map(|(i, &a)| monitor.process(&frame(i as u64, a)))
            .collect();
        assert!(fired.iter().all(|f| !f));
        assert!(monitor.process(&frame(5, LOUD)));
    }

    #[test]
    fn test_fires_once_until_rearmed() {
        let mut monitor = InterruptMonitor::new(InterruptConfig::default());
        monitor.arm();
        for i in 0..3 {
            monitor.process(&frame(i, LOUD));
        }
        assert!(!monitor.is_armed());

        let later: Vec<bool> = (3..20).map(|i| monitor.process(&frame(i, LOUD))).collect();
        assert!(later.iter().all(|f| !f));

        monitor.arm();
        for i in 20..22 {
            assert!(!monitor.process(&frame(i, LOUD)));
        }
        assert!(monitor.process(&frame(22, LOUD)));
    }

    #[test]
    fn test_disarmed_monitor_ignores_everything() {
        let mut monitor = InterruptMonitor::new(InterruptConfig::default());
        for i in 0..10 {
            assert!(!monitor.process(&frame(i, LOUD)));
        }
    }

    #[test]
    fn test_ordinary_speech_level_does_not_fire() {
        let mut monitor = InterruptMonitor::new(InterruptConfig::default());
        monitor.arm();
        for i in 0..50 {
            assert!(!monitor.process(&frame(i, SPEECH)));
        }
    }
}

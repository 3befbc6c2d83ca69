//! Pre-roll buffer of recent frames.
//!
//! Every frame is pushed regardless of mute state. On a wake event the frames
//! from shortly before detection are replayed into the command stream, so a
//! command spoken in the same breath as the wake phrase is not lost.

use crate::audio::frame::AudioFrame;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Time-bounded queue of recent frames.
#[derive(Debug)]
pub struct RingBuffer {
    window: Duration,
    frames: VecDeque<AudioFrame>,
    newest: Option<Instant>,
}

impl RingBuffer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            frames: VecDeque::new(),
            newest: None,
        }
    }

    /// Appends a frame and drops everything older than the window,
    /// measured against the newest timestamp pushed so far.
    pub fn push(&mut self, frame: AudioFrame) {
        let newest = match self.newest {
            Some(n) if n >= frame.timestamp => n,
            _ => frame.timestamp,
        };
        self.newest = Some(newest);
        self.frames.push_back(frame);

        if let Some(cutoff) = newest.checked_sub(self.window) {
            self.frames.retain(|f| f.timestamp >= cutoff);
        }
    }

    /// Returns every frame captured at or after `since`, in order, and
    /// empties the buffer.
    pub fn drain_since(&mut self, since: Instant) -> Vec<AudioFrame> {
        let drained = self
            .frames
            .drain(..)
            .filter(|f| f.timestamp >= since)
            .collect();
        self.newest = None;
        drained
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.newest = None;
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Span between the oldest and newest buffered frame starts.
    pub fn span(&self) -> Duration {
        match (self.frames.front(), self.newest) {
            (Some(oldest), Some(newest)) => newest.duration_since(oldest.timestamp),
            _ => Duration::ZERO,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(start: Instant, count: u64) -> Vec<AudioFrame> {
        (0..count)
            .map(|i| {
                AudioFrame::new(i, start + Duration::from_millis(i * 20), 16000, vec![0; 320])
            })
            .collect()
    }

    #[test]
    fn test_push_prunes_by_timestamp_not_count() {
        let start = Instant::now();
        let mut ring = RingBuffer::new(Duration::from_millis(1000));

        for frame in frames(start, 200) {
            ring.push(frame);
        }

        // Frames 0..=198 are 3980ms..0ms old; only those within 1000ms survive
        assert_eq!(ring.len(), 51);
        assert!(ring.span() <= ring.window());
    }

    #[test]
    fn test_drain_since_never_returns_older_or_newer_frames() {
        let start = Instant::now();
        let mut ring = RingBuffer::new(Duration::from_millis(3000));
        let all = frames(start, 250);
        let newest = all.last().unwrap().timestamp;
        for frame in all {
            ring.push(frame);
        }

        let since = newest - Duration::from_millis(700);
        let drained = ring.drain_since(since);

        assert!(!drained.is_empty());
        assert!(drained.iter().all(|f| f.timestamp >= since));
        assert!(drained.iter().all(|f| f.timestamp <= newest));
        assert_eq!(drained.len(), 36);
        assert!(drained.windows(2).all(|w| w[0].sequence < w[1].sequence));
    }

    #[test]
    fn test_drain_clears_so_replay_happens_once() {
        let start = Instant::now();
        let mut ring = RingBuffer::new(Duration::from_millis(3000));
        for frame in frames(start, 10) {
            ring.push(frame);
        }

        assert_eq!(ring.drain_since(start).len(), 10);
        assert!(ring.is_empty());
        assert!(ring.drain_since(start).is_empty());
    }

    #[test]
    fn test_drain_since_future_returns_nothing() {
        let start = Instant::now();
        let mut ring = RingBuffer::new(Duration::from_millis(3000));
        for frame in frames(start, 10) {
            ring.push(frame);
        }

        assert!(ring.drain_since(start + Duration::from_secs(10)).is_empty());
        assert!(ring.is_empty());
    }

    #[test]
    fn test_late_frame_does_not_rewind_window() {
        let start = Instant::now();
        let mut ring = RingBuffer::new(Duration::from_millis(100));
        let all = frames(start, 20);
        for frame in all.iter().cloned() {
            ring.push(frame);
        }
        let before = ring.len();

        // An out-of-order frame older than the window is pruned immediately
        ring.push(all[0].clone());
        assert_eq!(ring.len(), before);
    }
}

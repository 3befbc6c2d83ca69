//! Capture thread: polls an [`AudioSource`], applies gain, cuts fixed-length
//! frames and forwards them without ever blocking on the consumer.
//!
//! The mute flag lives in [`MuteGate`]. Frames are always delivered, tagged
//! with the gate state at capture time, because the barge-in monitor and the
//! pre-roll ring buffer must see audio even while the microphone is muted.

use crate::audio::frame::{AudioFrame, samples_to_duration};
use crate::audio::source::AudioSource;
use crate::defaults;
use crate::error::Result;
use crate::events::{AssistantEvent, EventBus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Applies a fixed linear gain with hard clamping to the i16 range.
pub fn apply_gain(samples: &mut [i16], gain: f32) {
    if (gain - 1.0).abs() < f32::EPSILON {
        return;
    }
    for sample in samples.iter_mut() {
        let scaled = (*sample as f32 * gain).round();
        *sample = scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    }
}

/// Configuration for the capture thread.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub frame_ms: u32,
    pub gain: f32,
    /// `capture_no_audio` fires if no samples arrive within this window.
    pub no_audio_timeout: Duration,
    /// Frames buffered between capture and the router before drops begin.
    pub channel_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: defaults::SAMPLE_RATE,
            frame_ms: defaults::FRAME_MS,
            gain: defaults::GAIN,
            no_audio_timeout: Duration::from_millis(defaults::NO_AUDIO_TIMEOUT_MS),
            channel_capacity: defaults::FRAME_CHANNEL_CAPACITY,
        }
    }
}

impl CaptureConfig {
    pub fn frame_len(&self) -> usize {
        ((self.sample_rate as u64 * self.frame_ms as u64) / 1000).max(1) as usize
    }
}

/// A frame plus the mute state it was captured under.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub frame: AudioFrame,
    pub muted: bool,
}

#[derive(Debug, Default)]
struct GateState {
    generation: u64,
    pending_unmute: Option<tokio::task::JoinHandle<()>>,
}

/// Owner of the microphone mute flag.
///
/// Every request takes the same lock and bumps a generation counter, so a
/// delayed unmute that lost the race to a newer mute or unmute never applies.
#[derive(Debug, Default)]
pub struct MuteGate {
    state: Mutex<GateState>,
    muted: AtomicBool,
}

impl MuteGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mutes immediately and cancels any pending delayed unmute.
    pub fn mute(&self) {
        let mut state = self.lock();
        Self::supersede(&mut state);
        self.muted.store(true, Ordering::SeqCst);
    }

    /// Re-opens the microphone after `delay`.
    ///
    /// A zero delay, or a call made outside a tokio runtime, unmutes at once.
    pub fn unmute(self: &Arc<Self>, delay: Duration) {
        let mut state = self.lock();
        Self::supersede(&mut state);

        if delay.is_zero() {
            self.muted.store(false, Ordering::SeqCst);
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("delayed unmute requested outside a runtime, unmuting now");
            self.muted.store(false, Ordering::SeqCst);
            return;
        };

        let generation = state.generation;
        let gate = Arc::clone(self);
        state.pending_unmute = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            gate.finish_unmute(generation);
        }));
    }

    /// Unmutes immediately, bypassing and cancelling any delay.
    pub fn unmute_now(&self) {
        let mut state = self.lock();
        Self::supersede(&mut state);
        self.muted.store(false, Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Whether a delayed unmute is waiting to apply.
    pub fn unmute_pending(&self) -> bool {
        self.lock().pending_unmute.is_some()
    }

    fn finish_unmute(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        state.pending_unmute = None;
        self.muted.store(false, Ordering::SeqCst);
        tracing::debug!("microphone unmuted after delay");
    }

    fn supersede(state: &mut GateState) {
        state.generation += 1;
        if let Some(handle) = state.pending_unmute.take() {
            handle.abort();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        // Poisoning only happens if a holder panicked; the state is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cuts an arbitrary sample stream into fixed-length, gain-adjusted frames.
///
/// Frame timestamps follow the sample count from `base`, so they are exact
/// regardless of how bursty the source delivers.
#[derive(Debug)]
struct FrameCutter {
    pending: Vec<i16>,
    frame_len: usize,
    sample_rate: u32,
    gain: f32,
    base: Instant,
    emitted_samples: u64,
    sequence: u64,
}

impl FrameCutter {
    fn new(config: &CaptureConfig, base: Instant) -> Self {
        Self {
            pending: Vec::with_capacity(config.frame_len() * 2),
            frame_len: config.frame_len(),
            sample_rate: config.sample_rate,
            gain: config.gain,
            base,
            emitted_samples: 0,
            sequence: 0,
        }
    }

    fn push(&mut self, samples: &[i16]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_len {
            let chunk: Vec<i16> = self.pending.drain(..self.frame_len).collect();
            frames.push(self.cut(chunk));
        }
        frames
    }

    /// Emits the trailing partial frame, if any.
    fn finish(&mut self) -> Option<AudioFrame> {
        if self.pending.is_empty() {
            return None;
        }
        let chunk = std::mem::take(&mut self.pending);
        Some(self.cut(chunk))
    }

    fn cut(&mut self, mut chunk: Vec<i16>) -> AudioFrame {
        apply_gain(&mut chunk, self.gain);
        let offset = samples_to_duration(self.emitted_samples as usize, self.sample_rate);
        self.emitted_samples += chunk.len() as u64;
        let frame = AudioFrame::new(self.sequence, self.base + offset, self.sample_rate, chunk);
        self.sequence += 1;
        frame
    }
}

/// Handle to a running capture thread.
pub struct Capture {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    gate: Arc<MuteGate>,
}

impl Capture {
    /// Starts the source and spawns the capture thread.
    ///
    /// # Returns
    /// The capture handle and the receiving end of the frame channel
    pub fn spawn(
        mut source: Box<dyn AudioSource>,
        config: CaptureConfig,
        gate: Arc<MuteGate>,
        events: EventBus,
    ) -> Result<(Self, mpsc::Receiver<CapturedFrame>)> {
        source.start()?;
        events.emit(AssistantEvent::CaptureStarted);
        tracing::info!(
            sample_rate = config.sample_rate,
            frame_ms = config.frame_ms,
            gain = config.gain,
            "audio capture started"
        );

        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let running = Arc::new(AtomicBool::new(true));
        let source_is_finite = source.is_finite();

        let thread_running = Arc::clone(&running);
        let thread_gate = Arc::clone(&gate);
        let thread = thread::Builder::new()
            .name("razor-capture".to_string())
            .spawn(move || {
                let poll_interval = Duration::from_millis((config.frame_ms / 2).max(1) as u64);
                let started = std::time::Instant::now();
                let mut cutter = FrameCutter::new(&config, Instant::now());
                let mut consecutive_errors: u32 = 0;
                const MAX_CONSECUTIVE_ERRORS: u32 = 10;
                let mut received_any = false;
                let mut reported_no_audio = false;
                let mut dropped: u64 = 0;

                while thread_running.load(Ordering::SeqCst) {
                    let samples = match source.read_samples() {
                        Ok(s) => {
                            consecutive_errors = 0;
                            s
                        }
                        Err(e) => {
                            consecutive_errors += 1;
                            if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                                tracing::error!(
                                    error = %e,
                                    "audio capture failed {consecutive_errors} times in a row"
                                );
                                break;
                            }
                            thread::sleep(poll_interval);
                            continue;
                        }
                    };

                    if samples.is_empty() {
                        if source_is_finite {
                            break;
                        }
                        if !received_any
                            && !reported_no_audio
                            && started.elapsed() >= config.no_audio_timeout
                        {
                            reported_no_audio = true;
                            tracing::error!(
                                timeout_ms = config.no_audio_timeout.as_millis() as u64,
                                "no audio received from input device"
                            );
                            events.emit(AssistantEvent::CaptureNoAudio {
                                timeout_ms: config.no_audio_timeout.as_millis() as u64,
                            });
                        }
                        thread::sleep(poll_interval);
                        continue;
                    }
                    received_any = true;

                    for frame in cutter.push(&samples) {
                        let muted = thread_gate.is_muted();
                        match tx.try_send(CapturedFrame { frame, muted }) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                dropped += 1;
                                if dropped.is_power_of_two() {
                                    tracing::warn!(dropped, "frame channel full, dropping audio");
                                }
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                thread_running.store(false, Ordering::SeqCst);
                                break;
                            }
                        }
                    }

                    if !source_is_finite {
                        thread::sleep(poll_interval);
                    }
                }

                if let Some(frame) = cutter.finish() {
                    let muted = thread_gate.is_muted();
                    if tx.try_send(CapturedFrame { frame, muted }).is_err() {
                        tracing::debug!("trailing partial frame dropped");
                    }
                }

                if let Err(e) = source.stop() {
                    tracing::warn!(error = %e, "failed to stop audio capture");
                }
                events.emit(AssistantEvent::CaptureStopped);
                tracing::info!("audio capture stopped");
            })?;

        Ok((
            Self {
                running,
                thread: Some(thread),
                gate,
            },
            rx,
        ))
    }

    /// Creates a feed driven by explicit `push` calls instead of a thread.
    pub fn manual(
        config: CaptureConfig,
        gate: Arc<MuteGate>,
    ) -> (ManualFeed, mpsc::Receiver<CapturedFrame>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let feed = ManualFeed {
            cutter: FrameCutter::new(&config, Instant::now()),
            gate,
            tx,
        };
        (feed, rx)
    }

    pub fn mute_gate(&self) -> Arc<MuteGate> {
        Arc::clone(&self.gate)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signals the thread to stop and waits up to one second for it.
    ///
    /// After the deadline the thread is detached; it exits at its next poll.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        let Some(handle) = self.thread.take() else {
            return;
        };

        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while !handle.is_finished() {
            if std::time::Instant::now() >= deadline {
                tracing::warn!("capture thread did not stop within 1s, detaching");
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        if handle.join().is_err() {
            tracing::error!("capture thread panicked");
        }
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Push-driven capture used for pipes and tests.
///
/// Unlike the capture thread, `push` waits for channel space.
pub struct ManualFeed {
    cutter: FrameCutter,
    gate: Arc<MuteGate>,
    tx: mpsc::Sender<CapturedFrame>,
}

impl ManualFeed {
    /// Pushes samples through gain, framing and the mute gate.
    ///
    /// # Returns
    /// Number of complete frames delivered
    pub async fn push(&mut self, samples: &[i16]) -> usize {
        let mut sent = 0;
        for frame in self.cutter.push(samples) {
            let muted = self.gate.is_muted();
            if self.tx.send(CapturedFrame { frame, muted }).await.is_err() {
                break;
            }
            sent += 1;
        }
        sent
    }

    pub fn mute_gate(&self) -> Arc<MuteGate> {
        Arc::clone(&self.gate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::source::MockAudioSource;

    #[test]
    fn test_gain_scales_and_clamps_without_wraparound() {
        let mut samples = vec![1000, -1000, 20000, -20000, i16::MAX, i16::MIN];
        apply_gain(&mut samples, 2.0);
        assert_eq!(samples, vec![2000, -2000, i16::MAX, i16::MIN, i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_unity_gain_is_identity() {
        let mut samples = vec![1, -2, 3];
        apply_gain(&mut samples, 1.0);
        assert_eq!(samples, vec![1, -2, 3]);
    }

    #[test]
    fn test_cutter_produces_fixed_frames_with_sample_timestamps() {
        let config = CaptureConfig::default();
        let base = Instant::now();
        let mut cutter = FrameCutter::new(&config, base);

        assert!(cutter.push(&[0; 200]).is_empty());
        let frames = cutter.push(&[0; 500]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples.len(), 320);
        assert_eq!(frames[0].timestamp, base);
        assert_eq!(frames[1].timestamp, base + Duration::from_millis(20));
        assert_eq!(frames[1].sequence, 1);

        let tail = cutter.finish().unwrap();
        assert_eq!(tail.samples.len(), 60);
        assert!(cutter.finish().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_unmute_applies_after_delay() {
        let gate = MuteGate::new();
        gate.mute();
        gate.unmute(Duration::from_millis(500));

        assert!(gate.is_muted());
        assert!(gate.unmute_pending());
        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(gate.is_muted());
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(!gate.is_muted());
        assert!(!gate.unmute_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mute_supersedes_pending_unmute() {
        let gate = MuteGate::new();
        gate.mute();
        gate.unmute(Duration::from_millis(500));
        tokio::time::sleep(Duration::from_millis(100)).await;
        gate.mute();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(gate.is_muted());
        assert!(!gate.unmute_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmute_now_bypasses_delay() {
        let gate = MuteGate::new();
        gate.mute();
        gate.unmute(Duration::from_millis(500));
        gate.unmute_now();
        assert!(!gate.is_muted());

        // A later mute must not be undone by the cancelled delayed unmute
        gate.mute();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(gate.is_muted());
    }

    #[test]
    fn test_unmute_outside_runtime_is_immediate() {
        let gate = MuteGate::new();
        gate.mute();
        gate.unmute(Duration::from_millis(500));
        assert!(!gate.is_muted());
    }

    #[tokio::test]
    async fn test_manual_feed_tags_mute_state() {
        let gate = MuteGate::new();
        let (mut feed, mut rx) = Capture::manual(CaptureConfig::default(), Arc::clone(&gate));

        assert_eq!(feed.push(&[100; 320]).await, 1);
        gate.mute();
        assert_eq!(feed.push(&[100; 320]).await, 1);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(!first.muted);
        assert!(second.muted);
        assert_eq!(second.frame.sequence, 1);
    }

    #[test]
    fn test_capture_thread_delivers_frames_from_finite_source() {
        let source = MockAudioSource::new().with_chunks(vec![vec![500; 320], vec![500; 640]]);
        let stops = source.stop_counter();
        let events = EventBus::new();
        let event_rx = events.subscribe();

        let (capture, mut rx) = Capture::spawn(
            Box::new(source),
            CaptureConfig::default(),
            MuteGate::new(),
            events,
        )
        .unwrap();

        let mut frames = Vec::new();
        while let Some(captured) = rx.blocking_recv() {
            frames.push(captured);
        }
        capture.stop();

        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| !f.muted));
        assert_eq!(stops.load(Ordering::SeqCst), 1);

        let received: Vec<_> = event_rx.try_iter().collect();
        assert!(matches!(received.first(), Some(AssistantEvent::CaptureStarted)));
        assert!(matches!(received.last(), Some(AssistantEvent::CaptureStopped)));
    }

    #[test]
    fn test_capture_reports_no_audio_once() {
        let source = MockAudioSource::new().with_samples(vec![]);
        let events = EventBus::new();
        let event_rx = events.subscribe();
        let config = CaptureConfig {
            no_audio_timeout: Duration::from_millis(30),
            ..Default::default()
        };

        let (capture, _rx) =
            Capture::spawn(Box::new(source), config, MuteGate::new(), events).unwrap();
        thread::sleep(Duration::from_millis(150));
        capture.stop();

        let no_audio = event_rx
            .try_iter()
            .filter(|e| matches!(e, AssistantEvent::CaptureNoAudio { .. }))
            .count();
        assert_eq!(no_audio, 1);
    }

    #[test]
    fn test_start_failure_is_returned() {
        let source = MockAudioSource::new().with_start_failure();
        let result = Capture::spawn(
            Box::new(source),
            CaptureConfig::default(),
            MuteGate::new(),
            EventBus::new(),
        );
        assert!(result.is_err());
    }
}

//! Default configuration constants for razor-voice.
//!
//! Shared by the config sections and the component configs they convert into,
//! so a component built without a config file behaves like one built from an
//! empty one.

/// Default audio sample rate in Hz.
///
/// 16kHz is the standard for speech recognition and what the wake engines and
/// transcription providers expect.
pub const SAMPLE_RATE: u32 = 16000;

/// Length of one capture frame in milliseconds (320 samples at 16kHz).
pub const FRAME_MS: u32 = 20;

/// Default software gain applied to captured samples.
pub const GAIN: f32 = 1.0;

/// Capture emits `capture_no_audio` if nothing arrives within this window.
pub const NO_AUDIO_TIMEOUT_MS: u64 = 3000;

/// Capacity of the frame channel between the capture thread and the router.
///
/// 100 frames is two seconds of audio; the capture thread drops frames
/// rather than block once it is full.
pub const FRAME_CHANNEL_CAPACITY: usize = 100;

/// Default Voice Activity Detection (VAD) threshold.
///
/// RMS over samples normalized to [-1, 1]. 0.02 is tuned for typical
/// microphone input levels.
pub const VAD_THRESHOLD: f32 = 0.02;

/// Minimum voiced span before a segment is announced.
pub const MIN_SPEECH_MS: u32 = 250;

/// Silence duration in milliseconds before a speech segment is closed.
pub const SILENCE_DURATION_MS: u32 = 700;

/// Barge-in threshold is the VAD threshold times this multiplier.
///
/// Speaker bleed into the microphone sits well above the VAD threshold, so
/// the interrupt detector needs a much louder signal than ordinary speech.
pub const INTERRUPT_THRESHOLD_MULTIPLIER: f32 = 3.0;

/// Consecutive above-threshold frames needed to declare a barge-in.
pub const INTERRUPT_CONSECUTIVE_FRAMES: u32 = 3;

/// Delay before the microphone re-opens after playback finishes.
pub const UNMUTE_DELAY_MS: u64 = 500;

/// Pre-roll ring buffer window in milliseconds.
pub const RING_BUFFER_WINDOW_MS: u64 = 3000;

/// How far before the wake detection the replay into the command stream starts.
pub const WAKE_LOOKBACK_MS: u64 = 700;

/// Bound on one batch transcription used for transcript-mode wake checks.
pub const WAKE_TRANSCRIPTION_TIMEOUT_MS: u64 = 5000;

/// Wake phrase variants, including the common mis-recognitions of "hey razor".
pub const WAKE_PHRASES: &[&str] = &[
    "hey razor",
    "hey razer",
    "hey raiser",
    "a razor",
    "hey rosa",
    "hay razor",
    "hey laser",
];

/// Trailing silence after a non-terminal utterance before the command is finished.
pub const SENTENCE_SILENCE_MS: u64 = 800;

/// Hard limit on one command-capture session.
pub const COMMAND_TIMEOUT_MS: u64 = 10_000;

/// Word count at which a command without terminal punctuation is complete.
pub const MIN_COMMAND_WORDS: usize = 3;

/// Bound on opening a streaming transcription session.
pub const TRANSCRIPTION_CONNECT_TIMEOUT_MS: u64 = 3000;

/// Interval between output-device re-assertions during playback.
pub const DEVICE_ENFORCE_INTERVAL_MS: u64 = 200;

/// Wait after forcing the output device before verifying it.
pub const DEVICE_SETTLE_MS: u64 = 100;

/// Bound on one call to the device routing utility.
pub const DEVICE_COMMAND_TIMEOUT_MS: u64 = 2000;

/// Bound on one speech synthesis call.
pub const SYNTH_TIMEOUT_MS: u64 = 15_000;

/// Extra time granted to the player process beyond the audio duration.
pub const PLAYBACK_TIMEOUT_MARGIN_MS: u64 = 5000;

/// Default player used by `CommandAudioSink`.
pub const PLAYER_COMMAND: &str = "afplay";

/// Bluetooth connectivity poll interval.
pub const BLUETOOTH_POLL_INTERVAL_MS: u64 = 5000;

/// Reconnect tries after a Bluetooth disconnect.
pub const BLUETOOTH_RECONNECT_ATTEMPTS: u32 = 3;

/// Wait between Bluetooth reconnect tries.
pub const BLUETOOTH_RECONNECT_WAIT_MS: u64 = 2000;

/// Output drift is checked every this many stable polls.
pub const BLUETOOTH_DRIFT_CHECK_EVERY: u32 = 6;

/// Idle time before the attention window falls asleep.
pub const ATTENTION_WINDOW_SECS: u64 = 300;

/// Follow-up capture stays suppressed this long after playback ends.
pub const FOLLOW_UP_GRACE_MS: u64 = 500;

/// Watchdog on the processing state.
pub const PROCESSING_TIMEOUT_MS: u64 = 30_000;

/// Recovery delay out of the error state.
pub const ERROR_RECOVERY_MS: u64 = 2000;

/// Safety net for a pipeline left in the interrupted state.
pub const INTERRUPTED_TIMEOUT_MS: u64 = 5000;

/// Higher modes (briefing, research, coaching, learning) fall back to listening after this.
pub const MODE_TIMEOUT_MS: u64 = 600_000;

/// Transition history kept by the state machine.
pub const STATE_HISTORY_LIMIT: usize = 500;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_is_twenty_ms_at_sample_rate() {
        assert_eq!(SAMPLE_RATE * FRAME_MS / 1000, 320);
    }

    #[test]
    fn lookback_fits_inside_ring_window() {
        assert!(WAKE_LOOKBACK_MS < RING_BUFFER_WINDOW_MS);
    }

    #[test]
    fn wake_phrases_are_lowercase() {
        for phrase in WAKE_PHRASES {
            assert_eq!(*phrase, phrase.to_lowercase());
        }
    }
}

use crate::audio::{CaptureConfig, VadConfig};
use crate::bluetooth::LinkMonitorConfig;
use crate::command::{CompletionPolicy, SessionConfig};
use crate::defaults;
use crate::error::{Result, VoiceError};
use crate::interrupt::InterruptConfig;
use crate::playback::{PaceConfig, PlaybackConfig};
use crate::state::StateTimeouts;
use crate::wake::{WakePhrases, WakeStrategy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
#[cfg(feature = "cli")]
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub vad: VadSection,
    pub wake: WakeConfig,
    pub command: CommandConfig,
    pub interrupt: InterruptSection,
    pub playback: PlaybackSection,
    pub bluetooth: BluetoothConfig,
    pub attention: AttentionConfig,
    pub states: StatesConfig,
}

/// Audio capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    /// Input device name, `None` for the system default.
    pub input_device: Option<String>,
    pub sample_rate: u32,
    pub frame_ms: u32,
    pub gain: f32,
    pub no_audio_timeout_ms: u64,
    /// Delay before the microphone re-opens after playback.
    pub unmute_delay_ms: u64,
}

/// Voice activity detection configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VadSection {
    pub threshold: f32,
    pub min_speech_ms: u32,
    pub silence_ms: u32,
}

/// Wake detection configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WakeConfig {
    pub strategy: WakeStrategy,
    /// Phrase variants matched in transcripts, mis-hearings included.
    pub phrases: Vec<String>,
    pub ring_buffer_ms: u64,
    pub lookback_ms: u64,
    pub transcription_timeout_ms: u64,
}

/// Command capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CommandConfig {
    pub min_words: usize,
    pub sentence_silence_ms: u64,
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

/// Barge-in configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InterruptSection {
    pub enabled: bool,
    /// Barge-in threshold as a multiple of the VAD threshold.
    pub threshold_multiplier: f32,
    pub consecutive_frames: u32,
}

/// Playback configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackSection {
    /// Output device pinned during playback, `None` to leave routing alone.
    pub output_device: Option<String>,
    pub player: String,
    pub rate: f32,
    pub volume: Option<f32>,
    pub enforce_interval_ms: u64,
    pub settle_ms: u64,
    pub timeout_margin_ms: u64,
    pub synth_timeout_ms: u64,
}

/// Bluetooth link monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Paired headset name. The monitor is disabled when unset.
    pub device: Option<String>,
    pub poll_interval_ms: u64,
    pub reconnect_attempts: u32,
    pub reconnect_wait_ms: u64,
    pub drift_check_every: u32,
}

/// Attention window configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AttentionConfig {
    pub window_secs: u64,
    pub follow_up_grace_ms: u64,
}

/// Per-state timeouts in milliseconds. Zero disables a timeout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StatesConfig {
    pub processing_timeout_ms: u64,
    pub error_recovery_ms: u64,
    pub interrupted_timeout_ms: u64,
    pub mode_timeout_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            sample_rate: defaults::SAMPLE_RATE,
            frame_ms: defaults::FRAME_MS,
            gain: defaults::GAIN,
            no_audio_timeout_ms: defaults::NO_AUDIO_TIMEOUT_MS,
            unmute_delay_ms: defaults::UNMUTE_DELAY_MS,
        }
    }
}

impl Default for VadSection {
    fn default() -> Self {
        Self {
            threshold: defaults::VAD_THRESHOLD,
            min_speech_ms: defaults::MIN_SPEECH_MS,
            silence_ms: defaults::SILENCE_DURATION_MS,
        }
    }
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            strategy: WakeStrategy::default(),
            phrases: defaults::WAKE_PHRASES.iter().map(|s| s.to_string()).collect(),
            ring_buffer_ms: defaults::RING_BUFFER_WINDOW_MS,
            lookback_ms: defaults::WAKE_LOOKBACK_MS,
            transcription_timeout_ms: defaults::WAKE_TRANSCRIPTION_TIMEOUT_MS,
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            min_words: defaults::MIN_COMMAND_WORDS,
            sentence_silence_ms: defaults::SENTENCE_SILENCE_MS,
            timeout_ms: defaults::COMMAND_TIMEOUT_MS,
            connect_timeout_ms: defaults::TRANSCRIPTION_CONNECT_TIMEOUT_MS,
        }
    }
}

impl Default for InterruptSection {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_multiplier: defaults::INTERRUPT_THRESHOLD_MULTIPLIER,
            consecutive_frames: defaults::INTERRUPT_CONSECUTIVE_FRAMES,
        }
    }
}

impl Default for PlaybackSection {
    fn default() -> Self {
        Self {
            output_device: None,
            player: defaults::PLAYER_COMMAND.to_string(),
            rate: 1.0,
            volume: None,
            enforce_interval_ms: defaults::DEVICE_ENFORCE_INTERVAL_MS,
            settle_ms: defaults::DEVICE_SETTLE_MS,
            timeout_margin_ms: defaults::PLAYBACK_TIMEOUT_MARGIN_MS,
            synth_timeout_ms: defaults::SYNTH_TIMEOUT_MS,
        }
    }
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            device: None,
            poll_interval_ms: defaults::BLUETOOTH_POLL_INTERVAL_MS,
            reconnect_attempts: defaults::BLUETOOTH_RECONNECT_ATTEMPTS,
            reconnect_wait_ms: defaults::BLUETOOTH_RECONNECT_WAIT_MS,
            drift_check_every: defaults::BLUETOOTH_DRIFT_CHECK_EVERY,
        }
    }
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            window_secs: defaults::ATTENTION_WINDOW_SECS,
            follow_up_grace_ms: defaults::FOLLOW_UP_GRACE_MS,
        }
    }
}

impl Default for StatesConfig {
    fn default() -> Self {
        Self {
            processing_timeout_ms: defaults::PROCESSING_TIMEOUT_MS,
            error_recovery_ms: defaults::ERROR_RECOVERY_MS,
            interrupted_timeout_ms: defaults::INTERRUPTED_TIMEOUT_MS,
            mode_timeout_ms: defaults::MODE_TIMEOUT_MS,
        }
    }
}

fn invalid(key: &str, message: impl Into<String>) -> VoiceError {
    VoiceError::ConfigInvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only a missing file falls back to defaults; invalid TOML is an error.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e)
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound) =>
            {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.context(format!("failed to load config from {}", path.display()))),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - RAZOR_INPUT_DEVICE → audio.input_device
    /// - RAZOR_OUTPUT_DEVICE → playback.output_device
    /// - RAZOR_BLUETOOTH_DEVICE → bluetooth.device
    /// - RAZOR_WAKE_STRATEGY → wake.strategy (ignored with a warning if unknown)
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(device) = std::env::var("RAZOR_INPUT_DEVICE")
            && !device.is_empty()
        {
            self.audio.input_device = Some(device);
        }

        if let Ok(device) = std::env::var("RAZOR_OUTPUT_DEVICE")
            && !device.is_empty()
        {
            self.playback.output_device = Some(device);
        }

        if let Ok(device) = std::env::var("RAZOR_BLUETOOTH_DEVICE")
            && !device.is_empty()
        {
            self.bluetooth.device = Some(device);
        }

        if let Ok(strategy) = std::env::var("RAZOR_WAKE_STRATEGY")
            && !strategy.is_empty()
        {
            match strategy.parse() {
                Ok(strategy) => self.wake.strategy = strategy,
                Err(e) => tracing::warn!(error = %e, "ignoring RAZOR_WAKE_STRATEGY"),
            }
        }

        self
    }

    /// Checks value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 {
            return Err(invalid("audio.sample_rate", "must be greater than zero"));
        }
        if !(10..=100).contains(&self.audio.frame_ms) {
            return Err(invalid("audio.frame_ms", "must be between 10 and 100"));
        }
        if !(self.audio.gain > 0.0 && self.audio.gain <= 16.0) {
            return Err(invalid("audio.gain", "must be in (0, 16]"));
        }
        if !(self.vad.threshold > 0.0 && self.vad.threshold < 1.0) {
            return Err(invalid("vad.threshold", "must be in (0, 1)"));
        }
        if self.wake.phrases.iter().all(|p| p.trim().is_empty()) {
            return Err(invalid("wake.phrases", "at least one phrase is required"));
        }
        if self.wake.lookback_ms > self.wake.ring_buffer_ms {
            return Err(invalid(
                "wake.lookback_ms",
                format!(
                    "{}ms look-back exceeds the {}ms ring buffer",
                    self.wake.lookback_ms, self.wake.ring_buffer_ms
                ),
            ));
        }
        if self.command.min_words == 0 {
            return Err(invalid("command.min_words", "must be at least 1"));
        }
        if self.command.timeout_ms == 0 {
            return Err(invalid("command.timeout_ms", "must be greater than zero"));
        }
        if self.interrupt.threshold_multiplier < 1.0 {
            return Err(invalid(
                "interrupt.threshold_multiplier",
                "must be at least 1.0",
            ));
        }
        if self.interrupt.consecutive_frames == 0 {
            return Err(invalid("interrupt.consecutive_frames", "must be at least 1"));
        }
        if self.playback.rate <= 0.0 {
            return Err(invalid("playback.rate", "must be greater than zero"));
        }
        if let Some(volume) = self.playback.volume
            && !(0.0..=1.0).contains(&volume)
        {
            return Err(invalid("playback.volume", "must be between 0.0 and 1.0"));
        }
        if self.playback.enforce_interval_ms == 0 {
            return Err(invalid(
                "playback.enforce_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.bluetooth.poll_interval_ms == 0 {
            return Err(invalid(
                "bluetooth.poll_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.attention.window_secs == 0 {
            return Err(invalid("attention.window_secs", "must be greater than zero"));
        }
        Ok(())
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            sample_rate: self.audio.sample_rate,
            frame_ms: self.audio.frame_ms,
            gain: self.audio.gain,
            no_audio_timeout: Duration::from_millis(self.audio.no_audio_timeout_ms),
            channel_capacity: defaults::FRAME_CHANNEL_CAPACITY,
        }
    }

    pub fn vad_config(&self) -> VadConfig {
        VadConfig {
            speech_threshold: self.vad.threshold,
            silence_duration_ms: self.vad.silence_ms,
            min_speech_ms: self.vad.min_speech_ms,
        }
    }

    pub fn interrupt_config(&self) -> InterruptConfig {
        InterruptConfig::from_vad(
            self.vad.threshold,
            self.interrupt.threshold_multiplier,
            self.interrupt.consecutive_frames,
        )
    }

    pub fn wake_phrases(&self) -> Result<WakePhrases> {
        WakePhrases::new(self.wake.phrases.as_slice())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            sample_rate: self.audio.sample_rate,
            connect_timeout: Duration::from_millis(self.command.connect_timeout_ms),
            sentence_silence: Duration::from_millis(self.command.sentence_silence_ms),
            hard_timeout: Duration::from_millis(self.command.timeout_ms),
            policy: CompletionPolicy::new(self.command.min_words),
        }
    }

    pub fn playback_config(&self) -> PlaybackConfig {
        PlaybackConfig {
            output_device: non_empty(self.playback.output_device.clone()),
            enforce_interval: Duration::from_millis(self.playback.enforce_interval_ms),
            settle: Duration::from_millis(self.playback.settle_ms),
            timeout_margin: Duration::from_millis(self.playback.timeout_margin_ms),
            pace: PaceConfig {
                rate: self.playback.rate,
                volume: self.playback.volume,
            },
        }
    }

    /// Link monitor settings, `None` when no headset is configured.
    pub fn link_monitor_config(&self) -> Option<LinkMonitorConfig> {
        let device = non_empty(self.bluetooth.device.clone())?;
        Some(LinkMonitorConfig {
            poll_interval: Duration::from_millis(self.bluetooth.poll_interval_ms),
            reconnect_attempts: self.bluetooth.reconnect_attempts,
            reconnect_wait: Duration::from_millis(self.bluetooth.reconnect_wait_ms),
            drift_check_every: self.bluetooth.drift_check_every,
            ..LinkMonitorConfig::new(&device)
        })
    }

    pub fn state_timeouts(&self) -> StateTimeouts {
        let ms = |value: u64| (value > 0).then(|| Duration::from_millis(value));
        StateTimeouts {
            processing: ms(self.states.processing_timeout_ms),
            error_recovery: ms(self.states.error_recovery_ms),
            interrupted: ms(self.states.interrupted_timeout_ms),
            mode: ms(self.states.mode_timeout_ms),
        }
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/razor-voice/config.toml on Linux
    #[cfg(feature = "cli")]
    pub fn default_path() -> anyhow::Result<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("could not determine config directory"))?;
        Ok(dir.join("razor-voice").join("config.toml"))
    }
}

//! Audio output sinks.

use crate::audio::frame::samples_to_duration;
use crate::audio::wav::encode_wav;
use crate::defaults;
use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use std::io::Write;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Synthesized speech ready to play.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub samples: Arc<[i16]>,
    pub sample_rate: u32,
    /// The text this audio speaks.
    pub text: String,
}

impl SynthesizedAudio {
    pub fn new(samples: Vec<i16>, sample_rate: u32, text: &str) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            text: text.to_string(),
        }
    }

    pub fn duration(&self) -> Duration {
        samples_to_duration(self.samples.len(), self.sample_rate)
    }
}

/// Playback pacing passed through to the sink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PaceConfig {
    /// Playback rate multiplier, 1.0 is normal speed.
    pub rate: f32,
    /// Output volume in 0.0..=1.0, `None` leaves the system volume alone.
    pub volume: Option<f32>,
}

impl Default for PaceConfig {
    fn default() -> Self {
        Self {
            rate: 1.0,
            volume: None,
        }
    }
}

impl PaceConfig {
    /// Wall-clock time `audio` takes at this rate.
    pub fn scaled(&self, audio: Duration) -> Duration {
        if self.rate > 0.0 {
            audio.div_f32(self.rate)
        } else {
            audio
        }
    }
}

/// How a sink's `play` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkCompletion {
    Finished,
    /// Stopped by [`AudioSink::interrupt`].
    Killed,
}

/// Plays audio buffers.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Plays `audio` and resolves when it ends or is killed.
    async fn play(&self, audio: &SynthesizedAudio, pace: &PaceConfig) -> Result<SinkCompletion>;

    /// Kills in-flight playback. Returns `false` if nothing was playing.
    fn interrupt(&self) -> bool;

    fn is_playing(&self) -> bool;
}

/// Sink that writes a WAV file and runs an external player on it.
pub struct CommandAudioSink {
    player: String,
    kill: Mutex<Option<oneshot::Sender<()>>>,
}

impl CommandAudioSink {
    pub fn new(player: &str) -> Self {
        Self {
            player: player.to_string(),
            kill: Mutex::new(None),
        }
    }

    pub fn player(&self) -> &str {
        &self.player
    }

    fn player_args(&self, path: &str, pace: &PaceConfig) -> Vec<String> {
        let mut args = Vec::new();
        if self.player == defaults::PLAYER_COMMAND {
            if (pace.rate - 1.0).abs() > f32::EPSILON {
                args.push("-r".to_string());
                args.push(format!("{:.2}", pace.rate));
            }
            if let Some(volume) = pace.volume {
                args.push("-v".to_string());
                args.push(format!("{:.2}", volume.clamp(0.0, 1.0)));
            }
        }
        args.push(path.to_string());
        args
    }

    fn lock(&self) -> MutexGuard<'_, Option<oneshot::Sender<()>>> {
        self.kill.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for CommandAudioSink {
    fn default() -> Self {
        Self::new(defaults::PLAYER_COMMAND)
    }
}

#[async_trait]
impl AudioSink for CommandAudioSink {
    async fn play(&self, audio: &SynthesizedAudio, pace: &PaceConfig) -> Result<SinkCompletion> {
        let wav = encode_wav(&audio.samples, audio.sample_rate)?;
        let mut file = tempfile::Builder::new()
            .prefix("razor-reply-")
            .suffix(".wav")
            .tempfile()?;
        file.write_all(&wav)?;
        file.flush()?;
        let path = file.path().to_string_lossy().to_string();

        let mut child = Command::new(&self.player)
            .args(self.player_args(&path, pace))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    VoiceError::ToolNotFound {
                        tool: self.player.clone(),
                    }
                } else {
                    VoiceError::Playback {
                        message: format!("failed to start {}: {}", self.player, e),
                    }
                }
            })?;

        let (kill_tx, kill_rx) = oneshot::channel();
        *self.lock() = Some(kill_tx);
        debug!(player = %self.player, path = %path, "Player started");

        let result = tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) if status.success() => Ok(SinkCompletion::Finished),
                    Ok(status) => Err(VoiceError::Playback {
                        message: format!("{} exited with {}", self.player, status),
                    }),
                    Err(e) => Err(VoiceError::Playback {
                        message: format!("failed waiting for {}: {}", self.player, e),
                    }),
                }
            }
            _ = kill_rx => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill player");
                }
                Ok(SinkCompletion::Killed)
            }
        };

        self.lock().take();
        drop(file);
        result
    }

    fn interrupt(&self) -> bool {
        match self.lock().take() {
            Some(kill) => kill.send(()).is_ok(),
            None => false,
        }
    }

    fn is_playing(&self) -> bool {
        self.lock().is_some()
    }
}

#[derive(Debug, Default)]
struct MockSinkState {
    kill: Option<oneshot::Sender<()>>,
    played: Vec<String>,
    fail: bool,
    hang: bool,
    fixed_duration: Option<Duration>,
}

/// Mock sink for testing. Clones share state.
///
/// Playback "takes" the audio duration (tokio time) unless configured
/// otherwise.
#[derive(Debug, Clone, Default)]
pub struct MockAudioSink {
    state: Arc<Mutex<MockSinkState>>,
    interrupts: Arc<AtomicUsize>,
}

impl MockAudioSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every play call fails immediately.
    pub fn with_failure(self) -> Self {
        self.lock().fail = true;
        self
    }

    /// Playback never finishes on its own.
    pub fn with_hang(self) -> Self {
        self.lock().hang = true;
        self
    }

    /// Playback takes this long regardless of the audio length.
    pub fn with_duration(self, duration: Duration) -> Self {
        self.lock().fixed_duration = Some(duration);
        self
    }

    /// Texts of every buffer passed to `play`.
    pub fn played(&self) -> Vec<String> {
        self.lock().played.clone()
    }

    /// Successful interrupts.
    pub fn interrupt_count(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, MockSinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl AudioSink for MockAudioSink {
    async fn play(&self, audio: &SynthesizedAudio, pace: &PaceConfig) -> Result<SinkCompletion> {
        let (kill_rx, hang, duration) = {
            let mut state = self.lock();
            state.played.push(audio.text.clone());
            if state.fail {
                return Err(VoiceError::Playback {
                    message: "mock sink failure".to_string(),
                });
            }
            let (tx, rx) = oneshot::channel();
            state.kill = Some(tx);
            let duration = state
                .fixed_duration
                .unwrap_or_else(|| pace.scaled(audio.duration()));
            (rx, state.hang, duration)
        };

        let completion = if hang {
            match kill_rx.await {
                Ok(()) => SinkCompletion::Killed,
                Err(_) => SinkCompletion::Finished,
            }
        } else {
            tokio::select! {
                _ = tokio::time::sleep(duration) => SinkCompletion::Finished,
                _ = kill_rx => SinkCompletion::Killed,
            }
        };

        self.lock().kill = None;
        Ok(completion)
    }

    fn interrupt(&self) -> bool {
        let kill = self.lock().kill.take();
        match kill {
            Some(kill) => {
                let sent = kill.send(()).is_ok();
                if sent {
                    self.interrupts.fetch_add(1, Ordering::SeqCst);
                }
                sent
            }
            None => false,
        }
    }

    fn is_playing(&self) -> bool {
        self.lock().kill.is_some()
    }
}

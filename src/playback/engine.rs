//! Playback with output-device enforcement.
//!
//! While a reply plays, the OS may move audio output elsewhere (a Bluetooth
//! headset reconnecting, another app grabbing the device). The engine pins the
//! configured output device before, during and after playback.

use super::sink::{AudioSink, PaceConfig, SinkCompletion, SynthesizedAudio};
use crate::audio::device::DeviceController;
use crate::defaults;
use crate::events::{AssistantEvent, EventBus};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Device to pin output to. `None` disables all device handling.
    pub output_device: Option<String>,
    pub enforce_interval: Duration,
    /// Wait between forcing the device and verifying it.
    pub settle: Duration,
    /// Added to the audio duration to bound a single playback.
    pub timeout_margin: Duration,
    pub pace: PaceConfig,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            output_device: None,
            enforce_interval: Duration::from_millis(defaults::DEVICE_ENFORCE_INTERVAL_MS),
            settle: Duration::from_millis(defaults::DEVICE_SETTLE_MS),
            timeout_margin: Duration::from_millis(defaults::PLAYBACK_TIMEOUT_MARGIN_MS),
            pace: PaceConfig::default(),
        }
    }
}

/// How a playback ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Finished,
    Interrupted,
    Failed(String),
}

/// Aborts the enforcement task when dropped, so every exit path of a
/// playback (including cancellation of the `play` future) stops it.
#[derive(Default)]
struct EnforcementGuard(Option<JoinHandle<()>>);

impl EnforcementGuard {
    fn stop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

impl Drop for EnforcementGuard {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ActiveSession {
    id: u64,
    enforcement: EnforcementGuard,
    /// Wakes the sink wait when the session is interrupted.
    cancel: Arc<Notify>,
    interrupted: bool,
}

#[derive(Default)]
struct EngineState {
    next_id: u64,
    active: Option<ActiveSession>,
}

fn lock_state(state: &Mutex<EngineState>) -> MutexGuard<'_, EngineState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Claim on the engine taken before the audio exists.
///
/// While a ticket is held the engine counts as playing and `interrupt`
/// is recorded against it, so a barge-in during synthesis cancels the reply
/// before any audio is played. Dropping the ticket releases the engine.
pub struct PlaybackTicket {
    id: u64,
    state: Arc<Mutex<EngineState>>,
}

impl PlaybackTicket {
    /// Ends the session. Returns whether it was interrupted.
    fn release(&self) -> bool {
        let mut state = lock_state(&self.state);
        match state.active.take() {
            Some(session) if session.id == self.id => session.interrupted,
            other => {
                state.active = other;
                false
            }
        }
    }
}

impl Drop for PlaybackTicket {
    fn drop(&mut self) {
        self.release();
    }
}

/// Plays synthesized replies one at a time.
pub struct PlaybackEngine {
    sink: Arc<dyn AudioSink>,
    devices: Arc<dyn DeviceController>,
    config: PlaybackConfig,
    events: EventBus,
    state: Arc<Mutex<EngineState>>,
}

impl PlaybackEngine {
    pub fn new(
        sink: Arc<dyn AudioSink>,
        devices: Arc<dyn DeviceController>,
        config: PlaybackConfig,
        events: EventBus,
    ) -> Self {
        Self {
            sink,
            devices,
            config,
            events,
            state: Arc::new(Mutex::new(EngineState::default())),
        }
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    /// Claims the engine for an upcoming reply. `None` if one is active.
    pub fn reserve(&self) -> Option<PlaybackTicket> {
        let mut state = self.lock();
        if state.active.is_some() {
            return None;
        }
        state.next_id += 1;
        let id = state.next_id;
        state.active = Some(ActiveSession {
            id,
            enforcement: EnforcementGuard::default(),
            cancel: Arc::new(Notify::new()),
            interrupted: false,
        });
        Some(PlaybackTicket {
            id,
            state: Arc::clone(&self.state),
        })
    }

    /// Plays `audio` to completion, interruption or failure.
    ///
    /// A call made while another reply is playing is refused without events.
    pub async fn play(&self, audio: SynthesizedAudio) -> PlaybackOutcome {
        let Some(ticket) = self.reserve() else {
            warn!("Playback requested while another reply is playing");
            return PlaybackOutcome::Failed("playback already in progress".to_string());
        };
        self.play_reserved(ticket, audio).await
    }

    /// Plays `audio` under an existing reservation.
    ///
    /// Emits `playback_started` once audio begins, then exactly one of
    /// `playback_finished`, `playback_interrupted` or `playback_failed`. A
    /// reservation interrupted before audio began only emits
    /// `playback_interrupted`.
    pub async fn play_reserved(
        &self,
        ticket: PlaybackTicket,
        audio: SynthesizedAudio,
    ) -> PlaybackOutcome {
        if let Some(device) = self.config.output_device.as_deref()
            && !self.is_interrupted(&ticket)
        {
            self.prepare_device(device).await;
        }

        let cancel = {
            let mut state = self.lock();
            match state.active.as_mut() {
                Some(session) if session.id == ticket.id && !session.interrupted => {
                    if let Some(device) = self.config.output_device.clone() {
                        session.enforcement = EnforcementGuard(Some(self.spawn_enforcement(device)));
                    }
                    Some(Arc::clone(&session.cancel))
                }
                _ => None,
            }
        };

        let duration = audio.duration();
        let limit = self.config.pace.scaled(duration) + self.config.timeout_margin;
        let result = match cancel {
            None => {
                info!("Playback cancelled before audio started");
                None
            }
            Some(cancel) => {
                info!(
                    duration_ms = duration.as_millis() as u64,
                    text = %audio.text,
                    "Playback started"
                );
                self.events.emit(AssistantEvent::PlaybackStarted {
                    text: audio.text.clone(),
                    duration_ms: duration.as_millis() as u64,
                });

                let playing = async {
                    tokio::select! {
                        biased;
                        result = self.sink.play(&audio, &self.config.pace) => result,
                        _ = cancel.notified() => Ok(SinkCompletion::Killed),
                    }
                };
                Some(tokio::time::timeout(limit, playing).await)
            }
        };

        let interrupted = ticket.release();

        if let Some(device) = self.config.output_device.as_deref()
            && let Err(e) = self.devices.ensure_output_device(device).await
        {
            debug!(device, error = %e, "Post-playback device restore failed");
        }

        let outcome = match result {
            None => PlaybackOutcome::Interrupted,
            Some(Ok(Ok(SinkCompletion::Killed))) => PlaybackOutcome::Interrupted,
            Some(Ok(Ok(SinkCompletion::Finished))) if interrupted => PlaybackOutcome::Interrupted,
            Some(Ok(Ok(SinkCompletion::Finished))) => PlaybackOutcome::Finished,
            Some(Ok(Err(e))) => PlaybackOutcome::Failed(e.to_string()),
            Some(Err(_)) => {
                self.sink.interrupt();
                PlaybackOutcome::Failed(format!(
                    "playback did not finish within {}ms",
                    limit.as_millis()
                ))
            }
        };

        match &outcome {
            PlaybackOutcome::Finished => {
                info!("Playback finished");
                self.events.emit(AssistantEvent::PlaybackFinished);
            }
            PlaybackOutcome::Interrupted => {
                info!("Playback interrupted");
                self.events.emit(AssistantEvent::PlaybackInterrupted);
            }
            PlaybackOutcome::Failed(error) => {
                warn!(error = %error, "Playback failed");
                self.events.emit(AssistantEvent::PlaybackFailed {
                    error: error.clone(),
                });
            }
        }
        outcome
    }

    /// Kills the current playback.
    ///
    /// Stops device enforcement before killing the sink. Returns `false`,
    /// with no event and no error, if nothing is playing or the current
    /// playback was already interrupted.
    pub fn interrupt(&self) -> bool {
        {
            let mut state = self.lock();
            match state.active.as_mut() {
                Some(session) if !session.interrupted => {
                    session.interrupted = true;
                    session.enforcement.stop();
                    session.cancel.notify_one();
                }
                _ => return false,
            }
        }

        let killed = self.sink.interrupt();
        debug!(killed, "Playback interrupt requested");
        true
    }

    /// True from reservation until the playback has fully ended.
    pub fn is_playing(&self) -> bool {
        self.lock().active.is_some()
    }

    fn is_interrupted(&self, ticket: &PlaybackTicket) -> bool {
        matches!(
            self.lock().active.as_ref(),
            Some(session) if session.id == ticket.id && session.interrupted
        )
    }

    /// Forces the output device, waits for it to settle and verifies it,
    /// forcing once more on mismatch.
    async fn prepare_device(&self, device: &str) {
        if let Err(e) = self.devices.ensure_output_device(device).await {
            warn!(device, error = %e, "Failed to select output device");
            return;
        }
        tokio::time::sleep(self.config.settle).await;

        match self.devices.current_output_device().await {
            Ok(current) if current == device => {}
            Ok(current) => {
                info!(expected = device, current = %current, "Output device mismatch, forcing again");
                if let Err(e) = self.devices.ensure_output_device(device).await {
                    warn!(device, error = %e, "Second output device switch failed");
                }
            }
            Err(e) => debug!(error = %e, "Could not verify output device"),
        }
    }

    fn spawn_enforcement(&self, device: String) -> JoinHandle<()> {
        let devices = Arc::clone(&self.devices);
        let interval = self.config.enforce_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = devices.ensure_output_device(&device).await {
                    debug!(device = %device, error = %e, "Device enforcement failed");
                }
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        lock_state(&self.state)
    }
}

//! Voice pipeline that runs from startup until shutdown.
//!
//! One conductor task owns the frame path (VAD, barge-in monitor, pre-roll
//! ring buffer, wake detector, active command session) and reacts to
//! transition events, session outcomes and playback outcomes. The state
//! machine is the only place state changes; the conductor requests
//! transitions and follows the ones it did not request (state timeouts,
//! modes entered through the handle).

use crate::attention::{AttentionGate, AttentionWindow, FollowUpGrace};
use crate::audio::capture::{CapturedFrame, MuteGate};
use crate::audio::device::DeviceController;
use crate::audio::vad::{Vad, VadConfig, VadEvent};
use crate::bluetooth::{BluetoothController, LinkMonitor, LinkMonitorConfig};
use crate::command::{CommandOutcome, CommandRequest, CommandSession, SessionConfig};
use crate::config::Config;
use crate::defaults;
use crate::error::{Result, VoiceError};
use crate::events::{AssistantEvent, CommandSource, EventBus, WakeReason};
use crate::interrupt::{InterruptConfig, InterruptMonitor};
use crate::pipeline::error::{ComponentError, ErrorContext, ErrorReporter, LogReporter};
use crate::playback::{
    AudioSink, PlaybackConfig, PlaybackEngine, PlaybackOutcome, Synthesizer,
    synthesize_with_timeout,
};
use crate::state::{
    MachineSnapshot, PipelineState, StateMachine, StateSnapshot, StateTimeouts, SubscriptionId,
    TransitionEvent, Trigger,
};
use crate::stt::{Transcriber, TranscriptionProvider};
use crate::wake::{
    KeywordSpotter, KeywordWake, RingBuffer, TranscriptWake, WakeDetector, WakeEvent,
    WakePhrases, WakeStrategy,
};
use crossbeam_channel::Receiver;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub vad: VadConfig,
    /// Barge-in detection, `None` to disable it.
    pub interrupt: Option<InterruptConfig>,
    /// Pre-roll kept for replay into the command stream.
    pub ring_window: Duration,
    /// How far before a wake detection the replay starts.
    pub wake_lookback: Duration,
    pub session: SessionConfig,
    pub playback: PlaybackConfig,
    /// Microphone re-open delay after a reply finishes.
    pub unmute_delay: Duration,
    pub synth_timeout: Duration,
    pub attention_window: Duration,
    pub follow_up_grace: Duration,
    pub timeouts: StateTimeouts,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            vad: VadConfig::default(),
            interrupt: Some(InterruptConfig::default()),
            ring_window: Duration::from_millis(defaults::RING_BUFFER_WINDOW_MS),
            wake_lookback: Duration::from_millis(defaults::WAKE_LOOKBACK_MS),
            session: SessionConfig::default(),
            playback: PlaybackConfig::default(),
            unmute_delay: Duration::from_millis(defaults::UNMUTE_DELAY_MS),
            synth_timeout: Duration::from_millis(defaults::SYNTH_TIMEOUT_MS),
            attention_window: Duration::from_secs(defaults::ATTENTION_WINDOW_SECS),
            follow_up_grace: Duration::from_millis(defaults::FOLLOW_UP_GRACE_MS),
            timeouts: StateTimeouts::default(),
        }
    }
}

impl From<&Config> for PipelineConfig {
    fn from(config: &Config) -> Self {
        Self {
            vad: config.vad_config(),
            interrupt: config
                .interrupt
                .enabled
                .then(|| config.interrupt_config()),
            ring_window: Duration::from_millis(config.wake.ring_buffer_ms),
            wake_lookback: Duration::from_millis(config.wake.lookback_ms),
            session: config.session_config(),
            playback: config.playback_config(),
            unmute_delay: Duration::from_millis(config.audio.unmute_delay_ms),
            synth_timeout: Duration::from_millis(config.playback.synth_timeout_ms),
            attention_window: Duration::from_secs(config.attention.window_secs),
            follow_up_grace: Duration::from_millis(config.attention.follow_up_grace_ms),
            timeouts: config.state_timeouts(),
        }
    }
}

/// External capabilities the pipeline drives.
pub struct Collaborators {
    pub wake: WakeDetector,
    /// Stripped from the first transcript segment of a command. Defaults to
    /// the transcript detector's phrases.
    pub phrases: Option<Arc<WakePhrases>>,
    pub transcription: Arc<dyn TranscriptionProvider>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub sink: Arc<dyn AudioSink>,
    pub devices: Arc<dyn DeviceController>,
    /// Headset link monitoring, `None` to disable it.
    pub bluetooth: Option<(Arc<dyn BluetoothController>, LinkMonitorConfig)>,
}

/// Builds the wake detector `config` asks for.
///
/// The keyword strategy needs a spotter; without one the transcript strategy
/// is used instead and a warning is logged.
pub fn select_wake_detector(
    config: &Config,
    spotter: Option<Box<dyn KeywordSpotter>>,
    transcriber: Arc<dyn Transcriber>,
) -> Result<WakeDetector> {
    let phrases = config.wake_phrases()?;
    match (config.wake.strategy, spotter) {
        (WakeStrategy::Keyword, Some(spotter)) => {
            Ok(WakeDetector::LowLatency(KeywordWake::new(spotter)))
        }
        (strategy, _) => {
            if strategy == WakeStrategy::Keyword {
                warn!("Keyword wake strategy requested without a keyword engine, using transcripts");
            }
            Ok(WakeDetector::Fallback(TranscriptWake::new(
                transcriber,
                phrases,
                Duration::from_millis(config.wake.transcription_timeout_ms),
            )))
        }
    }
}

enum Control {
    Reply {
        text: String,
        done: oneshot::Sender<PlaybackOutcome>,
    },
    Interrupt {
        done: oneshot::Sender<bool>,
    },
    Shutdown,
}

enum Internal {
    Transition(TransitionEvent),
    WakeChecked(Result<Option<WakeEvent>>),
    SessionDone {
        id: u64,
        outcome: CommandOutcome,
    },
    PlaybackDone {
        outcome: PlaybackOutcome,
        done: oneshot::Sender<PlaybackOutcome>,
    },
}

/// Voice pipeline: capture → VAD / barge-in / ring buffer → wake → command
/// session → reply playback.
pub struct VoicePipeline {
    config: PipelineConfig,
    collaborators: Collaborators,
    events: EventBus,
    reporter: Arc<dyn ErrorReporter>,
}

impl VoicePipeline {
    /// Creates a new pipeline with default error reporter.
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
            events: EventBus::new(),
            reporter: Arc::new(LogReporter),
        }
    }

    /// Sets a custom error reporter.
    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Subscribes before start, so no event is missed.
    pub fn subscribe(&self) -> Receiver<AssistantEvent> {
        self.events.subscribe()
    }

    /// Starts the pipeline.
    ///
    /// # Arguments
    /// * `frames` - Captured frames, e.g. from [`crate::audio::Capture::spawn`]
    /// * `gate` - The mute gate of the same capture
    ///
    /// # Returns
    /// Handle to control and stop the pipeline
    pub async fn start(
        self,
        frames: mpsc::Receiver<CapturedFrame>,
        gate: Arc<MuteGate>,
    ) -> PipelineHandle {
        let VoicePipeline {
            config,
            collaborators,
            events,
            reporter,
        } = self;

        let machine = StateMachine::new(config.timeouts);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let subscription = machine.subscribe({
            let events = events.clone();
            let internal_tx = internal_tx.clone();
            move |event: &TransitionEvent| {
                events.emit(AssistantEvent::Transition(event.clone()));
                if internal_tx.send(Internal::Transition(event.clone())).is_err() {
                    debug!("Transition after pipeline stopped");
                }
            }
        });

        let attention = AttentionWindow::new(config.attention_window, events.clone());
        let engine = Arc::new(PlaybackEngine::new(
            Arc::clone(&collaborators.sink),
            Arc::clone(&collaborators.devices),
            config.playback.clone(),
            events.clone(),
        ));

        let link = match collaborators.bluetooth {
            Some((controller, link_config)) => {
                let monitor = LinkMonitor::new(
                    controller,
                    Arc::clone(&collaborators.devices),
                    link_config,
                    events.clone(),
                );
                match monitor.start().await {
                    Ok(()) => Some(monitor),
                    Err(e) => {
                        reporter.report(
                            "bluetooth",
                            &ComponentError::Fatal(e.to_string()),
                            &ErrorContext {
                                state: machine.state(),
                                trigger: None,
                                elapsed: Duration::ZERO,
                            },
                        );
                        None
                    }
                }
            }
            None => None,
        };

        let phrases = collaborators.phrases.or_else(|| match &collaborators.wake {
            WakeDetector::Fallback(transcript) => Some(transcript.phrases()),
            WakeDetector::LowLatency(_) => None,
        });

        let conductor = Conductor {
            vad: Vad::new(config.vad),
            monitor: InterruptMonitor::new(config.interrupt.unwrap_or_default()),
            ring: RingBuffer::new(config.ring_window),
            gate_state: AttentionGate::new(
                attention.clone(),
                FollowUpGrace::new(config.follow_up_grace),
            ),
            wake: collaborators.wake,
            phrases,
            provider: collaborators.transcription,
            synthesizer: collaborators.synthesizer,
            engine,
            link,
            machine: Arc::clone(&machine),
            events: events.clone(),
            reporter,
            gate: Arc::clone(&gate),
            internal_tx,
            session: None,
            session_id: 0,
            wake_check_pending: false,
            playback_task: None,
            last_muted: gate.is_muted(),
            last_trigger: None,
            subscription,
            config,
        };

        if let Err(e) = machine.transition(PipelineState::Listening, Trigger::Startup, None) {
            warn!(error = %e, "Pipeline could not enter listening");
        }
        info!(strategy = %conductor.wake.strategy(), "Voice pipeline started");

        let (control, control_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(conductor.run(frames, control_rx, internal_rx));

        PipelineHandle {
            control,
            machine,
            events,
            attention,
            gate,
            task: Some(task),
        }
    }
}

/// Handle to a running pipeline.
pub struct PipelineHandle {
    control: mpsc::UnboundedSender<Control>,
    machine: Arc<StateMachine>,
    events: EventBus,
    attention: AttentionWindow,
    gate: Arc<MuteGate>,
    task: Option<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Speaks a reply and waits until it has finished, been interrupted or
    /// failed. The pipeline is back to listening when this returns.
    pub async fn reply(&self, text: &str) -> PlaybackOutcome {
        let (done, rx) = oneshot::channel();
        let request = Control::Reply {
            text: text.to_string(),
            done,
        };
        if self.control.send(request).is_err() {
            return PlaybackOutcome::Failed("pipeline is not running".to_string());
        }
        rx.await
            .unwrap_or_else(|_| PlaybackOutcome::Failed("pipeline shut down".to_string()))
    }

    /// Cuts off the current reply, as a barge-in would.
    ///
    /// Returns `false` if nothing was playing.
    pub async fn interrupt(&self) -> bool {
        let (done, rx) = oneshot::channel();
        if self.control.send(Control::Interrupt { done }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Enters a higher-level mode (briefing, researching, coaching, learning).
    pub fn enter_mode(&self, mode: PipelineState) -> Result<TransitionEvent> {
        if !mode.is_mode() {
            return Err(VoiceError::IllegalTransition {
                from: self.machine.state(),
                to: mode,
            });
        }
        let event = self
            .machine
            .transition(mode, Trigger::ModeRequested, None)?;
        self.attention.touch();
        Ok(event)
    }

    /// Returns to listening after a command that needs no reply, or to leave
    /// a mode.
    pub fn resume_listening(&self) -> Result<TransitionEvent> {
        Ok(self
            .machine
            .transition(PipelineState::Listening, Trigger::Manual, None)?)
    }

    pub fn subscribe(&self) -> Receiver<AssistantEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> PipelineState {
        self.machine.state()
    }

    pub fn snapshot(&self) -> MachineSnapshot {
        self.machine.snapshot()
    }

    /// Retained transition history, oldest first.
    pub fn history(&self) -> Vec<StateSnapshot> {
        self.machine.history()
    }

    pub fn attention(&self) -> &AttentionWindow {
        &self.attention
    }

    pub fn is_muted(&self) -> bool {
        self.gate.is_muted()
    }

    /// Returns true if the pipeline is running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stops the pipeline and waits up to one second for teardown.
    ///
    /// Cancels the command session, kills playback, stops the link monitor
    /// and every timer, and leaves the machine in idle.
    pub async fn shutdown(mut self) {
        if self.control.send(Control::Shutdown).is_err() {
            debug!("Pipeline already stopped");
        }
        let Some(task) = self.task.take() else {
            return;
        };
        let abort = task.abort_handle();
        match tokio::time::timeout(Duration::from_secs(1), task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_panic() => {
                tracing::error!("Pipeline conductor panicked: {}", panic_message(e.into_panic()));
            }
            Ok(Err(_)) => {}
            Err(_) => {
                warn!("Pipeline did not stop within 1s, aborting");
                abort.abort();
            }
        }
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        if self.task.is_some() && self.control.send(Control::Shutdown).is_err() {
            debug!("Pipeline already stopped");
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Owner of the frame path and everything that reacts to it.
struct Conductor {
    config: PipelineConfig,
    vad: Vad,
    monitor: InterruptMonitor,
    ring: RingBuffer,
    gate_state: AttentionGate,
    wake: WakeDetector,
    phrases: Option<Arc<WakePhrases>>,
    provider: Arc<dyn TranscriptionProvider>,
    synthesizer: Arc<dyn Synthesizer>,
    engine: Arc<PlaybackEngine>,
    link: Option<LinkMonitor>,
    machine: Arc<StateMachine>,
    events: EventBus,
    reporter: Arc<dyn ErrorReporter>,
    gate: Arc<MuteGate>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    session: Option<CommandSession>,
    session_id: u64,
    wake_check_pending: bool,
    playback_task: Option<JoinHandle<()>>,
    last_muted: bool,
    last_trigger: Option<Trigger>,
    subscription: SubscriptionId,
}

impl Conductor {
    async fn run(
        mut self,
        mut frames: mpsc::Receiver<CapturedFrame>,
        mut control: mpsc::UnboundedReceiver<Control>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let mut frames_open = true;
        loop {
            tokio::select! {
                biased;
                Some(message) = internal.recv() => self.on_internal(message),
                message = control.recv() => match message {
                    Some(Control::Shutdown) | None => break,
                    Some(message) => self.on_control(message),
                },
                frame = frames.recv(), if frames_open => match frame {
                    Some(captured) => self.on_frame(captured),
                    None => {
                        frames_open = false;
                        self.on_capture_closed();
                    }
                },
            }
        }
        self.teardown();
    }

    fn on_frame(&mut self, captured: CapturedFrame) {
        let CapturedFrame { frame, muted } = captured;

        if muted != self.last_muted {
            // Drop anything straddling a mute edge: it holds speaker audio.
            self.vad.reset();
            self.wake.reset();
            self.last_muted = muted;
        }

        self.ring.push(frame.clone());

        if self.monitor.is_armed() && self.monitor.process(&frame) {
            self.barge_in(Trigger::BargeIn, true);
        }

        let had_session = self.session.is_some();
        if !muted && let Some(session) = &self.session {
            session.feed(frame.clone());
        }

        match self.vad.process(&frame) {
            Some(VadEvent::SpeechStart { at }) => {
                self.events.emit(AssistantEvent::SpeechStart);
                if !muted {
                    self.on_speech_start(at);
                }
            }
            Some(VadEvent::SpeechEnd(segment)) => {
                self.events.emit(AssistantEvent::SpeechEnd {
                    duration_ms: segment.speech_ms,
                });
                if !muted && !had_session {
                    self.check_segment(segment);
                }
            }
            Some(VadEvent::Discarded { speech_ms }) => {
                debug!(speech_ms, "Discarded short noise burst");
            }
            None => {}
        }

        if muted || self.session.is_some() || !self.is_listening() {
            return;
        }
        if let WakeDetector::LowLatency(keyword) = &mut self.wake
            && let Some(wake) = keyword.process(&frame)
        {
            self.on_wake(wake);
        }
    }

    fn on_capture_closed(&mut self) {
        info!("Capture ended");
        if let Some(VadEvent::SpeechEnd(segment)) = self.vad.flush()
            && !self.last_muted
            && self.session.is_none()
        {
            self.check_segment(segment);
        }
    }

    fn on_speech_start(&mut self, at: Instant) {
        self.gate_state.window.touch();
        if self.session.is_some()
            || !self.is_listening()
            || !self.gate_state.accepts_follow_up()
        {
            return;
        }
        if let Err(e) = self
            .machine
            .transition(PipelineState::Processing, Trigger::FollowUp, None)
        {
            debug!(error = %e, "Follow-up not started");
            return;
        }
        info!("Follow-up speech, capturing command without wake phrase");
        self.wake.reset();
        let replay = self.ring.drain_since(self.lookback_from(at));
        self.start_session(CommandSource::FollowUp, replay, None);
    }

    /// Hands a finalized segment to the transcript strategy.
    fn check_segment(&mut self, segment: crate::audio::SpeechSegment) {
        let WakeDetector::Fallback(detector) = &self.wake else {
            return;
        };
        if !self.is_listening() || self.session.is_some() {
            return;
        }
        if self.wake_check_pending {
            debug!(speech_ms = segment.speech_ms, "Wake check already running, skipping segment");
            return;
        }
        self.wake_check_pending = true;
        let detector = detector.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = detector.check_segment(segment).await;
            if tx.send(Internal::WakeChecked(result)).is_err() {
                debug!("Wake check finished after pipeline stopped");
            }
        });
    }

    fn on_wake(&mut self, wake: WakeEvent) {
        let strategy = wake.strategy();
        info!(%strategy, command = ?wake.command, "Wake phrase detected");
        self.events.emit(AssistantEvent::Wake {
            strategy: strategy.to_string(),
            command: wake.command.clone(),
        });

        let metadata = json!({ "strategy": strategy.as_str() });
        if let Err(e) =
            self.machine
                .transition(PipelineState::Processing, Trigger::WakeWord, Some(metadata))
        {
            warn!(error = %e, "Wake ignored");
            return;
        }
        self.gate_state.window.wake(WakeReason::WakeWord);
        self.wake.reset();

        // Drained exactly once per wake, whether or not a stream needs it.
        let replay = self.ring.drain_since(self.lookback_from(wake.detected_at));
        match wake.command {
            Some(command) if self.config.session.policy.is_complete(&command) => {
                self.emit_command(command, CommandSource::WakeInline);
            }
            seed => self.start_session(CommandSource::Stream, replay, seed),
        }
    }

    fn start_session(
        &mut self,
        source: CommandSource,
        replay: Vec<crate::audio::AudioFrame>,
        seed: Option<String>,
    ) {
        self.session_id += 1;
        let id = self.session_id;
        let tx = self.internal_tx.clone();
        debug!(?source, replay_frames = replay.len(), "Starting command session");
        self.session = Some(CommandSession::spawn(
            Arc::clone(&self.provider),
            self.phrases.clone(),
            self.config.session.clone(),
            CommandRequest {
                source,
                replay,
                seed,
            },
            self.events.clone(),
            move |outcome| {
                if tx.send(Internal::SessionDone { id, outcome }).is_err() {
                    debug!("Command session ended after pipeline stopped");
                }
            },
        ));
    }

    fn cancel_session(&mut self) {
        if let Some(session) = self.session.take() {
            debug!("Cancelling command session");
            session.cancel();
        }
    }

    fn emit_command(&mut self, text: String, source: CommandSource) {
        info!(?source, text = %text, "Command");
        self.events.emit(AssistantEvent::Command { text, source });
        self.gate_state.window.wake(WakeReason::Command);
    }

    fn on_internal(&mut self, message: Internal) {
        match message {
            Internal::Transition(event) => self.on_transition(event),
            Internal::WakeChecked(result) => {
                self.wake_check_pending = false;
                match result {
                    Ok(Some(wake)) if self.is_listening() && self.session.is_none() => {
                        self.on_wake(wake)
                    }
                    Ok(Some(_)) => debug!("Wake detected after state moved on, ignoring"),
                    Ok(None) => {}
                    Err(e) => self.report("wake", ComponentError::Transient(e.to_string())),
                }
            }
            Internal::SessionDone { id, outcome } => {
                if id != self.session_id {
                    return;
                }
                self.session = None;
                self.on_session_done(outcome);
            }
            Internal::PlaybackDone { outcome, done } => {
                self.on_playback_done(&outcome);
                if done.send(outcome).is_err() {
                    debug!("Reply caller went away");
                }
            }
        }
    }

    fn on_transition(&mut self, event: TransitionEvent) {
        self.last_trigger = Some(event.trigger);
        if event.from == PipelineState::Processing && event.to != PipelineState::Processing {
            self.cancel_session();
        }
        if event.to == PipelineState::Listening {
            self.wake.reset();
        }
    }

    fn on_session_done(&mut self, outcome: CommandOutcome) {
        match outcome {
            CommandOutcome::Completed { text, source } => self.emit_command(text, source),
            CommandOutcome::TimedOut { partial } => {
                info!(partial = ?partial, "Command timed out");
                self.events.emit(AssistantEvent::CommandTimeout { partial });
                self.transition(PipelineState::Listening, Trigger::CommandTimeout);
            }
            CommandOutcome::Failed { partial, error } => {
                self.report("command", ComponentError::Protocol(error.clone()));
                self.events.emit(AssistantEvent::CommandFallback {
                    partial,
                    reason: error,
                });
                self.transition(PipelineState::Listening, Trigger::CommandFailed);
            }
            CommandOutcome::Cancelled => debug!("Command session cancelled"),
        }
    }

    fn on_control(&mut self, message: Control) {
        match message {
            Control::Reply { text, done } => self.start_reply(text, done),
            Control::Interrupt { done } => {
                let interrupted = self.engine.is_playing() && self.barge_in(Trigger::Manual, false);
                if done.send(interrupted).is_err() {
                    debug!("Interrupt caller went away");
                }
            }
            Control::Shutdown => {}
        }
    }

    fn start_reply(&mut self, text: String, done: oneshot::Sender<PlaybackOutcome>) {
        let refuse = |done: oneshot::Sender<PlaybackOutcome>, reason: String| {
            warn!(reason = %reason, "Reply refused");
            if done.send(PlaybackOutcome::Failed(reason)).is_err() {
                debug!("Reply caller went away");
            }
        };

        let Some(ticket) = self.engine.reserve() else {
            refuse(done, "a reply is already playing".to_string());
            return;
        };
        if let Err(e) = self
            .machine
            .transition(PipelineState::Speaking, Trigger::ReplyReady, None)
        {
            refuse(done, e.to_string());
            return;
        }

        if let Some(link) = &self.link {
            link.pause_for_playback();
        }
        self.gate.mute();
        self.gate_state.grace.clear();
        if self.config.interrupt.is_some() {
            self.monitor.arm();
        }

        let engine = Arc::clone(&self.engine);
        let synthesizer = Arc::clone(&self.synthesizer);
        let events = self.events.clone();
        let timeout = self.config.synth_timeout;
        let tx = self.internal_tx.clone();
        self.playback_task = Some(tokio::spawn(async move {
            let outcome = match synthesize_with_timeout(synthesizer.as_ref(), &text, timeout).await
            {
                Ok(audio) => engine.play_reserved(ticket, audio).await,
                Err(e) => {
                    drop(ticket);
                    events.emit(AssistantEvent::PlaybackFailed {
                        error: e.to_string(),
                    });
                    PlaybackOutcome::Failed(e.to_string())
                }
            };
            if tx.send(Internal::PlaybackDone { outcome, done }).is_err() {
                debug!("Playback ended after pipeline stopped");
            }
        }));
    }

    /// Cuts off playback in favour of the user.
    ///
    /// The monitor is disarmed and enforcement stopped before the microphone
    /// re-opens.
    fn barge_in(&mut self, trigger: Trigger, announce: bool) -> bool {
        self.monitor.disarm();
        let interrupted = self.engine.interrupt();
        self.gate.unmute_now();
        if announce {
            info!("Barge-in detected");
            self.events.emit(AssistantEvent::BargeIn);
        }

        if self.machine.state() == PipelineState::Speaking {
            self.transition(PipelineState::Interrupted, trigger);
            self.transition(PipelineState::Listening, trigger);
        }
        self.gate_state.window.wake(WakeReason::BargeIn);
        self.gate_state.grace.clear();
        // The interrupting speech starts a fresh segment, eligible as follow-up.
        self.vad.reset();
        self.last_muted = false;
        interrupted
    }

    fn on_playback_done(&mut self, outcome: &PlaybackOutcome) {
        self.playback_task = None;
        self.monitor.disarm();
        let speaking = self.machine.state() == PipelineState::Speaking;

        match outcome {
            PlaybackOutcome::Finished => {
                self.gate.unmute(self.config.unmute_delay);
                self.gate_state.grace.start();
                self.gate_state.window.touch();
                if speaking {
                    self.transition(PipelineState::Listening, Trigger::PlaybackFinished);
                }
            }
            PlaybackOutcome::Interrupted => {
                if speaking {
                    self.gate.unmute_now();
                    self.transition(PipelineState::Interrupted, Trigger::BargeIn);
                    self.transition(PipelineState::Listening, Trigger::BargeIn);
                }
            }
            PlaybackOutcome::Failed(error) => {
                self.gate.unmute_now();
                self.report("playback", ComponentError::Transient(error.clone()));
                if speaking {
                    self.transition(PipelineState::Listening, Trigger::PlaybackFailed);
                }
            }
        }

        if let Some(link) = &self.link {
            link.resume_after_playback();
        }
    }

    fn teardown(&mut self) {
        self.cancel_session();
        self.monitor.disarm();
        self.engine.interrupt();
        if let Some(task) = self.playback_task.take() {
            task.abort();
        }
        if let Some(link) = &self.link {
            link.stop();
        }
        self.gate_state.window.shutdown();
        self.gate.unmute_now();
        self.transition(PipelineState::Idle, Trigger::Shutdown);
        self.machine.unsubscribe(self.subscription);
        self.machine.shutdown();
        info!("Voice pipeline stopped");
    }

    fn is_listening(&self) -> bool {
        self.machine.state() == PipelineState::Listening
    }

    fn lookback_from(&self, at: Instant) -> Instant {
        at.checked_sub(self.config.wake_lookback).unwrap_or(at)
    }

    fn transition(&self, target: PipelineState, trigger: Trigger) {
        if let Err(e) = self.machine.transition(target, trigger, None) {
            debug!(error = %e, ?trigger, "Transition not applied");
        }
    }

    fn report(&self, component: &str, error: ComponentError) {
        self.reporter.report(
            component,
            &error,
            &ErrorContext {
                state: self.machine.state(),
                trigger: self.last_trigger,
                elapsed: self.machine.time_in_current_state(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::{Capture, CaptureConfig, ManualFeed};
    use crate::audio::device::MockDeviceController;
    use crate::bluetooth::MockBluetoothController;
    use crate::pipeline::error::testing::RecordingReporter;
    use crate::playback::{MockAudioSink, MockSynthesizer};
    use crate::stt::{MockTranscriber, MockTranscriptionProvider, TranscriptEvent};
    use crate::wake::ScriptedKeywordSpotter;

    const LOUD: i16 = 6000;
    const SPEECH: i16 = 1000;

    struct Rig {
        handle: PipelineHandle,
        feed: ManualFeed,
        events: Receiver<AssistantEvent>,
        sink: MockAudioSink,
        provider: MockTranscriptionProvider,
    }

    fn collaborators(
        wake: WakeDetector,
        provider: &MockTranscriptionProvider,
        sink: &MockAudioSink,
    ) -> Collaborators {
        Collaborators {
            wake,
            phrases: None,
            transcription: Arc::new(provider.clone()),
            synthesizer: Arc::new(MockSynthesizer::new()),
            sink: Arc::new(sink.clone()),
            devices: Arc::new(MockDeviceController::new("Speakers")),
            bluetooth: None,
        }
    }

    fn transcript_wake(transcript: &str) -> WakeDetector {
        WakeDetector::Fallback(TranscriptWake::new(
            Arc::new(MockTranscriber::new("mock").with_response(transcript)),
            WakePhrases::new(defaults::WAKE_PHRASES).unwrap(),
            Duration::from_secs(5),
        ))
    }

    async fn rig_with(
        wake: WakeDetector,
        provider: MockTranscriptionProvider,
        sink: MockAudioSink,
        reporter: Option<Arc<dyn ErrorReporter>>,
    ) -> Rig {
        let mut pipeline = VoicePipeline::new(
            PipelineConfig::default(),
            collaborators(wake, &provider, &sink),
        );
        if let Some(reporter) = reporter {
            pipeline = pipeline.with_error_reporter(reporter);
        }
        let events = pipeline.subscribe();
        let gate = MuteGate::new();
        let (feed, frames) = Capture::manual(CaptureConfig::default(), Arc::clone(&gate));
        let handle = pipeline.start(frames, gate).await;
        Rig {
            handle,
            feed,
            events,
            sink,
            provider,
        }
    }

    async fn rig(wake: WakeDetector) -> Rig {
        rig_with(
            wake,
            MockTranscriptionProvider::new(),
            MockAudioSink::new(),
            None,
        )
        .await
    }

    /// Pushes `ms` of constant-amplitude audio and lets the conductor run.
    async fn push(feed: &mut ManualFeed, amplitude: i16, ms: usize) {
        let samples: Vec<i16> = (0..ms * 16)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect();
        feed.push(&samples).await;
        settle().await;
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    /// Collects events until one matches `done`, for at most two seconds.
    async fn wait_for(
        events: &Receiver<AssistantEvent>,
        done: impl Fn(&AssistantEvent) -> bool,
    ) -> Vec<AssistantEvent> {
        let mut seen = Vec::new();
        for _ in 0..200 {
            let batch: Vec<_> = events.try_iter().collect();
            let matched = batch.iter().any(&done);
            seen.extend(batch);
            if matched {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        seen
    }

    fn commands(events: &[AssistantEvent]) -> Vec<(String, CommandSource)> {
        events
            .iter()
            .filter_map(|e| match e {
                AssistantEvent::Command { text, source } => Some((text.clone(), *source)),
                _ => None,
            })
            .collect()
    }

    fn is_command(event: &AssistantEvent) -> bool {
        matches!(event, AssistantEvent::Command { .. })
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_listening_and_shuts_down_to_idle() {
        let rig = rig(transcript_wake("")).await;
        assert_eq!(rig.handle.state(), PipelineState::Listening);

        let history = rig.handle.snapshot();
        assert_eq!(history.transitions, 1);

        let machine = Arc::clone(&rig.handle.machine);
        rig.handle.shutdown().await;
        assert_eq!(machine.state(), PipelineState::Idle);
        assert!(machine.is_shut_down());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inline_command_is_emitted_without_streaming() {
        let mut rig = rig(transcript_wake("hey razor turn on the lights")).await;

        push(&mut rig.feed, SPEECH, 600).await;
        push(&mut rig.feed, 0, 900).await;
        let events = wait_for(&rig.events, is_command).await;

        assert_eq!(
            commands(&events),
            vec![("turn on the lights".to_string(), CommandSource::WakeInline)]
        );
        assert_eq!(rig.provider.connect_count(), 0);
        assert_eq!(rig.handle.state(), PipelineState::Processing);
        assert!(rig.handle.attention().is_awake());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keyword_wake_streams_the_command() {
        let spotter = ScriptedKeywordSpotter::new(320).with_trigger_on_call(3);
        let provider = MockTranscriptionProvider::new()
            .with_on_connect(vec![TranscriptEvent::Final("what's on my calendar today".to_string())]);
        let mut rig = rig_with(
            WakeDetector::LowLatency(KeywordWake::new(Box::new(spotter))),
            provider,
            MockAudioSink::new(),
            None,
        )
        .await;

        push(&mut rig.feed, 0, 100).await;
        let events = wait_for(&rig.events, is_command).await;

        assert_eq!(
            commands(&events),
            vec![(
                "what's on my calendar today".to_string(),
                CommandSource::Stream
            )]
        );
        assert_eq!(rig.provider.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_stream_falls_back_and_returns_to_listening() {
        let reporter = Arc::new(RecordingReporter::default());
        let spotter = ScriptedKeywordSpotter::new(320).with_trigger_on_call(1);
        let mut rig = rig_with(
            WakeDetector::LowLatency(KeywordWake::new(Box::new(spotter))),
            MockTranscriptionProvider::new().with_connect_failure(),
            MockAudioSink::new(),
            Some(reporter.clone()),
        )
        .await;

        push(&mut rig.feed, 0, 20).await;
        let events = wait_for(&rig.events, |e| {
            matches!(e, AssistantEvent::CommandFallback { .. })
        })
        .await;

        assert!(events.iter().any(|e| matches!(
            e,
            AssistantEvent::CommandFallback { partial: None, .. }
        )));
        assert_eq!(rig.handle.state(), PipelineState::Listening);
        let reports = reporter.reports.lock().unwrap();
        assert_eq!(reports[0].0, "command");
        assert!(matches!(reports[0].1, ComponentError::Protocol(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_mutes_then_reopens_after_delay() {
        let mut rig = rig(transcript_wake("hey razor turn on the lights")).await;
        push(&mut rig.feed, SPEECH, 600).await;
        push(&mut rig.feed, 0, 900).await;
        wait_for(&rig.events, is_command).await;
        assert_eq!(rig.handle.state(), PipelineState::Processing);

        let outcome = rig.handle.reply("Lights are on.").await;

        assert_eq!(outcome, PlaybackOutcome::Finished);
        assert_eq!(rig.sink.played(), vec!["Lights are on."]);
        assert_eq!(rig.handle.state(), PipelineState::Listening);
        assert!(rig.handle.is_muted());
        tokio::time::sleep(Duration::from_millis(defaults::UNMUTE_DELAY_MS + 1)).await;
        assert!(!rig.handle.is_muted());

        let states: Vec<_> = rig
            .handle
            .snapshot()
            .recent
            .iter()
            .map(|s| s.state)
            .collect();
        assert_eq!(
            states,
            vec![
                PipelineState::Idle,
                PipelineState::Listening,
                PipelineState::Processing,
                PipelineState::Speaking,
                PipelineState::Listening
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_loud_speech_during_reply_barges_in() {
        let mut rig = rig_with(
            transcript_wake(""),
            MockTranscriptionProvider::new(),
            MockAudioSink::new().with_duration(Duration::from_secs(10)),
            None,
        )
        .await;

        let reply = tokio::spawn({
            let control = rig.handle.control.clone();
            async move {
                let (done, rx) = oneshot::channel();
                control
                    .send(Control::Reply {
                        text: "A long answer.".to_string(),
                        done,
                    })
                    .ok();
                rx.await.unwrap()
            }
        });
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(rig.handle.state(), PipelineState::Speaking);
        assert!(rig.handle.is_muted());

        push(&mut rig.feed, LOUD, 60).await;

        assert_eq!(reply.await.unwrap(), PlaybackOutcome::Interrupted);
        assert_eq!(rig.handle.state(), PipelineState::Listening);
        assert!(!rig.handle.is_muted());
        assert!(rig.handle.attention().is_awake());
        let events: Vec<_> = rig.events.try_iter().collect();
        assert_eq!(
            events
                .iter()
                .filter(|e| **e == AssistantEvent::BargeIn)
                .count(),
            1
        );
        assert_eq!(rig.sink.interrupt_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_interrupt_is_idempotent() {
        let rig = rig(transcript_wake("")).await;
        assert!(!rig.handle.interrupt().await);
        assert!(!rig.handle.interrupt().await);
        assert_eq!(rig.handle.state(), PipelineState::Listening);
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthesis_failure_unmutes_and_recovers() {
        let provider = MockTranscriptionProvider::new();
        let sink = MockAudioSink::new();
        let mut collab = collaborators(transcript_wake(""), &provider, &sink);
        let failing: Arc<dyn Synthesizer> = Arc::new(MockSynthesizer::new().with_failure());
        collab.synthesizer = failing;
        let pipeline = VoicePipeline::new(PipelineConfig::default(), collab);
        let events = pipeline.subscribe();
        let gate = MuteGate::new();
        let (_feed, frames) = Capture::manual(CaptureConfig::default(), Arc::clone(&gate));
        let handle = pipeline.start(frames, gate).await;

        let outcome = handle.reply("Hello").await;

        assert!(matches!(outcome, PlaybackOutcome::Failed(_)));
        assert_eq!(handle.state(), PipelineState::Listening);
        assert!(!handle.is_muted());
        assert!(events
            .try_iter()
            .any(|e| matches!(e, AssistantEvent::PlaybackFailed { .. })));
        assert!(sink.played().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_enter_mode_accepts_only_modes() {
        let rig = rig(transcript_wake("")).await;

        assert!(rig.handle.enter_mode(PipelineState::Speaking).is_err());
        let event = rig.handle.enter_mode(PipelineState::Briefing).unwrap();
        assert_eq!(event.trigger, Trigger::ModeRequested);
        assert_eq!(rig.handle.state(), PipelineState::Briefing);

        rig.handle.resume_listening().unwrap();
        assert_eq!(rig.handle.state(), PipelineState::Listening);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_are_published_as_events() {
        let rig = rig(transcript_wake("")).await;
        rig.handle.enter_mode(PipelineState::Coaching).unwrap();

        let transitions: Vec<_> = rig
            .events
            .try_iter()
            .filter_map(|e| match e {
                AssistantEvent::Transition(t) => Some((t.from, t.to)),
                _ => None,
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                (PipelineState::Idle, PipelineState::Listening),
                (PipelineState::Listening, PipelineState::Coaching)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolvable_headset_disables_only_the_monitor() {
        let reporter = Arc::new(RecordingReporter::default());
        let provider = MockTranscriptionProvider::new();
        let sink = MockAudioSink::new();
        let mut collab = collaborators(transcript_wake(""), &provider, &sink);
        let controller: Arc<dyn BluetoothController> = Arc::new(MockBluetoothController::new());
        collab.bluetooth = Some((controller, LinkMonitorConfig::new("Razor Buds")));
        let pipeline = VoicePipeline::new(PipelineConfig::default(), collab)
            .with_error_reporter(reporter.clone());
        let gate = MuteGate::new();
        let (_feed, frames) = Capture::manual(CaptureConfig::default(), Arc::clone(&gate));
        let handle = pipeline.start(frames, gate).await;

        assert_eq!(handle.state(), PipelineState::Listening);
        let reports = reporter.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, "bluetooth");
        assert!(matches!(reports[0].1, ComponentError::Fatal(_)));
    }

    #[test]
    fn test_pipeline_config_follows_config_file() {
        let mut config = Config::default();
        config.interrupt.enabled = false;
        config.attention.window_secs = 60;

        let pipeline = PipelineConfig::from(&config);

        assert!(pipeline.interrupt.is_none());
        assert_eq!(pipeline.attention_window, Duration::from_secs(60));
        assert_eq!(pipeline.wake_lookback, Duration::from_millis(700));
    }

    #[test]
    fn test_keyword_strategy_without_engine_falls_back() {
        let mut config = Config::default();
        config.wake.strategy = WakeStrategy::Keyword;

        let detector =
            select_wake_detector(&config, None, Arc::new(MockTranscriber::new("mock"))).unwrap();
        assert_eq!(detector.strategy(), WakeStrategy::Transcript);

        let detector = select_wake_detector(
            &config,
            Some(Box::new(ScriptedKeywordSpotter::new(512))),
            Arc::new(MockTranscriber::new("mock")),
        )
        .unwrap();
        assert_eq!(detector.strategy(), WakeStrategy::Keyword);
    }
}

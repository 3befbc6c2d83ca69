//! Streaming capture of one spoken command.
//!
//! A session connects a transcription stream, replays the pre-roll frames
//! from the ring buffer, forwards live frames and decides when the command is
//! finished. It ends on the first of:
//! - text the [`CompletionPolicy`] accepts
//! - the sentence timer after the last final segment
//! - the hard timeout
//! - a connection or stream failure

use super::policy::CompletionPolicy;
use crate::audio::frame::AudioFrame;
use crate::defaults;
use crate::error::VoiceError;
use crate::events::{AssistantEvent, CommandSource, EventBus};
use crate::stt::{TranscriptEvent, TranscriptionProvider, TranscriptionStream};
use crate::wake::WakePhrases;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

/// Timing and completion settings for command sessions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub sample_rate: u32,
    pub connect_timeout: Duration,
    /// Silence after a final segment that finishes an incomplete command.
    pub sentence_silence: Duration,
    /// Upper bound on the whole session, connect included.
    pub hard_timeout: Duration,
    pub policy: CompletionPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: defaults::SAMPLE_RATE,
            connect_timeout: Duration::from_millis(defaults::TRANSCRIPTION_CONNECT_TIMEOUT_MS),
            sentence_silence: Duration::from_millis(defaults::SENTENCE_SILENCE_MS),
            hard_timeout: Duration::from_millis(defaults::COMMAND_TIMEOUT_MS),
            policy: CompletionPolicy::default(),
        }
    }
}

/// What a session starts from.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub source: CommandSource,
    /// Pre-roll frames sent before any live frame.
    pub replay: Vec<AudioFrame>,
    /// Text already known, such as an incomplete inline wake command.
    pub seed: Option<String>,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Completed {
        text: String,
        source: CommandSource,
    },
    /// Hard timeout with no confirmed text. Carries the last interim
    /// hypothesis, if any.
    TimedOut { partial: Option<String> },
    /// The transcription stream could not be used.
    Failed {
        partial: Option<String>,
        error: String,
    },
    /// The live frame feed was closed by the owner.
    Cancelled,
}

/// Accumulated transcript state for one session.
struct Transcript {
    finals: Vec<String>,
    interim: Option<String>,
    stripped_first: bool,
}

impl Transcript {
    fn new(seed: Option<String>) -> Self {
        Self {
            finals: seed.into_iter().filter(|s| !s.trim().is_empty()).collect(),
            interim: None,
            stripped_first: false,
        }
    }

    fn text(&self) -> Option<String> {
        let joined = self.finals.join(" ");
        if joined.trim().is_empty() {
            None
        } else {
            Some(joined)
        }
    }

    /// Text including the current interim hypothesis, for live display.
    fn preview(&self) -> String {
        let mut parts: Vec<&str> = self.finals.iter().map(String::as_str).collect();
        if let Some(interim) = self.interim.as_deref() {
            parts.push(interim);
        }
        parts.join(" ")
    }

    /// Best available text: confirmed finals, else the interim hypothesis.
    fn partial(&self) -> Option<String> {
        self.text().or_else(|| self.interim.clone())
    }
}

/// Runs one command session to completion.
///
/// The session never outlives `config.hard_timeout`. The stream is closed on
/// every exit path after a successful connect.
pub async fn run_session(
    provider: Arc<dyn TranscriptionProvider>,
    phrases: Option<Arc<WakePhrases>>,
    config: SessionConfig,
    request: CommandRequest,
    frames: mpsc::Receiver<AudioFrame>,
    events: EventBus,
) -> CommandOutcome {
    let deadline = Instant::now() + config.hard_timeout;
    let mut transcript = Transcript::new(request.seed);

    let connect = tokio::time::timeout(
        config.connect_timeout,
        provider.connect(config.sample_rate),
    )
    .await;
    let (mut stream, transcripts) = match connect {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            warn!(error = %e, "Transcription connect failed");
            return CommandOutcome::Failed {
                partial: transcript.partial(),
                error: e.to_string(),
            };
        }
        Err(_) => {
            let e = VoiceError::timeout("transcription connect", config.connect_timeout);
            warn!(error = %e, "Transcription connect timed out");
            return CommandOutcome::Failed {
                partial: transcript.partial(),
                error: e.to_string(),
            };
        }
    };

    debug!(
        replay_frames = request.replay.len(),
        source = ?request.source,
        "Command session connected"
    );

    let outcome = drive(
        &mut *stream,
        transcripts,
        frames,
        &mut transcript,
        DriveContext {
            replay: request.replay,
            source: request.source,
            phrases,
            config: &config,
            deadline,
            events: &events,
        },
    )
    .await;

    if let Err(e) = stream.close().await {
        debug!(error = %e, "Transcription close failed");
    }

    info!(outcome = ?outcome, "Command session ended");
    outcome
}

struct DriveContext<'a> {
    replay: Vec<AudioFrame>,
    source: CommandSource,
    phrases: Option<Arc<WakePhrases>>,
    config: &'a SessionConfig,
    deadline: Instant,
    events: &'a EventBus,
}

async fn drive(
    stream: &mut dyn TranscriptionStream,
    mut transcripts: mpsc::Receiver<TranscriptEvent>,
    mut frames: mpsc::Receiver<AudioFrame>,
    transcript: &mut Transcript,
    ctx: DriveContext<'_>,
) -> CommandOutcome {
    let failed = |transcript: &Transcript, error: String| CommandOutcome::Failed {
        partial: transcript.partial(),
        error,
    };

    for frame in &ctx.replay {
        if let Err(e) = stream.send(frame).await {
            return failed(&*transcript, e.to_string());
        }
    }

    // A seed is already an utterance, so it gets the sentence timer at once.
    let mut sentence_deadline = transcript
        .text()
        .map(|_| Instant::now() + ctx.config.sentence_silence);

    loop {
        tokio::select! {
            biased;

            _ = sleep_until(ctx.deadline) => {
                return match transcript.text() {
                    Some(text) => CommandOutcome::Completed { text, source: ctx.source },
                    None => CommandOutcome::TimedOut { partial: transcript.interim.clone() },
                };
            }

            _ = sleep_until(sentence_deadline.unwrap_or(ctx.deadline)), if sentence_deadline.is_some() => {
                if let Some(text) = transcript.text() {
                    return CommandOutcome::Completed { text, source: ctx.source };
                }
                sentence_deadline = None;
            }

            event = transcripts.recv() => match event {
                Some(TranscriptEvent::Partial(text)) => {
                    transcript.interim = Some(text);
                    if sentence_deadline.is_some() {
                        sentence_deadline = Some(Instant::now() + ctx.config.sentence_silence);
                    }
                    ctx.events.emit(AssistantEvent::CommandPartial { text: transcript.preview() });
                }
                Some(TranscriptEvent::Final(text)) => {
                    let text = match ctx.phrases.as_deref() {
                        Some(phrases)
                            if !transcript.stripped_first
                                && ctx.source != CommandSource::FollowUp =>
                        {
                            phrases.strip(&text)
                        }
                        _ => text.trim().to_string(),
                    };
                    transcript.stripped_first = true;
                    transcript.interim = None;
                    if !text.is_empty() {
                        transcript.finals.push(text);
                    }

                    if let Some(joined) = transcript.text() {
                        if ctx.config.policy.is_complete(&joined) {
                            return CommandOutcome::Completed { text: joined, source: ctx.source };
                        }
                        ctx.events.emit(AssistantEvent::CommandPartial { text: joined });
                        sentence_deadline = Some(Instant::now() + ctx.config.sentence_silence);
                    }
                }
                Some(TranscriptEvent::UtteranceEnd) => {
                    if sentence_deadline.is_none() && transcript.text().is_some() {
                        sentence_deadline = Some(Instant::now() + ctx.config.sentence_silence);
                    }
                }
                Some(TranscriptEvent::Error(message)) => {
                    warn!(error = %message, "Transcription stream reported an error");
                }
                None => {
                    return match transcript.text() {
                        Some(text) => CommandOutcome::Completed { text, source: ctx.source },
                        None => failed(&*transcript, "transcription stream closed".to_string()),
                    };
                }
            },

            frame = frames.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = stream.send(&frame).await {
                        return failed(&*transcript, e.to_string());
                    }
                }
                None => return CommandOutcome::Cancelled,
            },
        }
    }
}

/// A running command session.
///
/// Dropping the handle aborts the session.
pub struct CommandSession {
    frames: mpsc::Sender<AudioFrame>,
    task: JoinHandle<()>,
}

impl CommandSession {
    /// Spawns [`run_session`] and calls `on_done` with its outcome.
    ///
    /// `on_done` is not called if the session is aborted.
    pub fn spawn<F>(
        provider: Arc<dyn TranscriptionProvider>,
        phrases: Option<Arc<WakePhrases>>,
        config: SessionConfig,
        request: CommandRequest,
        events: EventBus,
        on_done: F,
    ) -> Self
    where
        F: FnOnce(CommandOutcome) + Send + 'static,
    {
        let (frames, rx) = mpsc::channel(defaults::FRAME_CHANNEL_CAPACITY);
        let task = tokio::spawn(async move {
            let outcome = run_session(provider, phrases, config, request, rx, events).await;
            on_done(outcome);
        });
        Self { frames, task }
    }

    /// Forwards a live frame. Returns `false` if it was dropped.
    pub fn feed(&self, frame: AudioFrame) -> bool {
        match self.frames.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Command session frame queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn cancel(self) {
        self.task.abort();
    }
}

impl Drop for CommandSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

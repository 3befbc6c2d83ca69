//! Fallback wake strategy: transcribe finalized speech segments and look for
//! a wake phrase in the text.

use super::phrases::WakePhrases;
use super::{WakeEvent, WakeTrigger};
use crate::audio::frame::SpeechSegment;
use crate::error::{Result, VoiceError};
use crate::stt::Transcriber;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct TranscriptWake {
    transcriber: Arc<dyn Transcriber>,
    phrases: Arc<WakePhrases>,
    timeout: Duration,
}

impl TranscriptWake {
    pub fn new(transcriber: Arc<dyn Transcriber>, phrases: WakePhrases, timeout: Duration) -> Self {
        Self {
            transcriber,
            phrases: Arc::new(phrases),
            timeout,
        }
    }

    pub fn phrases(&self) -> Arc<WakePhrases> {
        Arc::clone(&self.phrases)
    }

    /// Transcribes `segment` on the blocking pool and matches wake phrases.
    ///
    /// Returns `Ok(None)` when the transcript has no wake phrase.
    pub async fn check_segment(&self, segment: SpeechSegment) -> Result<Option<WakeEvent>> {
        let samples = segment.samples();
        let sample_rate = segment.sample_rate();
        let transcriber = Arc::clone(&self.transcriber);

        let task =
            tokio::task::spawn_blocking(move || transcriber.transcribe(&samples, sample_rate));
        let transcript = match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join_error)) => {
                return Err(VoiceError::Transcription {
                    message: format!("transcription task failed: {}", join_error),
                });
            }
            Err(_) => return Err(VoiceError::timeout("wake transcription", self.timeout)),
        };

        let transcript = transcript.trim().to_string();
        debug!(transcript = %transcript, speech_ms = segment.speech_ms, "Wake check");

        Ok(self.phrases.find(&transcript).map(|m| WakeEvent {
            trigger: WakeTrigger::Transcript {
                transcript: transcript.clone(),
                pattern: m.pattern,
            },
            command: m.command,
            detected_at: segment.ended_at,
        }))
    }
}

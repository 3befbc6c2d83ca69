//! Streaming transcription used for command capture after a wake event.

use crate::audio::frame::AudioFrame;
use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

/// Events produced by a live transcription session.
///
/// The session is closed when the event channel ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    /// Interim hypothesis for the utterance in progress.
    Partial(String),
    /// Final text for one utterance segment.
    Final(String),
    /// The provider detected the end of an utterance.
    UtteranceEnd,
    /// Provider-side error; the session may still continue.
    Error(String),
}

/// Send half of a live transcription session.
#[async_trait]
pub trait TranscriptionStream: Send {
    /// Sends one frame of audio.
    async fn send(&mut self, frame: &AudioFrame) -> Result<()>;

    /// Closes the session; the provider flushes and ends the event channel.
    async fn close(&mut self) -> Result<()>;
}

/// Opens live transcription sessions.
#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    /// Connects a new session for audio at `sample_rate`.
    async fn connect(
        &self,
        sample_rate: u32,
    ) -> Result<(Box<dyn TranscriptionStream>, mpsc::Receiver<TranscriptEvent>)>;
}

#[derive(Debug, Default)]
struct MockProviderState {
    connects: usize,
    closes: usize,
    frames: usize,
    fail_connect: bool,
    connect_delay: Option<Duration>,
    on_connect: Vec<TranscriptEvent>,
    current: Option<mpsc::Sender<TranscriptEvent>>,
}

/// Mock provider for testing. Clones share state, so a test keeps one clone
/// as a controller and hands the other to the pipeline.
#[derive(Debug, Clone, Default)]
pub struct MockTranscriptionProvider {
    state: Arc<Mutex<MockProviderState>>,
}

impl MockTranscriptionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connect attempt fails.
    pub fn with_connect_failure(self) -> Self {
        self.lock().fail_connect = true;
        self
    }

    /// Connect takes this long (tokio time) before succeeding.
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.lock().connect_delay = Some(delay);
        self
    }

    /// Events delivered right after each successful connect.
    pub fn with_on_connect(self, events: Vec<TranscriptEvent>) -> Self {
        self.lock().on_connect = events;
        self
    }

    /// Pushes an event into the most recent session.
    ///
    /// Returns `false` if no session is open.
    pub fn emit(&self, event: TranscriptEvent) -> bool {
        match self.lock().current.as_ref() {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        }
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    pub fn close_count(&self) -> usize {
        self.lock().closes
    }

    /// Frames received across all sessions.
    pub fn frames_received(&self) -> usize {
        self.lock().frames
    }

    fn lock(&self) -> MutexGuard<'_, MockProviderState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct MockStream {
    provider: MockTranscriptionProvider,
    closed: bool,
}

#[async_trait]
impl TranscriptionStream for MockStream {
    async fn send(&mut self, _frame: &AudioFrame) -> Result<()> {
        if self.closed {
            return Err(VoiceError::Transcription {
                message: "stream closed".to_string(),
            });
        }
        self.provider.lock().frames += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            let mut state = self.provider.lock();
            state.closes += 1;
            state.current = None;
        }
        Ok(())
    }
}

#[async_trait]
impl TranscriptionProvider for MockTranscriptionProvider {
    async fn connect(
        &self,
        _sample_rate: u32,
    ) -> Result<(Box<dyn TranscriptionStream>, mpsc::Receiver<TranscriptEvent>)> {
        let delay = self.lock().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.fail_connect {
            return Err(VoiceError::TranscriptionConnect {
                message: "mock provider unavailable".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(64);
        for event in &state.on_connect {
            if tx.try_send(event.clone()).is_err() {
                break;
            }
        }
        state.connects += 1;
        state.current = Some(tx);
        drop(state);

        let stream = MockStream {
            provider: self.clone(),
            closed: false,
        };
        Ok((Box::new(stream), rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn frame() -> AudioFrame {
        AudioFrame::new(0, Instant::now(), 16000, vec![0; 320])
    }

    #[tokio::test]
    async fn test_mock_provider_counts_frames_and_closes() {
        let provider = MockTranscriptionProvider::new();
        let (mut stream, mut events) = provider.connect(16000).await.unwrap();

        stream.send(&frame()).await.unwrap();
        stream.send(&frame()).await.unwrap();
        assert!(provider.emit(TranscriptEvent::Final("hello".to_string())));
        assert_eq!(
            events.recv().await,
            Some(TranscriptEvent::Final("hello".to_string()))
        );

        stream.close().await.unwrap();
        assert_eq!(provider.frames_received(), 2);
        assert_eq!(provider.close_count(), 1);
        assert!(!provider.emit(TranscriptEvent::UtteranceEnd));
        assert_eq!(events.recv().await, None);
        assert!(stream.send(&frame()).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_provider_connect_failure() {
        let provider = MockTranscriptionProvider::new().with_connect_failure();
        let result = provider.connect(16000).await;
        assert!(matches!(
            result,
            Err(VoiceError::TranscriptionConnect { .. })
        ));
        assert_eq!(provider.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_mock_provider_on_connect_script() {
        let provider = MockTranscriptionProvider::new()
            .with_on_connect(vec![TranscriptEvent::Partial("turn".to_string())]);
        let (_stream, mut events) = provider.connect(16000).await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(TranscriptEvent::Partial("turn".to_string()))
        );
    }
}

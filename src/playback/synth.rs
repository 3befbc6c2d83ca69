use super::sink::SynthesizedAudio;
use crate::defaults::SAMPLE_RATE;
use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Text-to-speech provider.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio>;

    /// Name of the voice or provider.
    fn voice(&self) -> &str;
}

/// Runs `synthesizer`, bounded by `timeout`.
pub async fn synthesize_with_timeout(
    synthesizer: &dyn Synthesizer,
    text: &str,
    timeout: Duration,
) -> Result<SynthesizedAudio> {
    tokio::time::timeout(timeout, synthesizer.synthesize(text))
        .await
        .map_err(|_| VoiceError::timeout("speech synthesis", timeout))?
}

/// Mock synthesizer producing silence proportional to the text length.
#[derive(Debug, Clone)]
pub struct MockSynthesizer {
    ms_per_char: u64,
    fixed: Option<Duration>,
    delay: Option<Duration>,
    fail: bool,
    calls: Arc<AtomicUsize>,
}

impl MockSynthesizer {
    pub fn new() -> Self {
        Self {
            ms_per_char: 60,
            fixed: None,
            delay: None,
            fail: false,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every reply lasts exactly `duration`.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.fixed = Some(duration);
        self
    }

    /// Synthesis takes this long (tokio time).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_failure(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Synthesizer for MockSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(VoiceError::Synthesis {
                message: "mock synthesis failure".to_string(),
            });
        }

        let duration = self
            .fixed
            .unwrap_or_else(|| Duration::from_millis(self.ms_per_char * text.len() as u64));
        let samples = (duration.as_millis() as usize) * (SAMPLE_RATE as usize / 1000);
        Ok(SynthesizedAudio::new(vec![0; samples], SAMPLE_RATE, text))
    }

    fn voice(&self) -> &str {
        "mock"
    }
}

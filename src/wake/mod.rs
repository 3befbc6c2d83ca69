//! Wake-word detection.
//!
//! Two strategies share one event type:
//! - [`KeywordWake`]: low latency, runs an on-device keyword spotter over every
//!   unmuted frame
//! - [`TranscriptWake`]: fallback, transcribes finalized speech segments and
//!   matches configurable [`WakePhrases`]
//!
//! Both rely on the [`RingBuffer`] to replay the audio spoken just before
//! detection into the command stream.

pub mod keyword;
pub mod phrases;
pub mod ring_buffer;
pub mod transcript;

pub use keyword::{KeywordSpotter, KeywordWake, ScriptedKeywordSpotter};
pub use phrases::{PhraseMatch, WakePhrases};
pub use ring_buffer::RingBuffer;
pub use transcript::TranscriptWake;

use crate::error::VoiceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::time::Instant;

/// What produced a wake detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeTrigger {
    /// Keyword engine match.
    Keyword { index: usize },
    /// Wake phrase found in a transcript.
    Transcript { transcript: String, pattern: String },
}

/// A single wake detection. Triggers exactly one orchestrator transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeEvent {
    pub trigger: WakeTrigger,
    /// Command spoken in the same utterance as the wake phrase.
    pub command: Option<String>,
    /// Moment of detection, in frame time.
    pub detected_at: Instant,
}

impl WakeEvent {
    pub fn strategy(&self) -> WakeStrategy {
        match self.trigger {
            WakeTrigger::Keyword { .. } => WakeStrategy::Keyword,
            WakeTrigger::Transcript { .. } => WakeStrategy::Transcript,
        }
    }
}

/// Configured wake strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WakeStrategy {
    Keyword,
    #[default]
    Transcript,
}

impl WakeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            WakeStrategy::Keyword => "keyword",
            WakeStrategy::Transcript => "transcript",
        }
    }
}

impl fmt::Display for WakeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WakeStrategy {
    type Err = VoiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "keyword" => Ok(WakeStrategy::Keyword),
            "transcript" => Ok(WakeStrategy::Transcript),
            other => Err(VoiceError::ConfigInvalidValue {
                key: "wake.strategy".to_string(),
                message: format!("unknown strategy '{}', expected keyword or transcript", other),
            }),
        }
    }
}

/// The wake strategy selected at startup.
pub enum WakeDetector {
    LowLatency(KeywordWake),
    Fallback(TranscriptWake),
}

impl WakeDetector {
    pub fn strategy(&self) -> WakeStrategy {
        match self {
            WakeDetector::LowLatency(_) => WakeStrategy::Keyword,
            WakeDetector::Fallback(_) => WakeStrategy::Transcript,
        }
    }

    /// Drops any partial keyword-engine input.
    pub fn reset(&mut self) {
        if let WakeDetector::LowLatency(keyword) = self {
            keyword.reset();
        }
    }
}

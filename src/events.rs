//! Outward event surface consumed by the command-handling layer.

use crate::bluetooth::LinkEvent;
use crate::state::TransitionEvent;
use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Where the text of an emitted command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSource {
    /// Spoken in the same breath as the wake phrase.
    WakeInline,
    /// Captured by a streaming transcription session after the wake phrase.
    Stream,
    /// Captured without a wake phrase while the attention window was awake.
    FollowUp,
}

/// What woke the attention window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeReason {
    WakeWord,
    Command,
    BargeIn,
}

/// Events published by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantEvent {
    /// A state machine transition was applied.
    Transition(TransitionEvent),
    /// Final command text, ready for the reasoning layer.
    Command { text: String, source: CommandSource },
    /// Live transcript while a command is being captured.
    CommandPartial { text: String },
    /// The command session hit its hard limit with nothing captured.
    CommandTimeout { partial: Option<String> },
    /// The transcription stream failed; carries anything captured so far.
    CommandFallback {
        partial: Option<String>,
        reason: String,
    },
    /// A wake phrase was detected.
    Wake {
        strategy: String,
        command: Option<String>,
    },
    /// The attention window woke up.
    Awake { reason: WakeReason },
    /// The attention window fell asleep; the wake phrase is required again.
    Sleep,
    /// The user spoke over playback.
    BargeIn,
    PlaybackStarted { text: String, duration_ms: u64 },
    PlaybackFinished,
    PlaybackInterrupted,
    PlaybackFailed { error: String },
    SpeechStart,
    SpeechEnd { duration_ms: u32 },
    CaptureStarted,
    CaptureStopped,
    /// The input device delivered nothing at all (device failure, not silence).
    CaptureNoAudio { timeout_ms: u64 },
    /// Bluetooth link monitor activity.
    Link { link: LinkEvent },
}

impl AssistantEvent {
    /// Serialize event to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize event from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Fan-out of [`AssistantEvent`]s to any number of channel subscribers.
///
/// Subscribers whose receiver was dropped are pruned on the next emit.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<AssistantEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<AssistantEvent> {
        let (tx, rx) = unbounded();
        self.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: AssistantEvent) {
        tracing::trace!(?event, "event");
        self.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Sender<AssistantEvent>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_format_is_snake_case() {
        let json = AssistantEvent::CommandTimeout { partial: None }
            .to_json()
            .expect("should serialize");
        assert!(
            json.contains("\"type\":\"command_timeout\""),
            "JSON should use snake_case. Got: {}",
            json
        );
    }

    #[test]
    fn test_command_event_carries_source_tag() {
        let event = AssistantEvent::Command {
            text: "what's on my calendar".to_string(),
            source: CommandSource::WakeInline,
        };
        let json = event.to_json().expect("should serialize");
        assert!(json.contains("\"source\":\"wake_inline\""), "Got: {}", json);
        assert_eq!(AssistantEvent::from_json(&json).expect("should parse"), event);
    }

    #[test]
    fn test_link_event_nests_under_link_key() {
        let event = AssistantEvent::Link {
            link: LinkEvent::Disconnected {
                device: "Razor Buds".to_string(),
            },
        };
        let json = event.to_json().expect("should serialize");
        assert!(json.contains("\"type\":\"link\""), "Got: {}", json);
        assert!(json.contains("\"kind\":\"disconnected\""), "Got: {}", json);
    }

    #[test]
    fn test_bus_delivers_to_every_subscriber() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.emit(AssistantEvent::BargeIn);

        assert_eq!(a.try_recv().unwrap(), AssistantEvent::BargeIn);
        assert_eq!(b.try_recv().unwrap(), AssistantEvent::BargeIn);
    }

    #[test]
    fn test_bus_prunes_dropped_subscribers() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit(AssistantEvent::Sleep);

        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.try_recv().unwrap(), AssistantEvent::Sleep);
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.emit(AssistantEvent::PlaybackFinished);
        assert_eq!(bus.subscriber_count(), 0);
    }
}

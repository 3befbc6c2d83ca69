//! Pipeline states, the legality table and the records the machine keeps.

use crate::defaults;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Top-level state of the voice pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Not listening at all (startup, shutdown).
    Idle,
    /// Waiting for a wake phrase or a follow-up.
    Listening,
    /// Capturing or handling a command.
    Processing,
    /// Playing a reply.
    Speaking,
    /// Playback was cut off by the user.
    Interrupted,
    Briefing,
    Researching,
    Coaching,
    Learning,
    /// Recovering from a failure.
    Error,
}

impl PipelineState {
    pub const ALL: [PipelineState; 10] = [
        PipelineState::Idle,
        PipelineState::Listening,
        PipelineState::Processing,
        PipelineState::Speaking,
        PipelineState::Interrupted,
        PipelineState::Briefing,
        PipelineState::Researching,
        PipelineState::Coaching,
        PipelineState::Learning,
        PipelineState::Error,
    ];

    /// Higher-level modes entered on request of the reasoning layer.
    pub fn is_mode(self) -> bool {
        matches!(
            self,
            PipelineState::Briefing
                | PipelineState::Researching
                | PipelineState::Coaching
                | PipelineState::Learning
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Listening => "listening",
            PipelineState::Processing => "processing",
            PipelineState::Speaking => "speaking",
            PipelineState::Interrupted => "interrupted",
            PipelineState::Briefing => "briefing",
            PipelineState::Researching => "researching",
            PipelineState::Coaching => "coaching",
            PipelineState::Learning => "learning",
            PipelineState::Error => "error",
        }
    }

    /// Whether `self -> to` is a legal transition.
    ///
    /// Self-transitions are never legal. Idle is reachable from everywhere
    /// so shutdown always works.
    pub fn can_transition_to(self, to: PipelineState) -> bool {
        use PipelineState::*;

        if self == to {
            return false;
        }
        if to == Idle {
            return true;
        }
        match self {
            Idle => matches!(to, Listening | Error),
            Listening => matches!(to, Processing | Speaking | Error) || to.is_mode(),
            Processing => matches!(to, Speaking | Listening | Error) || to.is_mode(),
            Speaking => matches!(to, Listening | Interrupted | Error),
            Interrupted => matches!(to, Listening | Processing | Error),
            Briefing | Researching | Coaching | Learning => {
                matches!(to, Speaking | Listening | Processing | Error)
            }
            Error => matches!(to, Listening),
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Startup,
    WakeWord,
    FollowUp,
    CommandComplete,
    CommandTimeout,
    CommandFailed,
    ReplyReady,
    PlaybackFinished,
    PlaybackFailed,
    BargeIn,
    ModeRequested,
    /// A per-state timeout fired.
    Timeout,
    /// Automatic recovery out of the error state.
    Recovery,
    Failure,
    Shutdown,
    Manual,
}

/// Broadcast to subscribers for every applied transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub from: PipelineState,
    pub to: PipelineState,
    pub trigger: Trigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Monotonic transition counter, starting at 1.
    pub sequence: u64,
    /// Time spent in `from`.
    pub previous_state_ms: u64,
}

/// One entry in the transition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub state: PipelineState,
    pub trigger: Trigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub sequence: u64,
    /// Wall-clock entry time, milliseconds since the Unix epoch.
    pub entered_at_ms: u64,
    /// Time spent in the state; `None` while it is current.
    pub duration_ms: Option<u64>,
}

/// Serializable status view of the machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub state: PipelineState,
    pub time_in_state_ms: u64,
    pub transitions: u64,
    pub recent: Vec<StateSnapshot>,
}

/// Per-state timeouts. `None` disables the timeout for that state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTimeouts {
    /// Processing watchdog; fires `processing -> error`.
    pub processing: Option<Duration>,
    /// Recovery delay; fires `error -> listening`.
    pub error_recovery: Option<Duration>,
    /// Safety net; fires `interrupted -> listening`.
    pub interrupted: Option<Duration>,
    /// Mode expiry; fires `<mode> -> listening`.
    pub mode: Option<Duration>,
}

impl Default for StateTimeouts {
    fn default() -> Self {
        Self {
            processing: Some(Duration::from_millis(defaults::PROCESSING_TIMEOUT_MS)),
            error_recovery: Some(Duration::from_millis(defaults::ERROR_RECOVERY_MS)),
            interrupted: Some(Duration::from_millis(defaults::INTERRUPTED_TIMEOUT_MS)),
            mode: Some(Duration::from_millis(defaults::MODE_TIMEOUT_MS)),
        }
    }
}

impl StateTimeouts {
    /// No timeouts at all.
    pub fn disabled() -> Self {
        Self {
            processing: None,
            error_recovery: None,
            interrupted: None,
            mode: None,
        }
    }

    /// Timeout armed on entering `state`: the delay, the target and the trigger.
    pub fn for_state(&self, state: PipelineState) -> Option<(Duration, PipelineState, Trigger)> {
        match state {
            PipelineState::Processing => self
                .processing
                .map(|d| (d, PipelineState::Error, Trigger::Timeout)),
            PipelineState::Error => self
                .error_recovery
                .map(|d| (d, PipelineState::Listening, Trigger::Recovery)),
            PipelineState::Interrupted => self
                .interrupted
                .map(|d| (d, PipelineState::Listening, Trigger::Timeout)),
            s if s.is_mode() => self
                .mode
                .map(|d| (d, PipelineState::Listening, Trigger::Timeout)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PipelineState::*;

    #[test]
    fn test_self_transitions_are_illegal() {
        for state in PipelineState::ALL {
            assert!(!state.can_transition_to(state), "{state} -> {state}");
        }
    }

    #[test]
    fn test_idle_reachable_from_everywhere_else() {
        for state in PipelineState::ALL {
            if state != Idle {
                assert!(state.can_transition_to(Idle), "{state} -> idle");
            }
        }
    }

    #[test]
    fn test_core_cycle_is_legal() {
        assert!(Idle.can_transition_to(Listening));
        assert!(Listening.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Speaking));
        assert!(Speaking.can_transition_to(Listening));
        assert!(Speaking.can_transition_to(Interrupted));
        assert!(Interrupted.can_transition_to(Listening));
        assert!(Error.can_transition_to(Listening));
    }

    #[test]
    fn test_shortcuts_are_refused() {
        assert!(!Idle.can_transition_to(Speaking));
        assert!(!Idle.can_transition_to(Processing));
        assert!(!Speaking.can_transition_to(Processing));
        assert!(!Listening.can_transition_to(Interrupted));
        assert!(!Error.can_transition_to(Speaking));
        assert!(!Briefing.can_transition_to(Coaching));
    }

    #[test]
    fn test_modes_enter_from_listening_and_processing_only() {
        for mode in [Briefing, Researching, Coaching, Learning] {
            assert!(mode.is_mode());
            assert!(Listening.can_transition_to(mode));
            assert!(Processing.can_transition_to(mode));
            assert!(!Speaking.can_transition_to(mode));
            assert!(mode.can_transition_to(Speaking));
        }
    }

    #[test]
    fn test_display_matches_serde_name() {
        for state in PipelineState::ALL {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state));
        }
    }

    #[test]
    fn test_timeouts_map_to_recovery_targets() {
        let timeouts = StateTimeouts::default();
        assert_eq!(timeouts.for_state(Processing).unwrap().1, Error);
        assert_eq!(
            timeouts.for_state(Error).unwrap().1,
            Listening
        );
        assert_eq!(timeouts.for_state(Coaching).unwrap().2, Trigger::Timeout);
        assert!(timeouts.for_state(Listening).is_none());
        assert!(timeouts.for_state(Speaking).is_none());
        assert!(StateTimeouts::disabled().for_state(Processing).is_none());
    }
}

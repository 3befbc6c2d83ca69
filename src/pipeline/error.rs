//! Error classification and reporting for pipeline components.
//!
//! Errors are contained at the component that can act on them: they are
//! reported with state, trigger and timing context, never re-thrown across
//! component boundaries.

use crate::state::{PipelineState, Trigger};
use std::fmt;
use std::time::Duration;

/// How a component error is handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentError {
    /// Device or network I/O that is retried with bounded attempts.
    Transient(String),
    /// The audio route moved; healed by re-assertion.
    Drift(String),
    /// A streaming connection failed; surfaced as a fallback event.
    Protocol(String),
    /// Missing or invalid configuration; disables the dependent feature.
    Fatal(String),
}

impl ComponentError {
    pub fn message(&self) -> &str {
        match self {
            ComponentError::Transient(msg)
            | ComponentError::Drift(msg)
            | ComponentError::Protocol(msg)
            | ComponentError::Fatal(msg) => msg,
        }
    }
}

impl fmt::Display for ComponentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentError::Transient(msg) => write!(f, "Transient error: {}", msg),
            ComponentError::Drift(msg) => write!(f, "Device drift: {}", msg),
            ComponentError::Protocol(msg) => write!(f, "Connection failure: {}", msg),
            ComponentError::Fatal(msg) => write!(f, "Fatal error: {}", msg),
        }
    }
}

impl std::error::Error for ComponentError {}

/// Where and when an error happened.
#[derive(Debug, Clone, Copy)]
pub struct ErrorContext {
    pub state: PipelineState,
    pub trigger: Option<Trigger>,
    /// Time spent in `state` when the error was caught.
    pub elapsed: Duration,
}

/// Trait for reporting component errors.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, component: &str, error: &ComponentError, context: &ErrorContext);
}

/// Reporter that writes to the `tracing` log at a level fitting the class.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, component: &str, error: &ComponentError, context: &ErrorContext) {
        let state = context.state.as_str();
        let trigger = context.trigger.map(|t| format!("{:?}", t)).unwrap_or_default();
        let elapsed_ms = context.elapsed.as_millis() as u64;
        match error {
            ComponentError::Drift(_) => {
                tracing::debug!(component, state, trigger, elapsed_ms, error = %error, "component error")
            }
            ComponentError::Transient(_) | ComponentError::Protocol(_) => {
                tracing::warn!(component, state, trigger, elapsed_ms, error = %error, "component error")
            }
            ComponentError::Fatal(_) => {
                tracing::error!(component, state, trigger, elapsed_ms, error = %error, "component error")
            }
        }
    }
}

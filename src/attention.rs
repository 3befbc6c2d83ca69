//! Attention window and follow-up grace.
//!
//! Once woken, the assistant accepts speech without the wake phrase until the
//! window has been idle for its full duration. Right after a reply finishes,
//! a short grace period keeps speaker bleed from being taken as a follow-up.

use crate::defaults;
use crate::events::{AssistantEvent, EventBus, WakeReason};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct WindowState {
    awake: bool,
    generation: u64,
    last_activity: Option<Instant>,
    sleep_timer: Option<JoinHandle<()>>,
}

struct WindowInner {
    duration: Duration,
    events: EventBus,
    state: Mutex<WindowState>,
}

/// Sliding idle timeout that decides whether the wake phrase is required.
///
/// Clones share the same window.
#[derive(Clone)]
pub struct AttentionWindow {
    inner: Arc<WindowInner>,
}

impl AttentionWindow {
    pub fn new(duration: Duration, events: EventBus) -> Self {
        Self {
            inner: Arc::new(WindowInner {
                duration,
                events,
                state: Mutex::new(WindowState::default()),
            }),
        }
    }

    /// Wakes the window and restarts the countdown.
    ///
    /// Emits `awake` only on the asleep to awake change. Returns whether the
    /// window was asleep.
    pub fn wake(&self, reason: WakeReason) -> bool {
        let was_asleep = {
            let mut state = self.lock();
            let was_asleep = !state.awake;
            state.awake = true;
            self.rearm(&mut state);
            was_asleep
        };

        if was_asleep {
            info!(?reason, window_secs = self.inner.duration.as_secs(), "Attention window awake");
            self.inner.events.emit(AssistantEvent::Awake { reason });
        }
        was_asleep
    }

    /// Restarts the countdown if awake. Does nothing while asleep.
    pub fn touch(&self) -> bool {
        let mut state = self.lock();
        if !state.awake {
            return false;
        }
        self.rearm(&mut state);
        true
    }

    pub fn is_awake(&self) -> bool {
        self.lock().awake
    }

    /// Time left before the window falls asleep, `None` while asleep.
    pub fn remaining(&self) -> Option<Duration> {
        let state = self.lock();
        if !state.awake {
            return None;
        }
        let since = state.last_activity.map(|t| t.elapsed()).unwrap_or_default();
        Some(self.inner.duration.saturating_sub(since))
    }

    /// Cancels the sleep timer and puts the window to sleep without an event.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.generation += 1;
        state.awake = false;
        if let Some(timer) = state.sleep_timer.take() {
            timer.abort();
        }
    }

    fn rearm(&self, state: &mut WindowState) {
        state.generation += 1;
        state.last_activity = Some(Instant::now());
        if let Some(timer) = state.sleep_timer.take() {
            timer.abort();
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Attention window used outside a runtime; it will not expire");
            return;
        };

        let generation = state.generation;
        let duration = self.inner.duration;
        let inner = Arc::downgrade(&self.inner);
        state.sleep_timer = Some(runtime.spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(inner) = inner.upgrade() {
                AttentionWindow { inner }.expire(generation);
            }
        }));
    }

    fn expire(&self, generation: u64) {
        {
            let mut state = self.lock();
            if state.generation != generation || !state.awake {
                return;
            }
            state.awake = false;
            state.sleep_timer = None;
        }
        info!("Attention window asleep, wake phrase required");
        self.inner.events.emit(AssistantEvent::Sleep);
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for WindowInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(timer) = state.sleep_timer.take() {
            timer.abort();
        }
    }
}

/// Suppresses follow-up capture for a short time after playback ends.
#[derive(Debug, Clone)]
pub struct FollowUpGrace {
    duration: Duration,
    until: Option<Instant>,
}

impl FollowUpGrace {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            until: None,
        }
    }

    /// Starts the grace period now.
    pub fn start(&mut self) {
        self.until = Some(Instant::now() + self.duration);
        debug!(grace_ms = self.duration.as_millis() as u64, "Follow-up grace started");
    }

    pub fn clear(&mut self) {
        self.until = None;
    }

    pub fn elapsed(&self) -> bool {
        self.until.is_none_or(|until| Instant::now() >= until)
    }
}

impl Default for FollowUpGrace {
    fn default() -> Self {
        Self::new(Duration::from_millis(defaults::FOLLOW_UP_GRACE_MS))
    }
}

/// Both checks that decide whether speech may skip the wake phrase.
#[derive(Clone)]
pub struct AttentionGate {
    pub window: AttentionWindow,
    pub grace: FollowUpGrace,
}

impl AttentionGate {
    pub fn new(window: AttentionWindow, grace: FollowUpGrace) -> Self {
        Self { window, grace }
    }

    /// Awake and past the post-playback grace period.
    pub fn accepts_follow_up(&self) -> bool {
        self.window.is_awake() && self.grace.elapsed()
    }
}

//! The orchestrator state machine.
//!
//! Every transition is validated and applied under one lock, then delivered
//! synchronously: `transition` returns only after every handler has seen the
//! event. Handlers may call `transition` themselves; such nested transitions
//! are queued and delivered after the current event, still before the outer
//! call returns. Calls from other threads wait until their own event has been
//! delivered.
//!
//! Handlers run on the thread that made the transition and must not block:
//! a concurrent caller is parked until they return.

use crate::defaults;
use crate::error::VoiceError;
use crate::state::types::{
    MachineSnapshot, PipelineState, StateSnapshot, StateTimeouts, TransitionEvent, Trigger,
};
use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::ThreadId;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Handler invoked for transition events.
pub type TransitionHandler = Arc<dyn Fn(&TransitionEvent) + Send + Sync>;

/// Why a transition was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("illegal transition from {from} to {to}")]
    Illegal {
        from: PipelineState,
        to: PipelineState,
    },
    #[error("state machine is shut down")]
    ShutDown,
}

impl From<TransitionError> for VoiceError {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::Illegal { from, to } => VoiceError::IllegalTransition { from, to },
            TransitionError::ShutDown => VoiceError::Other(e.to_string()),
        }
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Handlers {
    next_id: u64,
    on_enter: HashMap<PipelineState, Vec<TransitionHandler>>,
    subscribers: Vec<(SubscriptionId, TransitionHandler)>,
}

struct Inner {
    state: PipelineState,
    entered_at: Instant,
    /// Bumped on every transition; a timeout fires only if it still matches.
    epoch: u64,
    sequence: u64,
    timeout_task: Option<JoinHandle<()>>,
    history: VecDeque<StateSnapshot>,
    queue: VecDeque<TransitionEvent>,
    drainer: Option<ThreadId>,
    delivered_seq: u64,
    shut_down: bool,
}

pub struct StateMachine {
    inner: Mutex<Inner>,
    delivered: Condvar,
    handlers: Mutex<Handlers>,
    timeouts: StateTimeouts,
    history_limit: usize,
    weak_self: Weak<StateMachine>,
}

impl StateMachine {
    /// Creates a machine in `idle` with the given per-state timeouts.
    pub fn new(timeouts: StateTimeouts) -> Arc<Self> {
        Self::with_initial(PipelineState::Idle, timeouts)
    }

    /// Creates a machine starting in `initial`. No timeout is armed for it.
    pub fn with_initial(initial: PipelineState, timeouts: StateTimeouts) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let mut history = VecDeque::new();
            history.push_back(StateSnapshot {
                state: initial,
                trigger: Trigger::Startup,
                metadata: None,
                sequence: 0,
                entered_at_ms: unix_ms(),
                duration_ms: None,
            });
            Self {
                inner: Mutex::new(Inner {
                    state: initial,
                    entered_at: Instant::now(),
                    epoch: 0,
                    sequence: 0,
                    timeout_task: None,
                    history,
                    queue: VecDeque::new(),
                    drainer: None,
                    delivered_seq: 0,
                    shut_down: false,
                }),
                delivered: Condvar::new(),
                handlers: Mutex::new(Handlers::default()),
                timeouts,
                history_limit: defaults::STATE_HISTORY_LIMIT,
                weak_self: weak.clone(),
            }
        })
    }

    pub fn state(&self) -> PipelineState {
        self.lock_inner().state
    }

    /// Validates and applies a transition, then delivers it to every handler.
    ///
    /// Illegal transitions leave the state untouched and deliver nothing.
    pub fn transition(
        &self,
        target: PipelineState,
        trigger: Trigger,
        metadata: Option<serde_json::Value>,
    ) -> Result<TransitionEvent, TransitionError> {
        match self.apply(target, trigger, metadata, None)? {
            Some(event) => Ok(event),
            // Only epoch-guarded calls can come back empty.
            None => Err(TransitionError::ShutDown),
        }
    }

    /// Registers a side effect run whenever `state` is entered.
    ///
    /// `on_enter` handlers run before general subscribers.
    pub fn on_enter<F>(&self, state: PipelineState, handler: F)
    where
        F: Fn(&TransitionEvent) + Send + Sync + 'static,
    {
        self.lock_handlers()
            .on_enter
            .entry(state)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Registers an observer for every transition.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&TransitionEvent) + Send + Sync + 'static,
    {
        let mut handlers = self.lock_handlers();
        handlers.next_id += 1;
        let id = SubscriptionId(handlers.next_id);
        handlers.subscribers.push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.lock_handlers();
        let before = handlers.subscribers.len();
        handlers.subscribers.retain(|(sid, _)| *sid != id);
        handlers.subscribers.len() != before
    }

    pub fn time_in_current_state(&self) -> Duration {
        self.lock_inner().entered_at.elapsed()
    }

    /// Full retained history, oldest first.
    pub fn history(&self) -> Vec<StateSnapshot> {
        self.lock_inner().history.iter().cloned().collect()
    }

    /// The last `n` states entered, oldest first.
    pub fn last_states(&self, n: usize) -> Vec<PipelineState> {
        let inner = self.lock_inner();
        let skip = inner.history.len().saturating_sub(n);
        inner.history.iter().skip(skip).map(|s| s.state).collect()
    }

    pub fn transition_count(&self) -> u64 {
        self.lock_inner().sequence
    }

    /// Status view with the ten most recent history entries.
    pub fn snapshot(&self) -> MachineSnapshot {
        let inner = self.lock_inner();
        let skip = inner.history.len().saturating_sub(10);
        MachineSnapshot {
            state: inner.state,
            time_in_state_ms: inner.entered_at.elapsed().as_millis() as u64,
            transitions: inner.sequence,
            recent: inner.history.iter().skip(skip).cloned().collect(),
        }
    }

    /// Cancels the pending state timeout and refuses further transitions.
    pub fn shutdown(&self) {
        let mut inner = self.lock_inner();
        inner.shut_down = true;
        inner.epoch += 1;
        if let Some(task) = inner.timeout_task.take() {
            task.abort();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock_inner().shut_down
    }

    fn apply(
        &self,
        target: PipelineState,
        trigger: Trigger,
        metadata: Option<serde_json::Value>,
        expected_epoch: Option<u64>,
    ) -> Result<Option<TransitionEvent>, TransitionError> {
        let mut inner = self.lock_inner();

        if inner.shut_down {
            return Err(TransitionError::ShutDown);
        }
        if let Some(epoch) = expected_epoch
            && epoch != inner.epoch
        {
            return Ok(None);
        }

        let from = inner.state;
        if !from.can_transition_to(target) {
            tracing::warn!(%from, to = %target, ?trigger, "refusing illegal transition");
            return Err(TransitionError::Illegal { from, to: target });
        }

        let previous_state_ms = inner.entered_at.elapsed().as_millis() as u64;
        inner.sequence += 1;
        inner.epoch += 1;
        if let Some(task) = inner.timeout_task.take() {
            task.abort();
        }
        inner.state = target;
        inner.entered_at = Instant::now();

        if let Some(last) = inner.history.back_mut() {
            last.duration_ms = Some(previous_state_ms);
        }
        let sequence = inner.sequence;
        inner.history.push_back(StateSnapshot {
            state: target,
            trigger,
            metadata: metadata.clone(),
            sequence,
            entered_at_ms: unix_ms(),
            duration_ms: None,
        });
        while inner.history.len() > self.history_limit {
            inner.history.pop_front();
        }

        let epoch = inner.epoch;
        inner.timeout_task = self.arm_timeout(target, epoch);

        let event = TransitionEvent {
            from,
            to: target,
            trigger,
            metadata,
            sequence,
            previous_state_ms,
        };
        tracing::debug!(%from, to = %target, ?trigger, sequence, "transition");
        inner.queue.push_back(event.clone());

        let me = std::thread::current().id();
        match inner.drainer {
            // Nested call from a handler: the outer drain loop delivers it.
            Some(drainer) if drainer == me => Ok(Some(event)),
            Some(_) => {
                let guard = self
                    .delivered
                    .wait_while(inner, |i| i.delivered_seq < sequence)
                    .unwrap_or_else(|e| e.into_inner());
                drop(guard);
                Ok(Some(event))
            }
            None => {
                inner.drainer = Some(me);
                drop(inner);
                self.drain();
                Ok(Some(event))
            }
        }
    }

    /// Delivers queued events in order until the queue is empty.
    fn drain(&self) {
        loop {
            let event = {
                let mut inner = self.lock_inner();
                match inner.queue.pop_front() {
                    Some(event) => event,
                    None => {
                        inner.drainer = None;
                        self.delivered.notify_all();
                        return;
                    }
                }
            };

            self.deliver(&event);

            let mut inner = self.lock_inner();
            inner.delivered_seq = event.sequence;
            self.delivered.notify_all();
        }
    }

    fn deliver(&self, event: &TransitionEvent) {
        let (enter, subscribers): (Vec<TransitionHandler>, Vec<TransitionHandler>) = {
            let handlers = self.lock_handlers();
            (
                handlers.on_enter.get(&event.to).cloned().unwrap_or_default(),
                handlers.subscribers.iter().map(|(_, h)| Arc::clone(h)).collect(),
            )
        };

        for handler in enter.iter().chain(subscribers.iter()) {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::error!(
                    from = %event.from,
                    to = %event.to,
                    trigger = ?event.trigger,
                    "transition handler panicked"
                );
            }
        }
    }

    fn arm_timeout(&self, state: PipelineState, epoch: u64) -> Option<JoinHandle<()>> {
        let (delay, target, trigger) = self.timeouts.for_state(state)?;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(%state, "no runtime, state timeout not armed");
            return None;
        };

        let machine = self.weak_self.clone();
        Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(machine) = machine.upgrade() else {
                return;
            };
            let metadata = serde_json::json!({ "timeout_ms": delay.as_millis() as u64 });
            // May wait for another thread's delivery; keep that off the async
            // workers. Applying aborts this task, so the result is handled here.
            let fire = tokio::task::spawn_blocking(move || {
                match machine.apply(target, trigger, Some(metadata), Some(epoch)) {
                    Ok(Some(_)) => {
                        tracing::info!(from = %state, to = %target, "state timeout fired")
                    }
                    Ok(None) | Err(TransitionError::ShutDown) => {}
                    Err(e) => tracing::warn!(error = %e, "state timeout transition refused"),
                }
            });
            if let Err(e) = fire.await
                && e.is_panic()
            {
                tracing::error!("state timeout transition panicked");
            }
        }))
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_handlers(&self) -> MutexGuard<'_, Handlers> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for StateMachine {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock()
            && let Some(task) = inner.timeout_task.take()
        {
            task.abort();
        }
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn machine() -> Arc<StateMachine> {
        StateMachine::new(StateTimeouts::disabled())
    }

    fn recorder(machine: &StateMachine) -> Arc<Mutex<Vec<TransitionEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        machine.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
        seen
    }

    #[test]
    fn test_every_legal_pair_emits_exactly_one_event() {
        for from in PipelineState::ALL {
            for to in PipelineState::ALL {
                if !from.can_transition_to(to) {
                    continue;
                }
                let machine = StateMachine::with_initial(from, StateTimeouts::disabled());
                let seen = recorder(&machine);

                let event = machine.transition(to, Trigger::Manual, None).unwrap();

                assert_eq!(machine.state(), to);
                assert_eq!(event.from, from);
                assert_eq!(seen.lock().unwrap().len(), 1, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_every_illegal_pair_is_refused_silently() {
        for from in PipelineState::ALL {
            for to in PipelineState::ALL {
                if from.can_transition_to(to) {
                    continue;
                }
                let machine = StateMachine::with_initial(from, StateTimeouts::disabled());
                let seen = recorder(&machine);

                let result = machine.transition(to, Trigger::Manual, None);

                assert_eq!(result, Err(TransitionError::Illegal { from, to }));
                assert_eq!(machine.state(), from);
                assert!(seen.lock().unwrap().is_empty(), "{from} -> {to}");
                assert_eq!(machine.transition_count(), 0);
            }
        }
    }

    #[test]
    fn test_delivery_is_synchronous_and_on_enter_runs_first() {
        let machine = machine();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        machine.subscribe(move |_| o.lock().unwrap().push("subscriber"));
        let o = Arc::clone(&order);
        machine.on_enter(PipelineState::Listening, move |_| {
            o.lock().unwrap().push("on_enter")
        });

        machine
            .transition(PipelineState::Listening, Trigger::Startup, None)
            .unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["on_enter", "subscriber"]);
    }

    #[test]
    fn test_nested_transition_is_delivered_after_current_before_return() {
        let machine = machine();
        let seen = recorder(&machine);

        let weak = Arc::downgrade(&machine);
        machine.on_enter(PipelineState::Error, move |_| {
            if let Some(m) = weak.upgrade() {
                m.transition(PipelineState::Listening, Trigger::Recovery, None)
                    .unwrap();
            }
        });

        machine
            .transition(PipelineState::Error, Trigger::Failure, None)
            .unwrap();

        let states: Vec<_> = seen.lock().unwrap().iter().map(|e| e.to).collect();
        assert_eq!(states, vec![PipelineState::Error, PipelineState::Listening]);
        assert_eq!(machine.state(), PipelineState::Listening);
    }

    #[test]
    fn test_panicking_handler_does_not_poison_machine() {
        let machine = machine();
        machine.subscribe(|_| panic!("handler bug"));
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        machine.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        machine
            .transition(PipelineState::Listening, Trigger::Startup, None)
            .unwrap();
        machine
            .transition(PipelineState::Processing, Trigger::WakeWord, None)
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(machine.state(), PipelineState::Processing);
    }

    #[test]
    fn test_concurrent_transitions_are_serialized() {
        let machine = StateMachine::with_initial(PipelineState::Listening, StateTimeouts::disabled());
        let seen = recorder(&machine);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&machine);
                std::thread::spawn(move || {
                    m.transition(PipelineState::Processing, Trigger::WakeWord, None)
                        .is_ok()
                })
            })
            .collect();
        let ok = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&ok| ok)
            .count();

        // Only the first wins; the rest see processing -> processing
        assert_eq!(ok, 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let machine = machine();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let id = machine.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(machine.unsubscribe(id));
        machine
            .transition(PipelineState::Listening, Trigger::Startup, None)
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!machine.unsubscribe(id));
    }

    #[test]
    fn test_history_is_bounded() {
        let machine = StateMachine::with_initial(PipelineState::Listening, StateTimeouts::disabled());
        for _ in 0..300 {
            machine
                .transition(PipelineState::Processing, Trigger::WakeWord, None)
                .unwrap();
            machine
                .transition(PipelineState::Listening, Trigger::CommandComplete, None)
                .unwrap();
        }

        let history = machine.history();
        assert_eq!(history.len(), defaults::STATE_HISTORY_LIMIT);
        assert_eq!(history.last().unwrap().sequence, 600);
        assert!(history.last().unwrap().duration_ms.is_none());
        assert!(history[0].duration_ms.is_some());
        assert_eq!(
            machine.last_states(2),
            vec![PipelineState::Processing, PipelineState::Listening]
        );
    }

    #[test]
    fn test_snapshot_serializes() {
        let machine = machine();
        machine
            .transition(
                PipelineState::Listening,
                Trigger::Startup,
                Some(serde_json::json!({"source": "test"})),
            )
            .unwrap();

        let snapshot = machine.snapshot();
        assert_eq!(snapshot.state, PipelineState::Listening);
        assert_eq!(snapshot.transitions, 1);
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"state\":\"listening\""), "{json}");
    }

    #[test]
    fn test_shutdown_refuses_transitions() {
        let machine = machine();
        machine.shutdown();
        assert_eq!(
            machine.transition(PipelineState::Listening, Trigger::Startup, None),
            Err(TransitionError::ShutDown)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_processing_watchdog_fires_error_then_recovers() {
        let timeouts = StateTimeouts {
            processing: Some(Duration::from_secs(5)),
            error_recovery: Some(Duration::from_secs(1)),
            interrupted: None,
            mode: None,
        };
        let machine = StateMachine::with_initial(PipelineState::Listening, timeouts);
        let seen = recorder(&machine);

        machine
            .transition(PipelineState::Processing, Trigger::WakeWord, None)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5001)).await;
        assert_eq!(machine.state(), PipelineState::Error);

        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert_eq!(machine.state(), PipelineState::Listening);

        let triggers: Vec<_> = seen.lock().unwrap().iter().map(|e| e.trigger).collect();
        assert_eq!(
            triggers,
            vec![Trigger::WakeWord, Trigger::Timeout, Trigger::Recovery]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_cancelled_by_a_later_transition() {
        let timeouts = StateTimeouts {
            processing: Some(Duration::from_secs(5)),
            ..StateTimeouts::disabled()
        };
        let machine = StateMachine::with_initial(PipelineState::Listening, timeouts);

        machine
            .transition(PipelineState::Processing, Trigger::WakeWord, None)
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        machine
            .transition(PipelineState::Speaking, Trigger::ReplyReady, None)
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(machine.state(), PipelineState::Speaking);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_delivers_off_the_runtime_thread() {
        let timeouts = StateTimeouts {
            interrupted: Some(Duration::from_secs(1)),
            ..StateTimeouts::disabled()
        };
        let machine = StateMachine::with_initial(PipelineState::Speaking, timeouts);
        let delivered_on = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delivered_on);
        machine.subscribe(move |_| sink.lock().unwrap().push(std::thread::current().id()));

        machine
            .transition(PipelineState::Interrupted, Trigger::BargeIn, None)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1001)).await;

        assert_eq!(machine.state(), PipelineState::Listening);
        let threads = delivered_on.lock().unwrap().clone();
        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0], std::thread::current().id());
        assert_ne!(threads[1], std::thread::current().id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_timeout() {
        let timeouts = StateTimeouts {
            interrupted: Some(Duration::from_secs(1)),
            ..StateTimeouts::disabled()
        };
        let machine = StateMachine::with_initial(PipelineState::Speaking, timeouts);
        machine
            .transition(PipelineState::Interrupted, Trigger::BargeIn, None)
            .unwrap();

        machine.shutdown();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(machine.state(), PipelineState::Interrupted);
    }
}

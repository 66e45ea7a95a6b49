// State management module
//
// This module provides the StateMachine which owns the controller's RunState and
// RunContext, enforces the transition table and fans every change out to observers
// and broadcast subscribers.

pub mod observers;

pub use observers::{ObserverId, ObserverRegistry, StateObserver};

use crate::metrics::Metrics;
use crate::models::{RunContext, RunState};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::broadcast;

/// Transitions kept by [`StateMachine::history`]
pub const MAX_HISTORY: usize = 256;

/// Legal successors of `state`
pub fn successors(state: RunState) -> &'static [RunState] {
    use RunState::*;

    match state {
        NotStarted => &[Idle],
        Idle => &[Initializing, Ready],
        Initializing => &[Running, Failed, Ready],
        Ready => &[Running, Idle],
        Running => &[Paused, Completed, Failed, Stopped, Error],
        Paused => &[Running, Stopped],
        Completed | Failed | Stopped | Error => &[Idle],
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: RunState, to: RunState },
}

/// Partial update merged into the [`RunContext`] on a transition.
///
/// Fields left unset keep their current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextUpdate {
    progress: Option<f64>,
    current_item: Option<String>,
    status: Option<String>,
    error: Option<Option<String>>,
    total_images: Option<usize>,
    processed_images: Option<usize>,
}

impl ContextUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn current_item(mut self, item: impl Into<String>) -> Self {
        self.current_item = Some(item.into());
        self
    }

    pub fn clear_current_item(mut self) -> Self {
        self.current_item = Some(String::new());
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    pub fn total_images(mut self, total: usize) -> Self {
        self.total_images = Some(total);
        self
    }

    pub fn processed_images(mut self, processed: usize) -> Self {
        self.processed_images = Some(processed);
        self
    }

    fn apply(self, context: &mut RunContext) {
        if let Some(progress) = self.progress {
            // NaN falls through to the current value
            context.progress = progress.clamp(0.0, 1.0).max(context.progress);
        }
        if let Some(item) = self.current_item {
            context.current_item = item;
        }
        if let Some(status) = self.status {
            context.status = status;
        }
        if let Some(error) = self.error {
            context.error = error;
        }
        if let Some(total) = self.total_images {
            context.total_images = total;
        }
        if let Some(processed) = self.processed_images {
            context.processed_images = processed;
        }
    }
}

/// Event mirrored to broadcast subscribers for every notification
#[derive(Clone, Debug, PartialEq)]
pub struct StateEvent {
    pub state: RunState,
    pub context: RunContext,
}

/// One accepted transition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: RunState,
    pub to: RunState,
    pub at: Instant,
}

struct Inner {
    state: RunState,
    context: RunContext,
    history: VecDeque<Transition>,
}

/// Guarded run lifecycle with change notification
///
/// This is the only place a [`RunState`] or [`RunContext`] changes:
/// - [`transition_to()`](Self::transition_to) validates against [`successors`]
///   and merges a [`ContextUpdate`]
/// - [`update_context()`](Self::update_context) reports progress without a state change
/// - [`register_observer()`](Self::register_observer) and
///   [`subscribe()`](Self::subscribe) are the two ways to listen
///
/// Notifications are queued while the state lock is held, so observers see
/// changes in the order they were accepted, and delivered after it is released,
/// so an observer may call back into the machine.
pub struct StateMachine {
    inner: Mutex<Inner>,
    observers: ObserverRegistry,
    event_tx: broadcast::Sender<StateEvent>,
    metrics: Option<Arc<Metrics>>,
}

impl StateMachine {
    /// Create a machine in `NotStarted` with a broadcast buffer of 100 events
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            inner: Mutex::new(Inner {
                state: RunState::NotStarted,
                context: RunContext::default(),
                history: VecDeque::new(),
            }),
            observers: ObserverRegistry::new(),
            event_tx,
            metrics: None,
        }
    }

    pub fn with_metrics(metrics: Arc<Metrics>) -> Self {
        Self {
            observers: ObserverRegistry::with_metrics(metrics.clone()),
            metrics: Some(metrics),
            ..Self::new()
        }
    }

    pub fn state(&self) -> RunState {
        self.lock().state
    }

    pub fn context(&self) -> RunContext {
        self.lock().context.clone()
    }

    /// Current state and a clone of the context, taken together
    pub fn snapshot(&self) -> (RunState, RunContext) {
        let inner = self.lock();
        (inner.state, inner.context.clone())
    }

    /// Execute a function with read access to the context
    ///
    /// # Example
    /// ```ignore
    /// let done = machine.read(|state, context| (state, context.processed_images));
    /// ```
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(RunState, &RunContext) -> R,
    {
        let inner = self.lock();
        f(inner.state, &inner.context)
    }

    pub fn can_transition_to(&self, target: RunState) -> bool {
        successors(self.state()).contains(&target)
    }

    /// Move to `target`, merging `update` into the context.
    ///
    /// Observers are notified in transition order. If no other caller is
    /// draining the observer queue, that has happened by the time this
    /// returns. Otherwise the caller already draining (an observer callback
    /// further up this stack, or another thread) delivers the notification,
    /// possibly after this returns.
    pub fn transition_to(&self, target: RunState, update: ContextUpdate) -> Result<(), StateError> {
        let drain = {
            let mut inner = self.lock();
            let from = inner.state;
            if !successors(from).contains(&target) {
                tracing::warn!("Rejected state transition {} -> {}", from, target);
                return Err(StateError::InvalidTransition { from, to: target });
            }

            let now = Instant::now();
            inner.state = target;
            update.apply(&mut inner.context);
            if target == RunState::Running && inner.context.started_at.is_none() {
                inner.context.started_at = Some(now);
            }
            if target.is_terminal() {
                inner.context.finished_at = Some(now);
            }

            if inner.history.len() == MAX_HISTORY {
                inner.history.pop_front();
            }
            inner.history.push_back(Transition { from, to: target, at: now });

            tracing::debug!("State transition {} -> {}", from, target);
            if let Some(metrics) = &self.metrics {
                metrics.record_transition();
            }

            self.publish(&inner)
        };

        if drain {
            self.observers.drain();
        }
        Ok(())
    }

    /// Merge `update` and notify without changing state
    pub fn update_context(&self, update: ContextUpdate) {
        let drain = {
            let mut inner = self.lock();
            update.apply(&mut inner.context);
            self.publish(&inner)
        };

        if drain {
            self.observers.drain();
        }
    }

    /// Replace the context with a fresh one. Silent; the next transition reports it.
    pub fn reset_context(&self) {
        self.lock().context = RunContext::default();
    }

    /// Add an observer; it is called once right away with the current snapshot
    pub fn register_observer(&self, observer: impl StateObserver + 'static) -> ObserverId {
        let (id, drain) = {
            let inner = self.lock();
            let id = self.observers.add(Arc::new(observer));
            let drain = self
                .observers
                .enqueue_one(id, inner.state, inner.context.clone());
            (id, drain)
        };

        if drain {
            self.observers.drain();
        }
        id
    }

    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        self.observers.unregister(id)
    }

    /// Subscribe to state events
    ///
    /// Returns a receiver that will get every future notification.
    /// Slow receivers may lag; see [`broadcast::error::RecvError::Lagged`].
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.event_tx.subscribe()
    }

    /// Accepted transitions, oldest first, up to [`MAX_HISTORY`]
    pub fn history(&self) -> Vec<Transition> {
        self.lock().history.iter().copied().collect()
    }

    fn publish(&self, inner: &Inner) -> bool {
        // Ignore send errors - it's OK if no one is listening
        let _ = self.event_tx.send(StateEvent {
            state: inner.state,
            context: inner.context.clone(),
        });
        self.observers
            .enqueue_all(inner.state, inner.context.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_machine() -> StateMachine {
        let machine = StateMachine::new();
        machine.transition_to(RunState::Idle, ContextUpdate::new()).unwrap();
        machine
            .transition_to(RunState::Initializing, ContextUpdate::new())
            .unwrap();
        machine.transition_to(RunState::Ready, ContextUpdate::new()).unwrap();
        machine
    }

    #[test]
    fn test_new_machine_not_started() {
        let machine = StateMachine::new();
        let (state, context) = machine.snapshot();

        assert_eq!(state, RunState::NotStarted);
        assert_eq!(context, RunContext::default());
        assert!(machine.history().is_empty());
    }

    #[test]
    fn test_every_table_entry_accepted() {
        let all = [
            RunState::NotStarted,
            RunState::Idle,
            RunState::Initializing,
            RunState::Ready,
            RunState::Running,
            RunState::Paused,
            RunState::Completed,
            RunState::Failed,
            RunState::Error,
            RunState::Stopped,
        ];

        for from in all {
            for to in all {
                let machine = StateMachine::new();
                machine.lock().state = from;
                let result = machine.transition_to(to, ContextUpdate::new());
                assert_eq!(
                    result.is_ok(),
                    successors(from).contains(&to),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_invalid_transition_changes_nothing() {
        let machine = StateMachine::new();

        let err = machine
            .transition_to(RunState::Running, ContextUpdate::new().progress(0.5))
            .unwrap_err();

        assert_eq!(
            err,
            StateError::InvalidTransition {
                from: RunState::NotStarted,
                to: RunState::Running
            }
        );
        assert_eq!(machine.state(), RunState::NotStarted);
        assert_eq!(machine.context().progress, 0.0);
        assert!(machine.history().is_empty());
    }

    #[test]
    fn test_progress_clamped_and_monotonic() {
        let machine = ready_machine();
        machine
            .transition_to(RunState::Running, ContextUpdate::new().progress(0.5))
            .unwrap();

        machine.update_context(ContextUpdate::new().progress(0.25));
        assert_eq!(machine.context().progress, 0.5);

        machine.update_context(ContextUpdate::new().progress(f64::NAN));
        assert_eq!(machine.context().progress, 0.5);

        machine.update_context(ContextUpdate::new().progress(7.0));
        assert_eq!(machine.context().progress, 1.0);
    }

    #[test]
    fn test_timestamps_stamped() {
        let machine = ready_machine();
        machine.transition_to(RunState::Running, ContextUpdate::new()).unwrap();
        let started = machine.context().started_at;
        assert!(started.is_some());

        machine.transition_to(RunState::Paused, ContextUpdate::new()).unwrap();
        machine.transition_to(RunState::Running, ContextUpdate::new()).unwrap();
        assert_eq!(machine.context().started_at, started);
        assert!(machine.context().finished_at.is_none());

        machine
            .transition_to(RunState::Completed, ContextUpdate::new().progress(1.0))
            .unwrap();
        assert!(machine.context().finished_at.is_some());
    }

    #[test]
    fn test_reset_context_allows_progress_restart() {
        let machine = ready_machine();
        machine
            .transition_to(RunState::Running, ContextUpdate::new().progress(1.0))
            .unwrap();

        machine.reset_context();

        assert_eq!(machine.context().progress, 0.0);
        assert_eq!(machine.state(), RunState::Running);
    }

    #[test]
    fn test_context_update_fields() {
        let machine = StateMachine::new();
        machine.update_context(
            ContextUpdate::new()
                .current_item("a.png")
                .status("Processing image 1/2")
                .error("boom")
                .total_images(2)
                .processed_images(1),
        );

        let context = machine.context();
        assert_eq!(context.current_item, "a.png");
        assert_eq!(context.status, "Processing image 1/2");
        assert_eq!(context.error.as_deref(), Some("boom"));
        assert_eq!(context.total_images, 2);
        assert_eq!(context.processed_images, 1);

        machine.update_context(ContextUpdate::new().clear_current_item().clear_error());
        let context = machine.context();
        assert_eq!(context.current_image(), None);
        assert_eq!(context.error, None);
    }

    #[test]
    fn test_history_bounded() {
        let machine = ready_machine();
        for _ in 0..MAX_HISTORY {
            machine.transition_to(RunState::Idle, ContextUpdate::new()).unwrap();
            machine.transition_to(RunState::Ready, ContextUpdate::new()).unwrap();
        }

        let history = machine.history();
        assert_eq!(history.len(), MAX_HISTORY);
        let last = history.last().unwrap();
        assert_eq!((last.from, last.to), (RunState::Idle, RunState::Ready));
    }

    #[test]
    fn test_observer_synced_on_register() {
        let machine = ready_machine();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        machine.register_observer(move |state: RunState, _: &RunContext| {
            sink.lock().unwrap().push(state);
        });
        machine.transition_to(RunState::Running, ContextUpdate::new()).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![RunState::Ready, RunState::Running]);
    }

    #[test]
    fn test_observer_may_transition_from_callback() {
        let machine = Arc::new(ready_machine());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&machine);
        let sink = seen.clone();
        machine.register_observer(move |state: RunState, _: &RunContext| {
            sink.lock().unwrap().push(state);
            if state == RunState::Running {
                if let Some(machine) = weak.upgrade() {
                    machine
                        .transition_to(RunState::Stopped, ContextUpdate::new())
                        .unwrap();
                }
            }
        });

        machine.transition_to(RunState::Running, ContextUpdate::new()).unwrap();

        assert_eq!(machine.state(), RunState::Stopped);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![RunState::Ready, RunState::Running, RunState::Stopped]
        );
    }

    #[test]
    fn test_subscribe_to_events() {
        let machine = StateMachine::new();
        let mut rx = machine.subscribe();

        machine.transition_to(RunState::Idle, ContextUpdate::new()).unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.state, RunState::Idle);
    }

    #[test]
    fn test_transitions_counted() {
        let metrics = Arc::new(Metrics::new());
        let machine = StateMachine::with_metrics(metrics.clone());

        machine.transition_to(RunState::Idle, ContextUpdate::new()).unwrap();
        let _ = machine.transition_to(RunState::Running, ContextUpdate::new());

        assert_eq!(
            metrics
                .state_transitions
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }
}

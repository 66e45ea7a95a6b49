// Observer fan-out
//
// Callbacks are invoked in registration order, one delivery at a time. Producers
// push deliveries onto a queue; whichever caller finds the queue idle drains it.
// A notification raised from inside an observer is queued and delivered after the
// current one instead of recursing.

use crate::metrics::Metrics;
use crate::models::{RunContext, RunState};
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Receives every state and progress change of a [`StateMachine`](super::StateMachine).
///
/// Any `Fn(RunState, &RunContext) + Send + Sync` closure is an observer.
pub trait StateObserver: Send + Sync {
    fn on_state_change(&self, state: RunState, context: &RunContext);
}

impl<F> StateObserver for F
where
    F: Fn(RunState, &RunContext) + Send + Sync,
{
    fn on_state_change(&self, state: RunState, context: &RunContext) {
        self(state, context)
    }
}

/// Handle returned by registration, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

enum Delivery {
    All(RunState, RunContext),
    One(ObserverId, RunState, RunContext),
}

#[derive(Default)]
struct DispatchQueue {
    pending: VecDeque<Delivery>,
    draining: bool,
}

/// Ordered registry of state observers
pub struct ObserverRegistry {
    observers: Mutex<Vec<(ObserverId, Arc<dyn StateObserver>)>>,
    next_id: AtomicU64,
    queue: Mutex<DispatchQueue>,
    metrics: Option<Arc<Metrics>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            queue: Mutex::new(DispatchQueue::default()),
            metrics: None,
        }
    }

    /// Count notifications and observer failures into `metrics`
    pub fn with_metrics(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics: Some(metrics),
            ..Self::new()
        }
    }

    /// Add an observer and immediately send it `(state, context)` so it starts in sync
    pub fn register(
        &self,
        observer: Arc<dyn StateObserver>,
        state: RunState,
        context: RunContext,
    ) -> ObserverId {
        let id = self.add(observer);
        if self.enqueue(Delivery::One(id, state, context)) {
            self.drain();
        }
        id
    }

    /// Remove an observer. Returns false if it was not registered.
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut observers = lock(&self.observers);
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        let removed = observers.len() != before;
        if removed {
            tracing::debug!("Unregistered observer {:?}", id);
        }
        removed
    }

    /// Deliver `(state, context)` to every registered observer
    pub fn notify(&self, state: RunState, context: RunContext) {
        if self.enqueue_all(state, context) {
            self.drain();
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.observers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn add(&self, observer: Arc<dyn StateObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.observers).push((id, observer));
        tracing::debug!("Registered observer {:?}", id);
        id
    }

    /// Queue a broadcast. Returns true when the caller must [`drain`](Self::drain).
    pub(crate) fn enqueue_all(&self, state: RunState, context: RunContext) -> bool {
        self.enqueue(Delivery::All(state, context))
    }

    pub(crate) fn enqueue_one(&self, id: ObserverId, state: RunState, context: RunContext) -> bool {
        self.enqueue(Delivery::One(id, state, context))
    }

    fn enqueue(&self, delivery: Delivery) -> bool {
        let mut queue = lock(&self.queue);
        queue.pending.push_back(delivery);
        if queue.draining {
            false
        } else {
            queue.draining = true;
            true
        }
    }

    /// Deliver queued notifications until the queue is empty.
    ///
    /// Must not be called while holding a lock an observer might take.
    pub(crate) fn drain(&self) {
        loop {
            let next = {
                let mut queue = lock(&self.queue);
                match queue.pending.pop_front() {
                    Some(delivery) => delivery,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };
            self.deliver(next);
        }
    }

    fn deliver(&self, delivery: Delivery) {
        let (target, state, context) = match delivery {
            Delivery::All(state, context) => (None, state, context),
            Delivery::One(id, state, context) => (Some(id), state, context),
        };

        // Snapshot so callbacks run without the registry lock held
        let targets: Vec<(ObserverId, Arc<dyn StateObserver>)> = lock(&self.observers)
            .iter()
            .filter(|(id, _)| target.is_none_or(|t| t == *id))
            .cloned()
            .collect();

        for (id, observer) in targets {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                observer.on_state_change(state, &context)
            }));

            match outcome {
                Ok(()) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_observer_notification();
                    }
                }
                Err(payload) => {
                    tracing::error!(
                        "Observer {:?} failed on {}: {}",
                        id,
                        state,
                        panic_message(payload.as_ref())
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_observer_failure();
                    }
                }
            }
        }
    }
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

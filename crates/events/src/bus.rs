//! Typed publish/subscribe with a bounded diagnostic history.
//!
//! ## Dispatch order
//!
//! For every emitted event, listeners registered for that event's kind run
//! first (in registration order), then wildcard listeners (in registration
//! order).
//!
//! ## Isolation
//!
//! A listener that returns an error or panics is logged and skipped. The
//! remaining listeners still run and the history buffer is left intact.
//!
//! ## Re-entrancy
//!
//! No lock is held while listeners run. A listener may emit further events,
//! subscribe, or unsubscribe itself or any other listener. A listener removed
//! during a dispatch is not invoked for the remainder of that dispatch.
//!
//! ## History
//!
//! The last `capacity` events (100 by default) are kept in a ring buffer.
//! [`EventBus::history`] returns copies, oldest first.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use modgate_core::ListenerError;

use crate::{Event, EventKind};

/// Default number of events retained for diagnostics.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Callback invoked for each matching event.
pub type Listener = Arc<dyn Fn(&Event) -> Result<(), ListenerError> + Send + Sync>;

/// Which events a listener receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Kind(EventKind),
    /// Every event, after the kind-specific listeners.
    All,
}

impl From<EventKind> for Topic {
    fn from(kind: EventKind) -> Self {
        Topic::Kind(kind)
    }
}

/// Handle identifying one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    topic: Topic,
    active: AtomicBool,
    listener: Listener,
}

struct Inner {
    listeners: Mutex<Vec<Arc<Registration>>>,
    history: Mutex<VecDeque<Event>>,
    capacity: usize,
    next_id: AtomicU64,
}

/// In-process event bus.
///
/// Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl core::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// A poisoned lock means a panic escaped while the guard was held. Listener
// panics never happen under a guard, so the protected data is still valid.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// Create a bus retaining at most `capacity` events (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                listeners: Mutex::new(Vec::new()),
                history: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Register `listener` for `topic`.
    pub fn on<F>(&self, topic: impl Into<Topic>, listener: F) -> Unsubscribe
    where
        F: Fn(&Event) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let topic = topic.into();
        let registration = Arc::new(Registration {
            id,
            topic,
            active: AtomicBool::new(true),
            listener: Arc::new(listener),
        });
        lock(&self.inner.listeners).push(registration);
        tracing::debug!(listener = id.0, ?topic, "listener registered");

        Unsubscribe {
            bus: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Remove a registration. Returns `false` if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        remove(&self.inner, id)
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }

    /// Record `event` in the history and deliver it.
    ///
    /// Returns the number of listeners that handled the event successfully.
    pub fn emit(&self, event: Event) -> usize {
        {
            let mut history = lock(&self.inner.history);
            while history.len() >= self.inner.capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        let targets: Vec<Arc<Registration>> = {
            let listeners = lock(&self.inner.listeners);
            let typed = listeners
                .iter()
                .filter(|r| r.topic == Topic::Kind(event.kind()));
            let wildcard = listeners.iter().filter(|r| r.topic == Topic::All);
            typed.chain(wildcard).cloned().collect()
        };

        let mut delivered = 0;
        for registration in targets {
            if !registration.active.load(Ordering::Acquire) {
                continue;
            }

            match catch_unwind(AssertUnwindSafe(|| (registration.listener)(&event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(err)) => {
                    tracing::error!(
                        listener = registration.id.0,
                        event_type = %event.kind(),
                        error = %err,
                        "listener failed"
                    );
                }
                Err(_) => {
                    tracing::error!(
                        listener = registration.id.0,
                        event_type = %event.kind(),
                        "listener panicked"
                    );
                }
            }
        }

        delivered
    }

    /// Copy of retained events, oldest first.
    ///
    /// `kind` keeps only that family; `limit` keeps only the most recent
    /// `limit` matches.
    pub fn history(&self, kind: Option<EventKind>, limit: Option<usize>) -> Vec<Event> {
        let history = lock(&self.inner.history);
        let matching: Vec<&Event> = history
            .iter()
            .filter(|e| kind.is_none_or(|k| e.kind() == k))
            .collect();
        let skip = limit.map_or(0, |l| matching.len().saturating_sub(l));
        matching.into_iter().skip(skip).cloned().collect()
    }

    pub fn clear_history(&self) {
        lock(&self.inner.history).clear();
    }
}

fn remove(inner: &Inner, id: ListenerId) -> bool {
    let mut listeners = lock(&inner.listeners);
    match listeners.iter().position(|r| r.id == id) {
        Some(index) => {
            let registration = listeners.remove(index);
            registration.active.store(false, Ordering::Release);
            tracing::debug!(listener = id.0, "listener removed");
            true
        }
        None => false,
    }
}

/// Removes a registration when called.
///
/// Dropping the handle keeps the listener registered. Calling
/// [`Unsubscribe::unsubscribe`] more than once, from inside a listener, or
/// after the bus is gone is harmless.
#[derive(Debug, Clone)]
pub struct Unsubscribe {
    bus: Weak<Inner>,
    id: ListenerId,
}

impl Unsubscribe {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn unsubscribe(&self) -> bool {
        match self.bus.upgrade() {
            Some(inner) => remove(&inner, self.id),
            None => false,
        }
    }
}

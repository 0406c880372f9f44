//! Correlation id → result handler bookkeeping.
//!
//! Results may arrive before the caller registers a handler (the worker can
//! finish a fast call while `call()` is still returning). Completed results
//! are therefore buffered until claimed, so registration order relative to
//! delivery never matters.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{CallError, CallId, Value};
use crate::constants::EVICTED_SENTINEL;

/// Final result of one call.
pub type CallOutcome = Result<Value, CallError>;

/// Continuation invoked with a call's outcome.
pub type ResultHandler = Box<dyn FnOnce(CallOutcome) + Send>;

/// Result of registering a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The handler is stored and will run when the result arrives.
    Pending,
    /// The result was already buffered; the handler ran immediately.
    Completed,
    /// The call was evicted or discarded and will never complete.
    ///
    /// The handler was dropped without running.
    Evicted,
}

impl Registration {
    /// Numeric code for external tooling: the id itself when accepted,
    /// [`EVICTED_SENTINEL`] when the call will never complete.
    pub fn code(self, id: CallId) -> i64 {
        match self {
            Self::Pending | Self::Completed => i64::try_from(id).unwrap_or(i64::MAX),
            Self::Evicted => EVICTED_SENTINEL,
        }
    }
}

enum Slot {
    Waiting(ResultHandler),
    Ready(CallOutcome),
    Released,
}

/// Handlers and buffered results keyed by correlation id.
///
/// Every mutation happens under one lock; handlers always run after the
/// lock is released.
#[derive(Default)]
pub struct CallbackRegistry {
    slots: Mutex<HashMap<CallId, Slot>>,
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("waiting", &self.waiting())
            .field("buffered", &self.buffered())
            .finish_non_exhaustive()
    }
}

impl CallbackRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CallId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach `handler` to `id`.
    ///
    /// Replaces any handler already waiting on the same id.
    pub fn register(&self, id: CallId, handler: ResultHandler) -> Registration {
        let mut slots = self.lock();
        match slots.remove(&id) {
            Some(Slot::Ready(outcome)) => {
                drop(slots);
                handler(outcome);
                Registration::Completed
            }
            Some(Slot::Released) => Registration::Evicted,
            Some(Slot::Waiting(_)) | None => {
                slots.insert(id, Slot::Waiting(handler));
                Registration::Pending
            }
        }
    }

    /// Deliver the outcome of `id`: run its handler or buffer the result.
    pub fn deliver(&self, id: CallId, outcome: CallOutcome) {
        let mut slots = self.lock();
        match slots.remove(&id) {
            Some(Slot::Waiting(handler)) => {
                drop(slots);
                handler(outcome);
            }
            Some(Slot::Released) => {
                // Released ids never complete.
                slots.insert(id, Slot::Released);
            }
            Some(Slot::Ready(_)) | None => {
                slots.insert(id, Slot::Ready(outcome));
            }
        }
    }

    /// Release `ids` that will never run.
    ///
    /// Waiting handlers are invoked once with `reason` and their entries
    /// removed. Ids nobody has registered for yet keep a marker until the
    /// late registration, which reports [`Registration::Evicted`].
    pub fn release(&self, ids: &[CallId], reason: &CallError) {
        if ids.is_empty() {
            return;
        }
        let mut handlers = Vec::new();
        {
            let mut slots = self.lock();
            for &id in ids {
                match slots.remove(&id) {
                    Some(Slot::Waiting(handler)) => handlers.push(handler),
                    Some(Slot::Ready(outcome)) => {
                        slots.insert(id, Slot::Ready(outcome));
                    }
                    Some(Slot::Released) | None => {
                        slots.insert(id, Slot::Released);
                    }
                }
            }
        }
        for handler in handlers {
            handler(Err(reason.clone()));
        }
    }

    /// Number of ids with any bookkeeping left.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of handlers waiting for a result.
    pub fn waiting(&self) -> usize {
        self.lock()
            .values()
            .filter(|s| matches!(s, Slot::Waiting(_)))
            .count()
    }

    /// Number of results delivered but not yet claimed.
    pub fn buffered(&self) -> usize {
        self.lock()
            .values()
            .filter(|s| matches!(s, Slot::Ready(_)))
            .count()
    }
}

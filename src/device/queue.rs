//! Bounded FIFO of pending calls for one device.
//!
//! The queue is shared between the [`AsyncDevice`](super::AsyncDevice)
//! (producer) and exactly one worker thread (consumer). A `close` call jumps
//! the line and discards everything else, because it terminates the worker.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{CallArgs, CallError};
use crate::constants::{CLOSE_METHOD, DEFAULT_MAX_QUEUE};

/// Correlation id of one call, unique per device handle.
pub type CallId = u64;

/// One queued invocation.
#[derive(Debug, Clone)]
pub struct PendingCall {
    /// Correlation id handed back to the caller.
    pub id: CallId,
    /// When the call entered the queue.
    pub enqueued_at: Instant,
    /// Method to invoke.
    pub method: String,
    /// Arguments for the method.
    pub args: CallArgs,
}

impl PendingCall {
    /// Create a call stamped with the current time.
    pub fn new(id: CallId, method: impl Into<String>, args: CallArgs) -> Self {
        Self {
            id,
            enqueued_at: Instant::now(),
            method: method.into(),
            args,
        }
    }

    /// Whether this is the terminating `close` call.
    pub fn is_close(&self) -> bool {
        self.method == CLOSE_METHOD
    }
}

/// What to drop when a full queue receives another call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Drop the `n` oldest calls.
    ///
    /// The enqueue time of the `n`-th oldest call becomes the cutoff; every
    /// call at or before it is dropped.
    Oldest(usize),
    /// Drop every call that has waited longer than this.
    ///
    /// If nothing is that old the single oldest call is dropped so the new
    /// one still fits.
    OlderThan(Duration),
}

/// Queue limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    /// Pending calls allowed before the queue counts as full.
    ///
    /// The limit is checked before appending, so a full queue holds
    /// `max_queue + 1` calls.
    pub max_queue: usize,
    /// Eviction policy; `None` rejects calls on a full queue.
    pub eviction: Option<EvictionPolicy>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_queue: DEFAULT_MAX_QUEUE,
            eviction: None,
        }
    }
}

impl QueueOptions {
    /// Options with the default eviction policy: drop the older half.
    pub fn evicting(max_queue: usize) -> Self {
        Self {
            max_queue,
            eviction: Some(EvictionPolicy::Oldest((max_queue / 2).max(1))),
        }
    }
}

#[derive(Debug)]
struct QueueState {
    pending: VecDeque<PendingCall>,
    running: bool,
}

/// Pending calls of one device plus the worker's run flag.
#[derive(Debug)]
pub struct CommandQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    options: QueueOptions,
}

impl CommandQueue {
    /// Create an empty, running queue.
    pub fn new(options: QueueOptions) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                running: true,
            }),
            available: Condvar::new(),
            options,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a call.
    ///
    /// Returns the ids of calls evicted to make room. Fails with
    /// [`CallError::QueueFull`] when full and no eviction is configured, or
    /// [`CallError::Closed`] once the worker has stopped.
    pub fn push(&self, call: PendingCall) -> Result<Vec<CallId>, CallError> {
        let mut state = self.lock();
        if !state.running {
            return Err(CallError::Closed);
        }

        let mut evicted = Vec::new();
        if state.pending.len() > self.options.max_queue {
            let Some(policy) = self.options.eviction else {
                return Err(CallError::QueueFull {
                    capacity: self.options.max_queue,
                });
            };
            evicted = evict(&mut state.pending, policy, call.enqueued_at);
        }

        state.pending.push_back(call);
        drop(state);
        self.available.notify_one();
        Ok(evicted)
    }

    /// Put a `close` call at the front and discard everything else.
    ///
    /// Returns the ids of the discarded calls.
    pub fn push_close(&self, call: PendingCall) -> Result<Vec<CallId>, CallError> {
        let mut state = self.lock();
        if !state.running {
            return Err(CallError::Closed);
        }
        let discarded = state.pending.drain(..).map(|c| c.id).collect();
        state.pending.push_front(call);
        drop(state);
        self.available.notify_one();
        Ok(discarded)
    }

    /// Take the oldest call, waiting up to `timeout` for one to arrive.
    pub fn next(&self, timeout: Duration) -> Option<PendingCall> {
        let mut state = self.lock();
        if state.pending.is_empty() && state.running {
            state = self
                .available
                .wait_timeout(state, timeout)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        if !state.running {
            return None;
        }
        state.pending.pop_front()
    }

    /// Stop accepting calls and drain what is left.
    ///
    /// Returns the ids of the drained calls.
    pub fn stop(&self) -> Vec<CallId> {
        let mut state = self.lock();
        state.running = false;
        let drained = state.pending.drain(..).map(|c| c.id).collect();
        drop(state);
        self.available.notify_all();
        drained
    }

    /// Whether the worker is still accepting calls.
    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Number of calls waiting to run.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Whether no calls are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Apply `policy` to a full queue; returns evicted ids in queue order.
fn evict(pending: &mut VecDeque<PendingCall>, policy: EvictionPolicy, now: Instant) -> Vec<CallId> {
    if pending.is_empty() {
        return Vec::new();
    }
    let count = match policy {
        EvictionPolicy::Oldest(n) => {
            let n = n.clamp(1, pending.len());
            let cutoff = pending[n - 1].enqueued_at;
            pending.iter().take_while(|c| c.enqueued_at <= cutoff).count()
        }
        EvictionPolicy::OlderThan(max_age) => {
            let stale = pending
                .iter()
                .take_while(|c| now.saturating_duration_since(c.enqueued_at) > max_age)
                .count();
            stale.max(1)
        }
    };
    pending.drain(..count).map(|c| c.id).collect()
}

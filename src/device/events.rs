//! Out-of-band notifications from device workers.
//!
//! Per-call failures travel through the callback registry. Everything that
//! concerns the device as a whole is sent here instead, over the optional
//! event channel given to [`AsyncDevice::spawn_with_events`](super::AsyncDevice::spawn_with_events).

use super::CallId;

/// Event emitted by a device worker or its handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The connection to the instrument failed; the worker has stopped.
    ///
    /// A higher layer should tear the device down and replace it with a
    /// disconnected handle.
    ConnectionLost {
        /// Device name.
        device: String,
        /// Error reported by the session.
        reason: String,
        /// Calls that were in flight or queued when the connection dropped.
        abandoned: Vec<CallId>,
    },

    /// Stale calls were dropped to make room in a full queue.
    Evicted {
        /// Device name.
        device: String,
        /// Correlation ids of the dropped calls.
        ids: Vec<CallId>,
    },

    /// The worker thread has exited.
    Stopped {
        /// Device name.
        device: String,
    },
}

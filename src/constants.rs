//! Application-wide constants for labrelay.
//!
//! Centralizes the magic numbers shared by the device pipeline, the
//! command server and the script runner.
//!
//! # Categories
//!
//! - **Polling**: Worker idle cadence
//! - **Queue**: Per-device queue limits and eviction
//! - **Protocol**: Command server defaults

use std::time::Duration;

// ============================================================================
// Polling
// ============================================================================

/// Idle wait of a device worker when its queue is empty.
///
/// The worker also wakes early when a call is enqueued, so this only bounds
/// how long a shutdown request can go unnoticed.
pub const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Queue
// ============================================================================

/// Default maximum number of pending calls per device.
pub const DEFAULT_MAX_QUEUE: usize = 100;

/// Registration sentinel for a correlation id whose call was evicted.
///
/// Mirrors the numeric code external tooling expects for "this call will
/// never complete".
pub const EVICTED_SENTINEL: i64 = -10;

/// Method name that terminates a device worker.
pub const CLOSE_METHOD: &str = "close";

// ============================================================================
// Protocol
// ============================================================================

/// Default bind address of the command server.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default TCP port of the command server.
pub const DEFAULT_PORT: u16 = 12345;

/// Default number of simultaneously served client connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 5;

/// Maximum bytes consumed by a single read from a client socket.
pub const DEFAULT_MAX_PACKET: usize = 1024;

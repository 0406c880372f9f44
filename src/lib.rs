//! labrelay - serialized device command pipeline.
//!
//! Lets callers drive blocking laboratory instruments without stalling,
//! exposes them to remote clients over a small TCP line protocol, and
//! replays timed command scripts against that protocol.
//!
//! # Architecture
//!
//! ```text
//! script text ─► script::compile ─► CommandSchedule ─► ScriptRunner
//!                                                          │ TCP
//!                                                          ▼
//!              DeviceSession ◄─ worker ◄─ AsyncDevice ◄─ CommandServer
//! ```
//!
//! # Modules
//!
//! - [`device`] - Device sessions, per-device worker threads and the async façade
//! - [`server`] - TCP command server and device registry
//! - [`script`] - Script compiler and timed runner
//! - [`config`] - Configuration loading/saving

pub mod config;
pub mod constants;
pub mod device;
pub mod script;
pub mod server;

// Re-export commonly used types
pub use config::Config;
pub use device::{AsyncDevice, CallArgs, CallError, DeviceSession, MethodTable, Value, VirtualDevice};
pub use script::{compile, CommandSchedule, CompileError, ScriptRunner};
pub use server::{CommandServer, DeviceRegistry};

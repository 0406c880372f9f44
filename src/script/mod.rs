//! Timed command scripts.
//!
//! A script is compiled once into a [`CommandSchedule`] and then executed
//! by a [`ScriptRunner`] against a running command server. Compile errors
//! are returned with their source line; a script that fails to compile is
//! never started.

pub mod compiler;
pub mod runner;
pub mod schedule;

pub use compiler::{compile, compile_with, CompileError, ScriptSyntax};
pub use runner::{RunEvent, RunState, RunnerError, RunnerOptions, ScriptRunner};
pub use schedule::CommandSchedule;

//! Script runner.
//!
//! Executes a [`CommandSchedule`] against a command server. Step `i` is due
//! `i * interval` after start; step 0 runs immediately. Every command of a
//! step is sent and its reply awaited before the next command, so a slow
//! device delays later steps but never reorders them.
//!
//! ```text
//! Idle ──start()──► Running ──last step──► Finished
//!                      │
//!                      └──abort()/stop()──► Aborted
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::CommandSchedule;
use crate::constants::{DEFAULT_HOST, DEFAULT_MAX_PACKET, DEFAULT_PORT};

/// Where and how to run a schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerOptions {
    /// Command server address, `host:port`.
    pub addr: String,
    /// Maximum bytes read for one reply.
    pub max_packet: usize,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            addr: format!("{DEFAULT_HOST}:{DEFAULT_PORT}"),
            max_packet: DEFAULT_MAX_PACKET,
        }
    }
}

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Created, not started.
    Idle,
    /// Connected and executing steps.
    Running,
    /// All steps executed.
    Finished,
    /// Stopped early by the caller or by a connection error.
    Aborted,
}

/// Progress notifications emitted while running.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// Human-readable log line.
    Log(String),
    /// A step started.
    Step {
        /// Index of the step.
        index: usize,
        /// Time since start.
        elapsed: Duration,
    },
    /// The last step completed.
    Finished,
    /// The run was aborted; `reason` is set when an error caused it.
    Aborted {
        /// Error that ended the run, if any.
        reason: Option<String>,
    },
}

/// Errors from [`ScriptRunner::start`].
#[derive(Debug)]
pub enum RunnerError {
    /// `start` was called on a runner that is not idle.
    AlreadyStarted,
    /// The command server could not be reached.
    Connect {
        /// Address that was dialed.
        addr: String,
        /// Underlying error.
        source: std::io::Error,
    },
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyStarted => write!(f, "Script runner was already started"),
            Self::Connect { addr, source } => write!(f, "Failed to connect to \"{addr}\": {source}"),
        }
    }
}

impl std::error::Error for RunnerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::AlreadyStarted => None,
            Self::Connect { source, .. } => Some(source),
        }
    }
}

#[derive(Debug)]
struct RunProgress {
    state: RunState,
    steps_started: usize,
    command_times: Vec<f64>,
}

/// State shared between the runner handle and its task.
#[derive(Debug)]
struct Shared {
    progress: Mutex<RunProgress>,
    events: UnboundedSender<RunEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RunProgress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log(&self, line: String) {
        log::info!("[ScriptRunner] {line}");
        let _ = self.events.send(RunEvent::Log(line));
    }

    /// Move to `Aborted` unless the run already ended.
    fn abort(&self, reason: Option<String>) -> bool {
        let mut progress = self.lock();
        if matches!(progress.state, RunState::Finished | RunState::Aborted) {
            return false;
        }
        progress.state = RunState::Aborted;
        match &reason {
            Some(reason) => log::warn!("[ScriptRunner] aborted: {reason}"),
            None => log::info!("[ScriptRunner] aborted"),
        }
        let _ = self.events.send(RunEvent::Aborted { reason });
        true
    }
}

/// Executes one schedule once.
///
/// A runner is single use: after it finishes or aborts, build a new one.
#[derive(Debug)]
pub struct ScriptRunner {
    schedule: Arc<CommandSchedule>,
    options: RunnerOptions,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ScriptRunner {
    /// Create an idle runner and the receiver for its events.
    pub fn new(schedule: CommandSchedule, options: RunnerOptions) -> (Self, UnboundedReceiver<RunEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let runner = Self {
            schedule: Arc::new(schedule),
            options,
            shared: Arc::new(Shared {
                progress: Mutex::new(RunProgress {
                    state: RunState::Idle,
                    steps_started: 0,
                    command_times: Vec::new(),
                }),
                events,
            }),
            cancel: CancellationToken::new(),
            task: None,
        };
        (runner, rx)
    }

    /// Connect to the command server and start executing.
    ///
    /// Step 0 runs right away; later steps run from a background task.
    pub async fn start(&mut self) -> Result<(), RunnerError> {
        if self.state() != RunState::Idle {
            return Err(RunnerError::AlreadyStarted);
        }

        let addr = self.options.addr.clone();
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| RunnerError::Connect {
                addr: addr.clone(),
                source,
            })?;
        self.shared.log(format!("connected to \"{addr}\""));

        {
            let mut progress = self.shared.lock();
            if progress.state != RunState::Idle {
                // Aborted while connecting.
                return Ok(());
            }
            progress.state = RunState::Running;
        }

        self.task = Some(tokio::spawn(run_schedule(
            stream,
            Arc::clone(&self.schedule),
            Arc::clone(&self.shared),
            self.cancel.clone(),
            self.options.max_packet.max(1),
        )));
        Ok(())
    }

    /// Stop the run now; in-flight replies are not awaited.
    pub fn abort(&self) {
        self.cancel.cancel();
        self.shared.abort(None);
    }

    /// Alias for [`ScriptRunner::abort`].
    pub fn stop(&self) {
        self.abort();
    }

    /// Current state.
    pub fn state(&self) -> RunState {
        self.shared.lock().state
    }

    /// Whether steps are still being executed.
    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    /// Percentage of steps completed, 0 to 100.
    ///
    /// Reaches 100 only once the run has finished.
    pub fn progress(&self) -> u8 {
        let progress = self.shared.lock();
        if progress.state == RunState::Finished {
            return 100;
        }
        let total = self.schedule.len();
        if total == 0 {
            return 0;
        }
        let done = progress.steps_started.saturating_sub(1) as f64;
        let percent = (100.0 * done / total as f64).round();
        percent.min(99.0) as u8
    }

    /// Seconds since start at which each command was sent.
    pub fn command_times(&self) -> Vec<f64> {
        self.shared.lock().command_times.clone()
    }

    /// Wait for the run to end and return its final state.
    pub async fn wait(&mut self) -> RunState {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    log::error!("[ScriptRunner] run task failed: {e}");
                    self.shared.abort(Some(e.to_string()));
                }
            }
        }
        self.state()
    }
}

impl Drop for ScriptRunner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Background task: executes every step on its time slot.
async fn run_schedule(
    mut stream: TcpStream,
    schedule: Arc<CommandSchedule>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    max_packet: usize,
) {
    let start = Instant::now();
    let interval = schedule.interval();
    let mut buf = vec![0u8; max_packet];

    for (index, step) in schedule.steps().iter().enumerate() {
        let due = start + interval.mul_f64(index as f64);
        tokio::select! {
            () = tokio::time::sleep_until(due) => {}
            () = cancel.cancelled() => return,
        }

        {
            let mut progress = shared.lock();
            if progress.state != RunState::Running {
                return;
            }
            progress.steps_started = index + 1;
        }
        let _ = shared.events.send(RunEvent::Step {
            index,
            elapsed: start.elapsed(),
        });

        for command in step {
            let exchange = tokio::select! {
                result = send_command(&mut stream, command, &mut buf, start) => result,
                () = cancel.cancelled() => return,
            };
            match exchange {
                Ok((elapsed, reply)) => {
                    shared.lock().command_times.push(elapsed);
                    shared.log(format!("sent \"{command}\" at {elapsed:.3}s, received \"{reply}\""));
                }
                Err(e) => {
                    shared.abort(Some(format!("\"{command}\" failed: {e}")));
                    return;
                }
            }
        }
    }

    // The last step owns a full interval, like every other step.
    let end = start + schedule.duration();
    tokio::select! {
        () = tokio::time::sleep_until(end) => {}
        () = cancel.cancelled() => return,
    }

    let mut progress = shared.lock();
    if progress.state == RunState::Running {
        log::info!("[ScriptRunner] executed all commands");
        let _ = shared.events.send(RunEvent::Log("executed all commands".to_string()));
        let _ = shared.events.send(RunEvent::Finished);
        progress.state = RunState::Finished;
    }
    drop(progress);
    drop(stream);
}

/// Send one command and read one reply. Returns the send time and the reply.
async fn send_command(
    stream: &mut TcpStream,
    command: &str,
    buf: &mut [u8],
    start: Instant,
) -> std::io::Result<(f64, String)> {
    stream.write_all(command.as_bytes()).await?;
    let elapsed = start.elapsed().as_secs_f64();
    let n = stream.read(buf).await?;
    if n == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed by server",
        ));
    }
    Ok((elapsed, String::from_utf8_lossy(&buf[..n]).into_owned()))
}

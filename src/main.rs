//! labrelay CLI - serves devices over TCP and runs command scripts.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use labrelay::config::Config;
use labrelay::constants::{DEFAULT_HOST, DEFAULT_PORT};
use labrelay::script::{self, RunEvent, RunState, RunnerOptions, ScriptRunner};
use labrelay::server::CommandServer;

// CLI
#[derive(Parser)]
#[command(name = "labrelay")]
#[command(version)]
#[command(about = "Serialized device command server and timed script runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the configured devices until interrupted
    Serve {
        /// Config file (defaults to the platform config directory)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run a script against a command server
    Run {
        /// Path to the script
        script: PathBuf,
        /// Command server host
        #[arg(long, default_value = DEFAULT_HOST)]
        host: String,
        /// Command server port
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Compile a script and print its schedule
    Check {
        /// Path to the script
        script: PathBuf,
    },
}

fn read_script(path: &Path) -> Result<script::CommandSchedule> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read script: {}", path.display()))?;
    script::compile(&text).with_context(|| format!("Failed to compile {}", path.display()))
}

async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let config = Config::load(config_path.as_deref())?;
    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
    let registry = config.build_registry(&event_tx)?;

    // Device events are handled off the runtime: tearing a device down
    // joins its worker thread.
    let watcher_registry = registry.clone();
    std::thread::Builder::new()
        .name("labrelay-events".to_string())
        .spawn(move || {
            while let Some(event) = event_rx.blocking_recv() {
                watcher_registry.handle_event(&event);
            }
        })
        .context("Failed to spawn device event thread")?;

    let server = CommandServer::start(&config.server, registry.clone()).await?;
    println!("labrelay serving {:?} on {}", registry.names(), server.local_addr());

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    println!("Shutting down...");

    server.shutdown().await;
    tokio::task::spawn_blocking(move || registry.close_all()).await?;
    Ok(())
}

async fn run(script_path: PathBuf, host: String, port: u16) -> Result<()> {
    let schedule = read_script(&script_path)?;
    println!(
        "{} step(s), {} command(s), every {}s",
        schedule.len(),
        schedule.command_count(),
        schedule.interval_secs()
    );

    let options = RunnerOptions {
        addr: format!("{host}:{port}"),
        ..RunnerOptions::default()
    };
    let (mut runner, mut events) = ScriptRunner::new(schedule, options);
    runner.start().await?;

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                RunEvent::Log(line) => println!("{line}"),
                RunEvent::Aborted { reason: Some(reason) } => eprintln!("aborted: {reason}"),
                RunEvent::Aborted { reason: None } => eprintln!("aborted"),
                RunEvent::Step { .. } | RunEvent::Finished => {}
            }
        }
    });

    let finished = tokio::select! {
        state = runner.wait() => Some(state),
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            None
        }
    };
    let state = match finished {
        Some(state) => state,
        None => {
            runner.abort();
            runner.wait().await
        }
    };
    drop(runner);
    printer.await?;

    match state {
        RunState::Finished => Ok(()),
        other => anyhow::bail!("Script did not finish ({other:?})"),
    }
}

fn check(script_path: &Path) -> Result<()> {
    let schedule = read_script(script_path)?;
    println!("interval: {}s", schedule.interval_secs());
    for (index, step) in schedule.steps().iter().enumerate() {
        println!("{index:>4}: [{}]", step.join(", "));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => serve(config).await,
        Commands::Run { script, host, port } => run(script, host, port).await,
        Commands::Check { script } => check(&script),
    }
}

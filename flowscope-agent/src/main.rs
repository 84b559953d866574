//! flowscope-agent - Node agent for flow telemetry
//!
//! The agent runs on each node and:
//! - Tracks flows reported by the dataplane readers
//! - Aggregates them into flow logs at an adaptive level
//! - Dumps the flow table on SIGUSR2

use anyhow::{Context, Result};
use flowscope::config::Config;
use flowscope_agent::{Agent, RunningAgent};
use log::info;
use std::path::PathBuf;
use tokio::signal;

/// Environment variable naming the configuration file when no argument is given.
const CONFIG_ENV: &str = "FLOWSCOPE_CONFIG";

fn config_path() -> Option<PathBuf> {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
}

#[cfg(unix)]
async fn wait_for_shutdown(running: &RunningAgent) -> Result<()> {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};

    let mut terminate = unix_signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut dump = unix_signal(SignalKind::user_defined2()).context("Failed to install SIGUSR2 handler")?;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            _ = terminate.recv() => break,
            _ = dump.recv() => {
                if !running.trigger_dump() {
                    info!("Stats dump already pending");
                }
            }
        }
    }
    info!("Shutdown signal received");
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_running: &RunningAgent) -> Result<()> {
    signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    info!("Shutdown signal received");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let node = hostname::get()
        .context("Failed to read hostname")?
        .to_string_lossy()
        .into_owned();
    info!("flowscope-agent v{} starting on {}", flowscope::VERSION, node);

    let config = match config_path() {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            Config::load(&path)?
        }
        None => {
            info!("No configuration given, using defaults");
            Config::default()
        }
    };

    let running = Agent::new(config).start()?;
    info!("flowscope-agent running. Press Ctrl+C to exit.");

    wait_for_shutdown(&running).await?;
    running.shutdown().await?;

    info!("flowscope-agent stopped");
    Ok(())
}

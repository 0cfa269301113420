//! taskrelayd
//!
//! Binds the relay socket, runs the single-worker queue and hands every request to the
//! configured executor program.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use taskrelay_common::RelayConfig;
use taskrelayd::{
    Acceptor, CommandExecutor, QueueSettings, ShutdownHandle, WorkQueue, DAEMON_VERSION,
};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "taskrelayd", version)]
#[command(about = "Serialized task relay daemon")]
struct Cli {
    /// Socket path (overrides config and TASKRELAY_SOCK)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Path to taskrelay.toml (or use TASKRELAY_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Executor program (overrides [executor].program)
    #[arg(long)]
    program: Option<String>,

    /// Arguments passed to the executor program
    #[arg(long = "arg", requires = "program")]
    args: Vec<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let config_path = RelayConfig::resolve_path(cli.config.clone());
    let mut config = RelayConfig::load(config_path.as_deref());
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }
    if let Some(program) = cli.program {
        config.executor.program = Some(program);
        config.executor.args = cli.args;
    }

    info!("taskrelayd version {}", DAEMON_VERSION);

    let executor = CommandExecutor::from_config(&config.executor)
        .context("cannot start without an executor program")?;
    info!(
        program = executor.program(),
        request_types = ?config.request_types,
        item_delay_ms = config.item_delay_ms,
        execution_timeout_ms = config.execution_timeout_ms,
        "Executor configured"
    );

    let queue = WorkQueue::new(Arc::new(executor), QueueSettings::from_config(&config));
    let acceptor = Acceptor::bind(&config.socket_path, queue, config.request_types.clone())?;

    spawn_signal_handlers(acceptor.shutdown_handle());
    acceptor.run().await
}

fn spawn_signal_handlers(shutdown: ShutdownHandle) {
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received SIGINT, shutting down IPC server...");
            ctrl_c.shutdown();
        }
    });

    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!("Failed to install SIGTERM handler: {}", err);
            return;
        }
    };
    tokio::spawn(async move {
        if sigterm.recv().await.is_some() {
            info!("Received SIGTERM, shutting down IPC server...");
            shutdown.shutdown();
        }
    });
}

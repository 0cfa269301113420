//! taskrelay-send
//!
//! Submits one request to the daemon, prints each stage as it is reported and then the terminal
//! message as a JSON line on stdout.

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use taskrelay_common::RelayConfig;
use taskrelayd_client::{ClientConfig, RelayClient, StageHooks};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "taskrelay-send", version)]
#[command(about = "Send one request to taskrelayd and wait for its outcome")]
struct Cli {
    /// Socket path (overrides config and TASKRELAY_SOCK)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Path to taskrelay.toml (or use TASKRELAY_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Request type (defaults to the configured request kind)
    #[arg(long = "type")]
    kind: Option<String>,

    /// Request payload as a JSON object
    #[arg(long, default_value = "{}")]
    data: String,

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
    let mut relay = RelayConfig::load(config_path.as_deref());
    if let Some(socket) = cli.socket {
        relay.socket_path = socket;
    }

    let payload: Value = serde_json::from_str(&cli.data).context("--data is not valid JSON")?;
    let config = ClientConfig::from_relay(&relay);
    let kind = cli.kind.unwrap_or_else(|| config.kinds.request.clone());
    debug!(socket = %config.socket_path.display(), kind, "Sending request");

    let hooks = StageHooks::new()
        .on_queued(|| async {
            println!("{}", json!({"stage": "queued"}));
            anyhow::Ok(())
        })
        .on_processing(|| async {
            println!("{}", json!({"stage": "processing"}));
            anyhow::Ok(())
        });

    let client = RelayClient::new(config);
    let terminal = client.send_request(&kind, payload, hooks).await?;
    println!("{}", serde_json::to_string(&terminal)?);

    if terminal.data.get("success").and_then(Value::as_bool) == Some(false) {
        std::process::exit(2);
    }
    Ok(())
}

//! hookrelay - forward a webhook channel to a local server
//!
//! Reads events from a smee-compatible channel and POSTs each one to a
//! local HTTP listener until interrupted.

mod config;
mod output;

use anyhow::{Context, Result};
use clap::Parser;
use hookrelay::{create_channel, RelaySession};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{ArgOverrides, Config};
use crate::output::ConsoleLogger;

#[derive(Parser)]
#[command(name = "hookrelay")]
#[command(author, version, about = "Relay webhook events from a channel to a local server")]
struct Cli {
    /// Channel URL to read events from (a new channel is created if omitted)
    #[arg(short, long, env = "HOOKRELAY_URL")]
    url: Option<String>,

    /// Full URL of the target, overrides --port and --path
    #[arg(short, long, env = "HOOKRELAY_TARGET")]
    target: Option<String>,

    /// Local port to POST events to
    #[arg(short, long)]
    port: Option<u16>,

    /// URL path to POST events to
    #[arg(long)]
    path: Option<String>,

    /// Rebuild the original webhook request from the channel's JSON envelope
    #[arg(long)]
    envelope: bool,

    /// Only forward these event types (repeatable)
    #[arg(long = "event", value_name = "TYPE")]
    events: Vec<String>,

    /// Host used to create a new channel
    #[arg(long)]
    channel_host: Option<String>,

    /// Configuration file path
    #[arg(short, long, env = "HOOKRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    // Load config file
    let config = if let Some(config_path) = &cli.config {
        Config::load_from(config_path)?
    } else {
        Config::load().unwrap_or_default()
    };

    let merged = config.merge_with_args(&ArgOverrides {
        url: cli.url.as_deref(),
        target: cli.target.as_deref(),
        port: cli.port,
        path: cli.path.as_deref(),
        envelope: cli.envelope,
        events: &cli.events,
        channel_host: cli.channel_host.as_deref(),
        no_color: cli.no_color,
    });

    let console = Arc::new(ConsoleLogger::new(merged.no_color));

    let source = match &merged.url {
        Some(url) => url.clone(),
        None => {
            let channel = create_channel(&merged.channel_host)
                .await
                .with_context(|| format!("Failed to create channel on {}", merged.channel_host))?;
            console.info(&format!("Created new channel {}", channel));
            channel.to_string()
        }
    };

    let mut session = match RelaySession::new(merged.relay_config(&source)) {
        Ok(session) => session.with_logger(console.clone()),
        Err(e) => {
            console.error(&format!("Invalid relay configuration: {}", e));
            return Err(e).context("Failed to create relay session");
        }
    };

    let shutdown = shutdown_signal()?;
    let handle = session.start();

    let signal = shutdown.await;
    tracing::info!(signal, "Shutting down");

    handle.close().await;
    Ok(())
}

/// Resolves with the name of the first shutdown signal received
///
/// SIGTERM is registered before returning so it is never missed.
fn shutdown_signal() -> Result<impl Future<Output = &'static str>> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to listen for SIGTERM")?;

    Ok(async move {
        #[cfg(unix)]
        let sigterm_future = sigterm.recv();
        #[cfg(not(unix))]
        let sigterm_future = std::future::pending::<Option<()>>();

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Failed to listen for ctrl-c");
                }
                "ctrl-c"
            }
            _ = sigterm_future => "SIGTERM",
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sigterm_resolves_shutdown() {
        let shutdown = shutdown_signal().unwrap();

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let signal = tokio::time::timeout(Duration::from_secs(5), shutdown)
            .await
            .expect("SIGTERM should end the wait");
        assert_eq!(signal, "SIGTERM");
    }
}

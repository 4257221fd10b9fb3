//! DiSUcord relay daemon
//!
//! Runs the channel relay in the foreground until SIGINT/SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the configured endpoint (default 127.0.0.1:8080)
//! disucordd
//!
//! # Override the endpoint
//! disucordd --host 0.0.0.0 --port 9000
//!
//! # Start with the relay stopped; send SIGHUP to toggle it
//! disucordd --stopped
//! ```

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use disucordd::config::RelayConfig;
use disucordd::observer::TracingObserver;
use disucordd::registry::Registry;
use disucordd::server::{ControlHandle, LifecycleController};

/// DiSUcord relay - channel-based broadcast chat server
#[derive(Parser, Debug)]
#[command(name = "disucordd", version, about)]
struct Args {
    /// Host to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Start with the relay stopped (SIGHUP starts it)
    #[arg(long)]
    stopped: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("disucordd=info".parse()?)
                .add_directive("disucord_protocol=info".parse()?),
        )
        .init();

    let config = RelayConfig::load_or_default(args.config.as_deref())
        .context("Failed to load configuration")?
        .apply_env()
        .context("Invalid environment override")?
        .apply_overrides(args.host, args.port);
    config.validate().context("Invalid configuration")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        endpoint = %config.endpoint(),
        channels = ?config.channels,
        "DiSUcord relay starting"
    );

    let registry = Registry::new(config.channels.iter().cloned(), Arc::new(TracingObserver));
    let mut controller = LifecycleController::new(registry);

    let control = ControlHandle::new(config.endpoint());
    control.set_running(!args.stopped);

    let shutdown = CancellationToken::new();

    let shutdown_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    #[cfg(unix)]
    spawn_toggle_handler(control.clone(), shutdown.clone())?;

    controller.run(control, shutdown).await;

    info!("DiSUcord relay stopped");
    Ok(())
}

/// Flips the desired-running flag on every SIGHUP.
#[cfg(unix)]
fn spawn_toggle_handler(control: ControlHandle, shutdown: CancellationToken) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = sighup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    let running = control.toggle();
                    info!(running, "Received SIGHUP, toggling relay");
                }
            }
        }
    });

    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

//! Imagehub service binary.
//!
//! Configuration is loaded from:
//! 1. `~/imagehub.yaml`
//! 2. `config/imagehub.{yaml,toml,json}`
//! 3. Environment variables (prefixed with `IMAGEHUB__`)
//!
//! A configuration file given as the first argument replaces 1 and 2.

use anyhow::{Context, Result};
use imagehub::config::{HubConfig, LoggingConfig};
use imagehub::{health, Hub, HubSummary, TcpTransport};
use std::path::PathBuf;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "imagehub",
        version = env!("CARGO_PKG_VERSION"),
        system = %health::detect(),
        "Starting imagehub"
    );

    if config.hub.print_settings {
        info!(settings = ?config, "Resolved settings");
    }

    let mut hub = Hub::new(config.clone()).context("Failed to initialize hub")?;
    let mut transport = TcpTransport::bind(&config.transport)
        .await
        .context("Failed to bind transport")?;

    let result = hub.run(&mut transport, shutdown_signal()).await;

    // Stop accepting nodes before draining
    drop(transport);

    let summary = hub.shutdown().await;
    log_final_stats(&summary);

    result.context("Receive loop failed")?;
    info!("Exiting imagehub");
    Ok(())
}

/// Load configuration from an explicit file or the default sources.
fn load_config() -> Result<HubConfig> {
    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => HubConfig::from_file(&path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => HubConfig::load()
            .context("Failed to load configuration (is the \"hub\" section present?)")?,
    };

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("imagehub={}", level).parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

/// Log final statistics on shutdown.
fn log_final_stats(summary: &HubSummary) {
    info!("=== Final Statistics ===");

    info!(
        messages_received = summary.messages_received,
        liveness_timeouts = summary.liveness_timeouts,
        event_log_lines = summary.event_log_lines,
        heartbeats = summary.dispatcher.heartbeats,
        probes = summary.dispatcher.probes,
        events_logged = summary.dispatcher.events_logged,
        protocol_errors = summary.dispatcher.protocol_errors,
        "Dispatcher final stats"
    );

    info!(
        images_queued = summary.dispatcher.images_queued,
        raw_images_ignored = summary.dispatcher.raw_images_ignored,
        evicted = summary.queue.evicted,
        overload_episodes = summary.queue.overload_episodes,
        images_written = summary.writer.images_written,
        bytes_written = summary.writer.bytes_written,
        cap_discarded = summary.writer.cap_discarded,
        write_failures = summary.writer.failed,
        "Image final stats"
    );
}

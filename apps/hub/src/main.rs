//! Intercom Hub - headless push-to-talk intercom hub.
//!
//! Binds the multicast audio transport, starts the channel arbiter and
//! session router, connects the MQTT control plane, and serves the web
//! PTT surface. Designed to run as a supervised daemon: fatal startup
//! errors exit non-zero so the supervisor restarts the process.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use intercom_core::{bootstrap_services, start_server};
use tokio::signal;

/// Headless LAN intercom hub.
#[derive(Parser, Debug)]
#[command(name = "intercom-hub")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (JSON).
    #[arg(short, long, value_name = "FILE", default_value = "/data/config.json")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "INTERCOM_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Data directory for persistent state (chimes, active chime).
    #[arg(short, long, env = "INTERCOM_DATA_DIR", default_value = "/data")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = config::load(&args.config).context("Failed to load configuration")?;

    // The config file's log_level applies unless the CLI/env said otherwise.
    let level = if args.log_level == log::LevelFilter::Info {
        match config.log_level.as_str() {
            "debug" => log::LevelFilter::Debug,
            "warning" => log::LevelFilter::Warn,
            "error" => log::LevelFilter::Error,
            _ => log::LevelFilter::Info,
        }
    } else {
        args.log_level
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_millis()
        .init();

    log::info!("Intercom Hub v{}", env!("CARGO_PKG_VERSION"));
    config.data_dir = args.data_dir.to_string_lossy().into_owned();

    let services =
        bootstrap_services(&config, &args.data_dir).context("Failed to bootstrap services")?;
    services.start_background_tasks(&config);

    let app_state = services.app_state(Arc::new(config));
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(app_state).await {
            log::error!("Server error: {}", e);
        }
    });

    shutdown_signal().await;
    log::info!("Shutdown signal received, cleaning up...");

    services.shutdown().await;
    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

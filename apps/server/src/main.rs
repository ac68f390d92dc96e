//! Lucent Server - standalone headless live-video ingest server.
//!
//! Accepts FTL publishes, fans each channel out to direct and web
//! subscribers over HTTP, and writes preview thumbnails to disk. Designed
//! for deployments where Lucent runs as a background daemon in front of a
//! reverse proxy.

mod config;
mod delegates;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use lucent_core::{AppState, FtlServer, LogPublishEvents, Manager, RtpDispatcher};
use tokio::net::{TcpListener, UdpSocket};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::delegates::{FileThumbs, StaticKeyAuth};

/// Lucent Server - headless live-video ingest and fan-out server.
#[derive(Parser, Debug)]
#[command(name = "lucent-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "LUCENT_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Work directory for thumbnails and scratch state (overrides config file).
    #[arg(short = 'w', long, env = "LUCENT_WORK_DIR")]
    work_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Lucent Server v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(work_dir) = args.work_dir {
        config.core.work_dir = work_dir;
    }
    if config.channels.is_empty() {
        log::warn!("No channels configured - every publish attempt will be rejected");
    }

    let cancel = CancellationToken::new();

    // Delegates: static key table and on-disk thumbnails.
    let auth = Arc::new(StaticKeyAuth::new(config.channels.clone()));
    let thumbs = Arc::new(
        FileThumbs::new(&config.core.work_dir)
            .await
            .context("Failed to create thumbnail directory")?,
    );

    let manager = Manager::new(config.core.clone(), thumbs, Arc::new(LogPublishEvents));

    // RTP ingest: one UDP socket shared by every FTL session.
    let rtp_socket = UdpSocket::bind(config.core.rtp_listen_addr)
        .await
        .with_context(|| format!("Failed to bind RTP socket on {}", config.core.rtp_listen_addr))?;
    log::info!("RTP ingest on {}", rtp_socket.local_addr()?);
    let dispatcher = RtpDispatcher::new(rtp_socket);
    {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { dispatcher.run(cancel).await });
    }

    // FTL handshake listener.
    let ftl_listener = TcpListener::bind(config.ftl_bind)
        .await
        .with_context(|| format!("Failed to bind FTL listener on {}", config.ftl_bind))?;
    log::info!("FTL ingest on {}", ftl_listener.local_addr()?);
    let ftl = FtlServer::new(
        auth,
        manager.clone(),
        dispatcher,
        config.core.rtp_advertise_port,
    );
    {
        let cancel = cancel.clone();
        tokio::spawn(async move { ftl.serve(ftl_listener, cancel).await });
    }

    // Periodic cleanup of expired web publishers.
    {
        let manager = manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.run_cleanup(cancel).await });
    }

    // HTTP playback API.
    let http_listener = TcpListener::bind(config.http_bind)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {}", config.http_bind))?;
    log::info!("HTTP playback on {}", http_listener.local_addr()?);
    let state = AppState { manager };
    let server_handle = tokio::spawn(async move {
        if let Err(e) = lucent_core::start_server(state, http_listener).await {
            log::error!("Server error: {e}");
        }
    });

    shutdown_signal().await;
    log::info!("Shutdown signal received, cleaning up...");

    // Cancelling tears down the dispatcher, every FTL session, and through
    // them every in-flight publish.
    cancel.cancel();
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

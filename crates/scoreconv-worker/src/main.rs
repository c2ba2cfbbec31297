//! scoreconv worker process.
//!
//! Subscribes to conversion jobs for one entry point and runs each through
//! the MusicXML to MEI pipeline until interrupted.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scoreconv_graph::{ConnectionEvent, GraphClient, GraphTransport, WsTransport, WsTransportConfig};
use scoreconv_jobs::{DocumentConverter, VerovioConverter, WorkerBuilder, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // The debug toggle picks the default log level, so read config first
    // and report a bad one only once logging is up.
    let config = WorkerConfig::from_env();
    let debug = config.as_ref().map(|c| c.debug).unwrap_or(false);
    let _file_guard = init_tracing(debug);

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid worker configuration");
            return Err(e).context("Invalid worker configuration");
        }
    };

    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        tracing::debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
    }

    info!(
        graphql_url = %config.graphql_url,
        entry_point = %config.entry_point_identifier,
        debug = config.debug,
        "Starting scoreconv worker"
    );

    let converter = VerovioConverter::new(&config.converter_bin).with_timeout(config.convert_timeout);
    match converter.health_check().await {
        Ok(version) => info!(tool = %config.converter_bin, %version, "Conversion tool available"),
        Err(e) => warn!(tool = %config.converter_bin, error = %e, "Conversion tool is not usable; jobs will fail"),
    }

    let transport = WsTransport::start(
        WsTransportConfig::new(&config.graphql_url).with_request_timeout(config.graph_request_timeout),
    );
    let events_task = tokio::spawn(log_connection_events(transport.connection_events()));

    let client = GraphClient::new(transport.clone());
    let worker = WorkerBuilder::new(client, config)
        .with_converter(Arc::new(converter))
        .build()
        .context("Failed to build job worker")?;
    let handle = worker.start();

    shutdown_signal().await;
    info!("Shutdown requested, waiting for in-flight jobs");

    handle.shutdown().await?;
    handle.join().await?;
    transport.shutdown();
    events_task.abort();

    info!("scoreconv worker stopped");
    Ok(())
}

/// Initialize tracing with configurable output.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables file logging)
///   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
///   RUST_LOG    - standard env filter (default: "scoreconv=info", or debug with WORKER_DEBUG)
fn init_tracing(debug: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    // Targets match by prefix, so this covers every scoreconv_* crate.
    let default_filter = if debug { "scoreconv=debug" } else { "scoreconv=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(env_filter);

    // Optionally create a file appender with daily rotation
    let guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("scoreconv-worker.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );
    guard
}

/// Log the graph connection lifecycle until the transport goes away.
async fn log_connection_events(mut events: broadcast::Receiver<ConnectionEvent>) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Connected) => info!(subsystem = "graph", "Connected to graph endpoint"),
            Ok(ConnectionEvent::Reconnected) => info!(subsystem = "graph", "Reconnected to graph endpoint"),
            Ok(ConnectionEvent::Disconnected { reason }) => {
                warn!(subsystem = "graph", %reason, "Disconnected from graph endpoint")
            }
            Ok(ConnectionEvent::Reconnecting { attempt, delay_ms }) => {
                info!(subsystem = "graph", attempt, delay_ms, "Reconnecting to graph endpoint")
            }
            Ok(ConnectionEvent::Error { message }) => {
                error!(subsystem = "graph", error = %message, "Graph connection error")
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed connection events"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

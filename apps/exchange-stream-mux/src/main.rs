//! Exchange Stream Mux Binary
//!
//! Starts the multiplexer, subscribes a logging consumer to tickers, and
//! serves health and metrics over HTTP.
//!
//! # Usage
//!
//! ```bash
//! STREAM_MUX_SYMBOLS=KRW-BTC,KRW-ETH cargo run --bin exchange-stream-mux
//! ```
//!
//! # Environment Variables
//!
//! ## Optional
//! - `STREAM_MUX_SYMBOLS`: Comma-separated market codes to log tickers for
//! - `STREAM_MUX_ACCESS_TOKEN`: Bearer token for the private channel
//! - `STREAM_MUX_PUBLIC_URL`: Public endpoint (default: `wss://api.upbit.com/websocket/v1`)
//! - `STREAM_MUX_PRIVATE_URL`: Private endpoint (default: `wss://api.upbit.com/websocket/v1/private`)
//! - `STREAM_MUX_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `STREAM_MUX_FORMAT`: DEFAULT | SIMPLE (default: DEFAULT)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: exchange-stream-mux)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;

use anyhow::Context;
use exchange_stream_mux::domain::streaming::DecodedEvent;
use exchange_stream_mux::infrastructure::telemetry;
use exchange_stream_mux::{
    BearerToken, CredentialProvider, DataKind, HealthServer, MuxConfig, NoCredentials,
    Orchestrator, StaticCredentials, StreamConsumer, StreamEvent, WebSocketTransport,
    init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Component id of the built-in ticker logger.
const TICKER_LOGGER: &str = "ticker-logger";

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!("Starting Exchange Stream Mux");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics().context("failed to install metrics recorder")?;

    let config = MuxConfig::from_env()?;
    log_config(&config);

    let credentials: Arc<dyn CredentialProvider> =
        match std::env::var("STREAM_MUX_ACCESS_TOKEN") {
            Ok(token) if !token.trim().is_empty() => {
                Arc::new(StaticCredentials::new(Some(BearerToken::new(token))))
            }
            _ => {
                tracing::info!("No access token configured, private channel stays parked");
                Arc::new(NoCredentials)
            }
        };

    let shutdown_token = CancellationToken::new();
    let health_port = config.server.health_port;
    let symbols = config.initial_symbols.clone();

    let mux = Orchestrator::new(config, Arc::new(WebSocketTransport::new()), credentials);
    mux.start();

    // Keep the consumer alive for the whole run; the orchestrator only holds
    // it weakly.
    let ticker_logger: Arc<dyn StreamConsumer> = Arc::new(log_ticker);
    if symbols.is_empty() {
        tracing::info!("STREAM_MUX_SYMBOLS is empty, no ticker subscription made");
    } else {
        mux.subscribe(TICKER_LOGGER, DataKind::Ticker, symbols, &ticker_logger)?;
    }

    // Spawn health server
    let health_server = HealthServer::new(health_port, Arc::clone(&mux), shutdown_token.clone());
    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!("Stream mux ready");

    await_shutdown(shutdown_token).await;

    mux.shutdown().await;
    if let Err(e) = health_task.await {
        tracing::warn!(error = %e, "Health server task ended abnormally");
    }
    drop(ticker_logger);

    tracing::info!("Stream mux stopped");
    Ok(())
}

/// Log every ticker event at info level.
fn log_ticker(event: &StreamEvent) {
    if let DecodedEvent::Ticker(ticker) = &event.payload {
        tracing::info!(
            code = %ticker.code,
            price = %ticker.trade_price,
            change = ticker.change.as_deref().unwrap_or("-"),
            freshness = ?event.freshness,
            "Ticker"
        );
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Log the parsed configuration.
fn log_config(config: &MuxConfig) {
    tracing::info!(
        format = config.format.as_str(),
        health_port = config.server.health_port,
        symbols = config.initial_symbols.len(),
        "Configuration loaded"
    );
    tracing::debug!(
        public_url = %config.endpoints.public_url,
        private_url = %config.endpoints.private_url,
        ticket_prefix = %config.ticket_prefix,
        "WebSocket endpoints"
    );
}

/// Load .env file from any ancestor directory.
fn load_dotenv_from_ancestors() {
    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler installation failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!("Graceful shutdown started");
}

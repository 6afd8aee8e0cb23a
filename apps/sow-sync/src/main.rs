//! SOW Sync Binary
//!
//! Opens one state-of-the-world subscription against a feed and writes the
//! resulting view events to stdout as JSON lines. Logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! SOW_FEED_URL=ws://localhost:9007/sow SOW_TOPIC=orders cargo run --bin sow-sync
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `SOW_FEED_URL`: Feed WebSocket endpoint
//! - `SOW_TOPIC`: Topic to subscribe to
//!
//! ## Optional
//! - `SOW_FILTER`: Content filter expression, passed through to the feed
//! - `SOW_ORDER_BY`: Ordering as `field` or `field:asc|desc`
//! - `SOW_TOP_N` / `SOW_SKIP_N`: View bound
//! - `SOW_CONFLATION_MS`: Per-key update conflation interval (default: off)
//! - `SOW_REPORT_EVICTIONS`: Emit evict events (default: true)
//! - `SOW_KEY_FIELDS`: Comma-separated key fields when the feed sends no key
//! - `SOW_CONNECT_TIMEOUT_MS` / `SOW_ACK_TIMEOUT_MS`: Feed timeouts
//! - `SOW_INBOUND_CAPACITY` / `SOW_BRIDGE_CAPACITY`: Channel sizes (default: 1024)
//! - `SOW_HEALTH_PORT`: Health check HTTP port, 0 disables (default: 8083)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sow_sync::infrastructure::bridge::{self, BridgeReceiver};
use sow_sync::infrastructure::health::{HealthServer, HealthServerState};
use sow_sync::infrastructure::telemetry;
use sow_sync::{
    ResubscriptionController, SubscriptionService, SyncConfig, ViewEvent, WsTransport,
    WsTransportConfig, init_metrics,
};
use tokio::io::AsyncWriteExt;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    // Initialize telemetry (tracing + optional OpenTelemetry)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting SOW sync");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = SyncConfig::from_env().context("invalid configuration")?;
    let spec = config.require_subscription()?.clone();
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Separate token so subscriptions can be closed on the wire after a signal.
    let transport_token = CancellationToken::new();
    let transport = Arc::new(WsTransport::new(
        WsTransportConfig::from(&config.feed),
        transport_token.clone(),
    ));
    let service = SubscriptionService::new(transport.clone(), config.channels.into());

    let (sink, events) = bridge::channel(config.channels.bridge_capacity);
    let controller = Arc::new(ResubscriptionController::new(service, Arc::new(sink)));

    if config.server.health_port != 0 {
        let health_state = Arc::new(HealthServerState::new(
            env!("CARGO_PKG_VERSION").to_string(),
            Arc::clone(&controller),
        ));
        let health_server = HealthServer::new(
            config.server.health_port,
            health_state,
            shutdown_token.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = health_server.run().await {
                tracing::error!(error = %e, "Health server error");
            }
        });
    }

    let writer_stop = CancellationToken::new();
    let writer = tokio::spawn(write_events(events, writer_stop.clone()));

    let id = controller
        .reparametrize(spec)
        .await
        .context("failed to open subscription")?;
    tracing::info!(sub_id = %id, "Subscription open");

    await_shutdown(shutdown_token.clone()).await;

    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        if let Err(e) = controller.shutdown().await {
            tracing::warn!(error = %e, "Failed to close subscription cleanly");
        }
        transport.disconnect().await;
        transport_token.cancel();
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Shutdown timed out"
        );
    }

    writer_stop.cancel();
    if let Err(e) = writer.await {
        tracing::error!(error = %e, "Event writer panicked");
    }

    tracing::info!("SOW sync stopped");
    Ok(())
}

/// Write every view event to stdout as one JSON line.
///
/// Once `stop` fires, events already queued are still written.
async fn write_events(mut events: BridgeReceiver, stop: CancellationToken) {
    let mut stdout = tokio::io::stdout();
    loop {
        let event = tokio::select! {
            biased;
            event = events.recv() => event,
            () = stop.cancelled() => events.try_recv(),
        };
        let Some(event) = event else {
            break;
        };
        if let Err(e) = write_event(&mut stdout, &event).await {
            tracing::error!(error = %e, "stdout closed, discarding further events");
            break;
        }
    }
}

async fn write_event(stdout: &mut tokio::io::Stdout, event: &ViewEvent) -> std::io::Result<()> {
    let line = match event.to_json() {
        Ok(line) => line,
        Err(e) => {
            tracing::error!(error = %e, kind = event.kind(), "Failed to encode view event");
            return Ok(());
        }
    };
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

/// Log the parsed configuration.
fn log_config(config: &SyncConfig) {
    tracing::info!(
        feed_url = %config.feed.url,
        health_port = config.server.health_port,
        inbound_capacity = config.channels.inbound_capacity,
        bridge_capacity = config.channels.bridge_capacity,
        "Configuration loaded"
    );
    if let Some(spec) = &config.subscription {
        tracing::debug!(
            topic = %spec.topic,
            filter = ?spec.filter,
            order_by = ?spec.order_by,
            top_n = ?spec.bound.top_n,
            skip_n = spec.bound.skip_n,
            conflation_ms = ?spec.conflation.map(|d| d.as_millis()),
            "Subscription parameters"
        );
    }
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

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
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
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
}

//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Messages**: Feed envelopes received by phase, malformed envelopes
//! - **Events**: View events delivered to or dropped by the consumer
//! - **Views**: Rows per topic, rows excluded by bounds, conflated updates
//! - **Connections**: Feed WebSocket state and errors
//! - **Latency**: Snapshot promotion time
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before [`init_metrics`] is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::message::{ClassifyError, Phase};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if another global recorder is already installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            #[allow(clippy::expect_used)]
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Feed messages
    describe_counter!(
        "sow_sync_messages_received_total",
        "Feed envelopes classified, by topic and phase"
    );
    describe_counter!(
        "sow_sync_messages_malformed_total",
        "Feed envelopes dropped by the classifier"
    );

    // View events
    describe_counter!(
        "sow_sync_events_delivered_total",
        "View events accepted by the consumer"
    );
    describe_counter!(
        "sow_sync_events_dropped_total",
        "View events dropped because the consumer was gone"
    );
    describe_counter!(
        "sow_sync_updates_conflated_total",
        "Update events folded into a pending conflated delta"
    );
    describe_counter!(
        "sow_sync_rows_excluded_total",
        "Inserts that did not rank within a full bound"
    );

    // Sessions and views
    describe_gauge!("sow_sync_active_sessions", "Open subscription sessions");
    describe_gauge!("sow_sync_view_rows", "Rows in the materialized view");

    // Connection
    describe_gauge!(
        "sow_sync_websocket_connected",
        "1 while the feed WebSocket is connected"
    );
    describe_counter!(
        "sow_sync_websocket_errors_total",
        "Feed WebSocket errors by type"
    );
    describe_counter!(
        "sow_sync_routes_overflowed_total",
        "Subscriptions closed because their session fell behind the feed"
    );

    // Latency
    describe_histogram!(
        "sow_sync_snapshot_promotion_seconds",
        "Time from snapshot begin to promotion"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Reasons an envelope is dropped as malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    /// Phase tag not recognized.
    UnknownPhase,
    /// Keyed phase without a key.
    MissingKey,
    /// Frame could not be decoded at all.
    Undecodable,
}

impl MalformedReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::UnknownPhase => "unknown_phase",
            Self::MissingKey => "missing_key",
            Self::Undecodable => "undecodable",
        }
    }
}

impl From<&ClassifyError> for MalformedReason {
    fn from(error: &ClassifyError) -> Self {
        match error {
            ClassifyError::UnknownPhase(_) => Self::UnknownPhase,
            ClassifyError::MissingKey(_) => Self::MissingKey,
        }
    }
}

/// Record a classified envelope.
pub fn record_message(topic: &str, phase: Phase) {
    counter!(
        "sow_sync_messages_received_total",
        "topic" => topic.to_string(),
        "phase" => phase.as_str()
    )
    .increment(1);
}

/// Record an envelope dropped by the classifier.
pub fn record_malformed(topic: &str, error: &ClassifyError) {
    counter!(
        "sow_sync_messages_malformed_total",
        "topic" => topic.to_string(),
        "reason" => MalformedReason::from(error).as_str()
    )
    .increment(1);
}

/// Record a text frame that could not be decoded.
pub fn record_undecodable_frame() {
    counter!(
        "sow_sync_messages_malformed_total",
        "topic" => "",
        "reason" => MalformedReason::Undecodable.as_str()
    )
    .increment(1);
}

/// Record a view event accepted by the consumer.
pub fn record_event_delivered(topic: &str, kind: &'static str) {
    counter!(
        "sow_sync_events_delivered_total",
        "topic" => topic.to_string(),
        "kind" => kind
    )
    .increment(1);
}

/// Record a view event dropped because the consumer was gone.
pub fn record_event_dropped(topic: &str, kind: &'static str) {
    counter!(
        "sow_sync_events_dropped_total",
        "topic" => topic.to_string(),
        "kind" => kind
    )
    .increment(1);
}

/// Record an update held back by conflation.
pub fn record_conflated(topic: &str) {
    counter!("sow_sync_updates_conflated_total", "topic" => topic.to_string()).increment(1);
}

/// Record an insert excluded by the bound.
pub fn record_excluded(topic: &str) {
    counter!("sow_sync_rows_excluded_total", "topic" => topic.to_string()).increment(1);
}

/// A session was opened.
pub fn session_opened() {
    gauge!("sow_sync_active_sessions").increment(1.0);
}

/// A session was closed.
pub fn session_closed() {
    gauge!("sow_sync_active_sessions").decrement(1.0);
}

/// Update the row count of a topic's view.
#[allow(clippy::cast_precision_loss)]
pub fn set_view_rows(topic: &str, rows: usize) {
    gauge!("sow_sync_view_rows", "topic" => topic.to_string()).set(rows as f64);
}

/// Update the feed connection gauge.
pub fn set_websocket_connected(connected: bool) {
    gauge!("sow_sync_websocket_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Record a WebSocket error.
pub fn record_websocket_error(error_type: &str) {
    counter!(
        "sow_sync_websocket_errors_total",
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record a subscription closed because its inbound channel was full.
pub fn record_route_overflow() {
    counter!("sow_sync_routes_overflowed_total").increment(1);
}

/// Record how long a snapshot took from `begin` to promotion.
pub fn record_snapshot_promotion(topic: &str, duration: Duration) {
    histogram!(
        "sow_sync_snapshot_promotion_seconds",
        "topic" => topic.to_string()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

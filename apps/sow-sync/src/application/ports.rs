//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `FeedTransport`: subscribe/unsubscribe against the remote feed
//! - `EventSink`: hand view events to the consumer

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::domain::message::Envelope;
use crate::domain::spec::{OrderBy, SubscriptionSpec};
use crate::domain::view::ViewEvent;

// =============================================================================
// Subscription Identity
// =============================================================================

/// Transport-assigned identifier of one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an existing id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Subscribe Command
// =============================================================================

/// Options block of the subscribe command.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubscribeOptions {
    /// Conflation interval in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflation_ms: Option<u64>,
    /// Row cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_n: Option<usize>,
    /// Leading rows skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_n: Option<usize>,
    /// Ask for evictions of records leaving the filter.
    pub report_evictions: bool,
}

/// What the session asks the feed for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeCommand {
    /// Topic.
    pub topic: String,
    /// Filter expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Ordering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<OrderBy>,
    /// Options.
    #[serde(default)]
    pub options: SubscribeOptions,
}

impl From<&SubscriptionSpec> for SubscribeCommand {
    fn from(spec: &SubscriptionSpec) -> Self {
        Self {
            topic: spec.topic.clone(),
            filter: spec.filter.clone(),
            order_by: spec.order_by.clone(),
            options: SubscribeOptions {
                conflation_ms: spec
                    .conflation
                    .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
                top_n: spec.bound.top_n,
                skip_n: (spec.bound.skip_n > 0).then_some(spec.bound.skip_n),
                report_evictions: spec.report_evictions,
            },
        }
    }
}

// =============================================================================
// Feed Transport
// =============================================================================

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No connection.
    #[default]
    Disconnected,
    /// Connect in progress.
    Connecting,
    /// Connected.
    Connected,
    /// Last connect attempt failed.
    Failed,
}

impl ConnectionState {
    /// Get the state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        }
    }
}

/// Transport failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Could not establish the connection.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The feed refused the command.
    #[error("feed rejected {command}: {reason}")]
    Rejected {
        /// Command name.
        command: &'static str,
        /// Reason given by the feed.
        reason: String,
    },

    /// No acknowledgement within the timeout.
    #[error("timed out waiting for {0} acknowledgement")]
    AckTimeout(&'static str),

    /// The connection went away mid-command.
    #[error("connection closed")]
    ConnectionClosed,

    /// Frame could not be encoded.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A publish/subscribe feed that can host many subscriptions.
///
/// # Contract
///
/// - `subscribe` resolves only after the feed acknowledged the command.
///   Envelopes for the returned id are pushed into `inbound` in arrival order.
/// - `unsubscribe` stops routing to the id before it resolves, whether or not
///   the feed acknowledges.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeedTransport: Send + Sync {
    /// Connect if needed and subscribe.
    async fn subscribe(
        &self,
        command: SubscribeCommand,
        inbound: mpsc::Sender<Envelope>,
    ) -> Result<SubscriptionId, TransportError>;

    /// Unsubscribe.
    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), TransportError>;

    /// Current connection state.
    fn connection_state(&self) -> ConnectionState;
}

// =============================================================================
// Event Sink
// =============================================================================

/// Consumer side of the channel bridge.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one event. Returns `false` if the consumer is gone.
    async fn deliver(&self, event: ViewEvent) -> bool;
}

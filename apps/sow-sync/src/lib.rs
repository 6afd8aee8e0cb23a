#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! SOW Sync - State-of-the-World Subscription Engine
//!
//! Keeps a consumer-side copy of a server-held dataset current. A
//! subscription first receives the full matching dataset (the snapshot),
//! then a stream of deltas. The engine reconciles the two into one ordered,
//! bounded, keyed view and emits incremental [`ViewEvent`]s to the consumer.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Synchronous state, no I/O
//!   - `message`: Feed envelopes and the phase classifier
//!   - `view`: Ordered, bounded view store and view events
//!   - `conflation`: Per-key delivery rate limiting
//!
//! - **Application**: Use cases and port definitions
//!   - `engine`: Snapshot/live reconciliation state machine
//!   - `ports`: Interfaces for the feed transport and the event sink
//!   - `services`: Subscription sessions and the resubscription controller
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `transport`: WebSocket feed client and in-process loopback
//!   - `bridge`: Bounded channel to the consumer
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//! Feed WS ──► transport ──route by sub_id──► session task ──► bridge ──► consumer
//!                                               │
//!                                      classify → engine → view
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Records, specs and the materialized view.
pub mod domain;

/// Application layer - Reconciliation engine, sessions and ports.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::message::{ClassifyError, Envelope, FeedMessage, Phase, classify};
pub use domain::record::{Fields, Record, RecordKey};
pub use domain::spec::{Bound, Direction, OrderBy, SpecError, SubscriptionSpec};
pub use domain::view::{ConsumerView, ViewEvent, ViewStore};

// Application
pub use application::engine::{EnginePhase, ReconciliationEngine};
pub use application::ports::{
    ConnectionState, EventSink, FeedTransport, SubscribeCommand, SubscriptionId, TransportError,
};
pub use application::services::{
    ControllerError, ResubscriptionController, SessionError, SessionHandle, SessionSettings,
    SubscriptionService,
};

// Infrastructure config
pub use infrastructure::config::{
    ChannelSettings, ConfigError, FeedSettings, ServerSettings, SyncConfig,
};

// Transports and bridge
pub use infrastructure::bridge::{BridgeReceiver, BridgeSender, channel as bridge_channel};
pub use infrastructure::transport::{LoopbackTransport, WsTransport, WsTransportConfig};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};

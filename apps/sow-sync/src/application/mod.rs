//! Application Layer - Reconciliation engine, sessions and port definitions.
//!
//! This layer drives the domain from async tasks and talks to the outside
//! world only through the traits in [`ports`].

/// Port interfaces for the feed transport and the consumer sink.
pub mod ports;

/// Per-subscription reconciliation state machine.
pub mod engine;

/// Subscription sessions and the resubscription controller.
pub mod services;

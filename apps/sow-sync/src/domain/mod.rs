//! Domain Layer - Records, subscription specs and the materialized view.
//!
//! Everything in this layer is synchronous and free of I/O. The application
//! layer drives it from one task per subscription.

/// Records and field maps.
pub mod record;

/// Subscription parameters (topic, filter, ordering, bound, conflation).
pub mod spec;

/// Feed envelopes and the phase classifier.
pub mod message;

/// Ordered, bounded, keyed materialized view.
pub mod view;

/// Per-key rate limiting of delivered update events.
pub mod conflation;

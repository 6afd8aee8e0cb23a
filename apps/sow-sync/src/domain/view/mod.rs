//! Materialized View
//!
//! [`ViewStore`] is the engine-owned view. [`ViewEvent`] is what leaves the
//! engine; [`ConsumerView`] rebuilds an ordered copy from those events on the
//! far side of the channel bridge.

mod rank;
mod store;

use serde::{Deserialize, Serialize};

pub use rank::{RankKey, SortValue};
pub use store::{UpsertOutcome, ViewStore};

use super::record::{Fields, Record, RecordKey};
use super::spec::{Bound, OrderBy};

// =============================================================================
// View Events
// =============================================================================

/// A change to the view, as delivered to the consumer.
///
/// # Wire Format (JSON)
/// ```json
/// {"type": "snapshot", "rows": [{"key": "AAPL", "fields": {"bid": 100}}]}
/// {"type": "update", "key": "AAPL", "fields": {"bid": 101}}
/// {"type": "evict", "key": "AAPL"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ViewEvent {
    /// Full replacement of the view.
    Snapshot {
        /// Rows in rank order.
        rows: Vec<Record>,
    },
    /// Insert or field merge for one key.
    Update {
        /// Record key.
        key: RecordKey,
        /// Changed fields (all fields for an insert).
        fields: Fields,
    },
    /// Removal of one key.
    Evict {
        /// Record key.
        key: RecordKey,
    },
}

impl ViewEvent {
    /// Event type name.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Snapshot { .. } => "snapshot",
            Self::Update { .. } => "update",
            Self::Evict { .. } => "evict",
        }
    }

    /// Encode as a JSON line.
    ///
    /// # Errors
    ///
    /// Returns an error if a field value cannot be serialized.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// Consumer View
// =============================================================================

/// Consumer-side mirror built purely from [`ViewEvent`]s.
///
/// Bounds are the engine's business; the consumer only orders.
#[derive(Debug, Clone)]
pub struct ConsumerView {
    store: ViewStore,
    snapshots_seen: u64,
}

impl ConsumerView {
    /// Create an empty mirror that orders rows like the engine does.
    #[must_use]
    pub fn new(order_by: Option<OrderBy>) -> Self {
        Self {
            store: ViewStore::new(order_by, Bound::unbounded()),
            snapshots_seen: 0,
        }
    }

    /// Apply one event.
    pub fn apply(&mut self, event: ViewEvent) {
        match event {
            ViewEvent::Snapshot { rows } => {
                self.snapshots_seen += 1;
                self.store.replace_all(rows);
            }
            ViewEvent::Update { key, fields } => {
                self.store.upsert(&key, &fields);
            }
            ViewEvent::Evict { key } => {
                self.store.remove(&key);
            }
        }
    }

    /// Number of snapshots applied.
    #[must_use]
    pub const fn snapshots_seen(&self) -> u64 {
        self.snapshots_seen
    }

    /// Rows in order.
    #[must_use]
    pub fn rows(&self) -> Vec<Record> {
        self.store.rows()
    }

    /// Keys in order.
    #[must_use]
    pub fn keys(&self) -> Vec<RecordKey> {
        self.store.keys()
    }

    /// Get a record.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Record> {
        self.store.get(key)
    }
}

//! Reconciliation Engine
//!
//! Owns one subscription's view and its phase state machine.
//!
//! ```text
//!   Idle ──open──► SnapshotAccumulating ──end──► Live ──begin──┐
//!                        ▲                         │            │
//!                        └─────────────────────────┼────────────┘
//!                                                  │
//!   (any) ───────────close──────────────────────► Closed
//! ```
//!
//! While accumulating, rows go to a scratch buffer and updates/evictions are
//! deferred. `end` swaps the buffer into the view in one step, emits a
//! snapshot event and replays the deferred messages. During a resnapshot the
//! previous view stays in place until the new `end`.
//!
//! The engine is synchronous and single-owner: one task feeds it messages in
//! arrival order.

use std::time::Instant;

use crate::domain::conflation::Conflator;
use crate::domain::message::FeedMessage;
use crate::domain::record::{Fields, Record, RecordKey};
use crate::domain::spec::SubscriptionSpec;
use crate::domain::view::{UpsertOutcome, ViewEvent, ViewStore};
use crate::infrastructure::metrics;

// =============================================================================
// Phase
// =============================================================================

/// Externally visible engine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnginePhase {
    /// Created, not opened.
    Idle,
    /// Building a snapshot.
    SnapshotAccumulating,
    /// Applying incremental messages.
    Live,
    /// Terminal.
    Closed,
}

impl EnginePhase {
    /// Phase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::SnapshotAccumulating => "snapshot_accumulating",
            Self::Live => "live",
            Self::Closed => "closed",
        }
    }

    pub(crate) const fn to_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::SnapshotAccumulating => 1,
            Self::Live => 2,
            Self::Closed => 3,
        }
    }

    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::SnapshotAccumulating,
            2 => Self::Live,
            3 => Self::Closed,
            _ => Self::Idle,
        }
    }
}

// =============================================================================
// State
// =============================================================================

#[derive(Debug)]
struct Scratch {
    rows: Vec<Record>,
    deferred: Vec<FeedMessage>,
    started: Instant,
}

impl Scratch {
    fn new(started: Instant) -> Self {
        Self {
            rows: Vec::new(),
            deferred: Vec::new(),
            started,
        }
    }
}

#[derive(Debug)]
enum State {
    Idle,
    Accumulating(Scratch),
    Live,
    Closed,
}

// =============================================================================
// Engine
// =============================================================================

/// Per-subscription reconciliation state machine.
///
/// # Example
///
/// ```rust
/// use std::time::Instant;
/// use serde_json::json;
/// use sow_sync::application::engine::ReconciliationEngine;
/// use sow_sync::domain::message::FeedMessage;
/// use sow_sync::domain::record::Record;
/// use sow_sync::domain::spec::SubscriptionSpec;
///
/// let mut engine = ReconciliationEngine::new(SubscriptionSpec::new("ticker"));
/// engine.open(Instant::now());
///
/// let fields = json!({"bid": 100}).as_object().cloned().unwrap();
/// engine.apply(FeedMessage::Begin, Instant::now());
/// engine.apply(FeedMessage::Row(Record::new("AAPL", fields)), Instant::now());
/// assert!(engine.view().is_empty());
///
/// let events = engine.apply(FeedMessage::End, Instant::now());
/// assert_eq!(events.len(), 1);
/// assert_eq!(engine.view().len(), 1);
/// ```
#[derive(Debug)]
pub struct ReconciliationEngine {
    spec: SubscriptionSpec,
    state: State,
    store: ViewStore,
    conflator: Option<Conflator>,
}

impl ReconciliationEngine {
    /// Create an idle engine for a spec.
    #[must_use]
    pub fn new(spec: SubscriptionSpec) -> Self {
        let store = ViewStore::new(spec.order_by.clone(), spec.bound);
        let conflator = spec.conflation.map(Conflator::new);
        Self {
            spec,
            state: State::Idle,
            store,
            conflator,
        }
    }

    /// Spec this engine reconciles.
    #[must_use]
    pub const fn spec(&self) -> &SubscriptionSpec {
        &self.spec
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> EnginePhase {
        match self.state {
            State::Idle => EnginePhase::Idle,
            State::Accumulating(_) => EnginePhase::SnapshotAccumulating,
            State::Live => EnginePhase::Live,
            State::Closed => EnginePhase::Closed,
        }
    }

    /// Read-only view.
    #[must_use]
    pub const fn view(&self) -> &ViewStore {
        &self.store
    }

    /// Start waiting for the snapshot. No-op unless idle.
    pub fn open(&mut self, now: Instant) {
        if matches!(self.state, State::Idle) {
            self.state = State::Accumulating(Scratch::new(now));
        }
    }

    /// Apply one message and return the resulting view events.
    pub fn apply(&mut self, message: FeedMessage, now: Instant) -> Vec<ViewEvent> {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Closed => {
                tracing::trace!(topic = %self.spec.topic, phase = message.phase().as_str(), "Ignoring message on closed engine");
                Vec::new()
            }
            State::Idle => {
                self.state = State::Idle;
                tracing::warn!(topic = %self.spec.topic, phase = message.phase().as_str(), "Message before open, dropped");
                Vec::new()
            }
            State::Accumulating(scratch) => self.apply_accumulating(scratch, message, now),
            State::Live => self.apply_live(message, now),
        }
    }

    /// Deliver conflated updates that are due.
    pub fn flush_conflated(&mut self, now: Instant) -> Vec<ViewEvent> {
        if !matches!(self.state, State::Live) {
            return Vec::new();
        }
        let Some(conflator) = self.conflator.as_mut() else {
            return Vec::new();
        };

        conflator
            .drain_due(now)
            .into_iter()
            .filter(|(key, _)| self.store.contains(key))
            .map(|(key, fields)| ViewEvent::Update { key, fields })
            .collect()
    }

    /// When the next conflated update becomes due, if any.
    #[must_use]
    pub fn next_flush(&self) -> Option<Instant> {
        if !matches!(self.state, State::Live) {
            return None;
        }
        self.conflator.as_ref().and_then(Conflator::next_due)
    }

    /// Enter the terminal state, discarding the view and any scratch buffer.
    pub fn close(&mut self) {
        if let State::Accumulating(scratch) = &self.state {
            tracing::debug!(
                topic = %self.spec.topic,
                buffered_rows = scratch.rows.len(),
                "Discarding unfinished snapshot"
            );
        }
        self.state = State::Closed;
        self.store.clear();
        if let Some(conflator) = self.conflator.as_mut() {
            conflator.clear();
        }
    }

    fn apply_accumulating(
        &mut self,
        mut scratch: Scratch,
        message: FeedMessage,
        now: Instant,
    ) -> Vec<ViewEvent> {
        match message {
            FeedMessage::Begin => {
                if !scratch.rows.is_empty() || !scratch.deferred.is_empty() {
                    tracing::debug!(topic = %self.spec.topic, "Snapshot restarted by feed");
                }
                self.state = State::Accumulating(Scratch::new(scratch.started));
                Vec::new()
            }
            FeedMessage::Row(record) => {
                scratch.rows.push(record);
                self.state = State::Accumulating(scratch);
                Vec::new()
            }
            FeedMessage::End => self.promote(scratch, now),
            deferred @ (FeedMessage::Update(_) | FeedMessage::Evict(_)) => {
                scratch.deferred.push(deferred);
                self.state = State::Accumulating(scratch);
                Vec::new()
            }
        }
    }

    fn promote(&mut self, scratch: Scratch, now: Instant) -> Vec<ViewEvent> {
        let Scratch {
            rows,
            deferred,
            started,
        } = scratch;
        let received = rows.len();

        self.store.replace_all(rows);
        if let Some(conflator) = self.conflator.as_mut() {
            conflator.clear();
        }
        self.state = State::Live;

        metrics::record_snapshot_promotion(&self.spec.topic, now.saturating_duration_since(started));
        tracing::info!(
            topic = %self.spec.topic,
            received,
            retained = self.store.len(),
            deferred = deferred.len(),
            "Snapshot promoted"
        );

        let mut events = vec![ViewEvent::Snapshot {
            rows: self.store.rows(),
        }];
        for message in deferred {
            events.extend(self.apply_live(message, now));
        }
        events
    }

    fn apply_live(&mut self, message: FeedMessage, now: Instant) -> Vec<ViewEvent> {
        self.state = State::Live;
        match message {
            FeedMessage::Begin => {
                tracing::info!(topic = %self.spec.topic, "Resnapshot started");
                self.state = State::Accumulating(Scratch::new(now));
                Vec::new()
            }
            FeedMessage::End => {
                tracing::warn!(topic = %self.spec.topic, "Snapshot end without begin, ignored");
                Vec::new()
            }
            FeedMessage::Row(record) => {
                tracing::debug!(topic = %self.spec.topic, key = %record.key, "Row outside snapshot, applied as update");
                self.upsert(record.key, &record.fields, now)
            }
            FeedMessage::Update(record) => self.upsert(record.key, &record.fields, now),
            FeedMessage::Evict(key) => self.evict(key),
        }
    }

    fn upsert(&mut self, key: RecordKey, fields: &Fields, now: Instant) -> Vec<ViewEvent> {
        let mut events = Vec::new();

        match self.store.upsert(&key, fields) {
            UpsertOutcome::Excluded => {
                metrics::record_excluded(&self.spec.topic);
                tracing::trace!(topic = %self.spec.topic, key = %key, "Row outside bound, excluded");
                return events;
            }
            UpsertOutcome::Inserted {
                displaced: Some(displaced),
            } => {
                if let Some(conflator) = self.conflator.as_mut() {
                    conflator.discard(&displaced);
                }
                events.push(ViewEvent::Evict { key: displaced });
            }
            UpsertOutcome::Inserted { displaced: None } | UpsertOutcome::Merged => {}
        }

        match self.conflator.as_mut() {
            Some(conflator) => match conflator.offer(&key, fields, now) {
                Some(fields) => events.push(ViewEvent::Update { key, fields }),
                None => metrics::record_conflated(&self.spec.topic),
            },
            None => events.push(ViewEvent::Update {
                key,
                fields: fields.clone(),
            }),
        }

        events
    }

    fn evict(&mut self, key: RecordKey) -> Vec<ViewEvent> {
        if let Some(conflator) = self.conflator.as_mut() {
            conflator.discard(&key);
        }
        if self.store.remove(&key).is_some() {
            vec![ViewEvent::Evict { key }]
        } else {
            tracing::trace!(topic = %self.spec.topic, key = %key, "Evict for absent key");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{Value, json};

    use super::*;
    use crate::domain::spec::Direction;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn row(key: &str, value: Value) -> FeedMessage {
        FeedMessage::Row(Record::new(key, fields(value)))
    }

    fn update(key: &str, value: Value) -> FeedMessage {
        FeedMessage::Update(Record::new(key, fields(value)))
    }

    fn opened(spec: SubscriptionSpec) -> (ReconciliationEngine, Instant) {
        let now = Instant::now();
        let mut engine = ReconciliationEngine::new(spec);
        engine.open(now);
        (engine, now)
    }

    fn live_with(spec: SubscriptionSpec, rows: Vec<FeedMessage>) -> (ReconciliationEngine, Instant) {
        let (mut engine, now) = opened(spec);
        engine.apply(FeedMessage::Begin, now);
        for r in rows {
            engine.apply(r, now);
        }
        engine.apply(FeedMessage::End, now);
        (engine, now)
    }

    #[test]
    fn starts_idle_and_opens() {
        let mut engine = ReconciliationEngine::new(SubscriptionSpec::new("t"));
        assert_eq!(engine.phase(), EnginePhase::Idle);

        engine.open(Instant::now());
        assert_eq!(engine.phase(), EnginePhase::SnapshotAccumulating);
    }

    #[test]
    fn messages_before_open_are_dropped() {
        let mut engine = ReconciliationEngine::new(SubscriptionSpec::new("t"));
        let events = engine.apply(update("AAPL", json!({"bid": 1})), Instant::now());

        assert!(events.is_empty());
        assert!(engine.view().is_empty());
        assert_eq!(engine.phase(), EnginePhase::Idle);
    }

    #[test]
    fn snapshot_not_visible_before_end() {
        let spec = SubscriptionSpec::new("t").order_by("sym", Direction::Asc);
        let (mut engine, now) = opened(spec);

        assert!(engine.apply(FeedMessage::Begin, now).is_empty());
        assert!(engine.apply(row("B", json!({"sym": "B"})), now).is_empty());
        assert!(engine.apply(row("A", json!({"sym": "A"})), now).is_empty());
        assert!(engine.view().is_empty());

        let events = engine.apply(FeedMessage::End, now);

        assert_eq!(engine.phase(), EnginePhase::Live);
        assert_eq!(engine.view().keys(), vec!["A", "B"]);
        assert_eq!(
            events,
            vec![ViewEvent::Snapshot {
                rows: vec![
                    Record::new("A", fields(json!({"sym": "A"}))),
                    Record::new("B", fields(json!({"sym": "B"}))),
                ]
            }]
        );
    }

    #[test]
    fn deltas_before_end_replay_after_promotion() {
        let (mut engine, now) = opened(SubscriptionSpec::new("t"));
        engine.apply(FeedMessage::Begin, now);
        engine.apply(row("AAPL", json!({"bid": 100})), now);
        engine.apply(update("AAPL", json!({"bid": 101})), now);
        engine.apply(FeedMessage::Evict("MSFT".to_string()), now);
        engine.apply(update("GOOG", json!({"bid": 7})), now);

        let events = engine.apply(FeedMessage::End, now);

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], ViewEvent::Snapshot { rows } if rows.len() == 1));
        assert!(matches!(&events[1], ViewEvent::Update { key, .. } if key == "AAPL"));
        assert!(matches!(&events[2], ViewEvent::Update { key, .. } if key == "GOOG"));
        assert_eq!(
            engine.view().get("AAPL").unwrap().field("bid"),
            Some(&json!(101))
        );
    }

    #[test]
    fn merge_update_keeps_other_fields() {
        let (mut engine, now) = live_with(
            SubscriptionSpec::new("t"),
            vec![row("AAPL", json!({"bid": 100, "ask": 101}))],
        );

        let events = engine.apply(update("AAPL", json!({"bid": 102})), now);

        assert_eq!(
            engine.view().get("AAPL").unwrap().fields,
            fields(json!({"bid": 102, "ask": 101}))
        );
        assert_eq!(
            events,
            vec![ViewEvent::Update {
                key: "AAPL".to_string(),
                fields: fields(json!({"bid": 102}))
            }]
        );
    }

    #[test]
    fn unknown_key_update_inserts() {
        let (mut engine, now) = live_with(SubscriptionSpec::new("t"), vec![]);

        engine.apply(update("MSFT", json!({"bid": 50})), now);

        assert_eq!(
            engine.view().get("MSFT"),
            Some(&Record::new("MSFT", fields(json!({"bid": 50}))))
        );
    }

    #[test]
    fn evict_twice_is_noop() {
        let (mut engine, now) = live_with(
            SubscriptionSpec::new("t"),
            vec![row("AAPL", json!({})), row("MSFT", json!({}))],
        );

        let first = engine.apply(FeedMessage::Evict("AAPL".to_string()), now);
        let after_first = engine.view().rows();
        let second = engine.apply(FeedMessage::Evict("AAPL".to_string()), now);

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(engine.view().rows(), after_first);
        assert!(!engine.view().contains("AAPL"));
    }

    #[test]
    fn bound_enforced_on_live_inserts() {
        let spec = SubscriptionSpec::new("t")
            .order_by("bid", Direction::Desc)
            .top_n(2);
        let (mut engine, now) = live_with(spec, vec![]);

        engine.apply(update("A", json!({"bid": 10})), now);
        engine.apply(update("B", json!({"bid": 30})), now);
        let events = engine.apply(update("C", json!({"bid": 20})), now);

        let bids: Vec<_> = engine
            .view()
            .iter()
            .map(|r| r.field("bid").cloned().unwrap())
            .collect();
        assert_eq!(bids, vec![json!(30), json!(20)]);
        assert_eq!(
            events[0],
            ViewEvent::Evict {
                key: "A".to_string()
            }
        );
    }

    #[test]
    fn excluded_row_emits_nothing() {
        let spec = SubscriptionSpec::new("t")
            .order_by("bid", Direction::Desc)
            .top_n(1);
        let (mut engine, now) = live_with(spec, vec![row("A", json!({"bid": 10}))]);

        let events = engine.apply(update("B", json!({"bid": 5})), now);

        assert!(events.is_empty());
        assert_eq!(engine.view().keys(), vec!["A"]);
    }

    #[test]
    fn resnapshot_keeps_old_view_until_end() {
        let (mut engine, now) = live_with(
            SubscriptionSpec::new("t"),
            vec![row("AAPL", json!({})), row("MSFT", json!({}))],
        );

        engine.apply(FeedMessage::Begin, now);
        engine.apply(row("GOOG", json!({})), now);
        assert_eq!(engine.phase(), EnginePhase::SnapshotAccumulating);
        assert_eq!(engine.view().keys(), vec!["AAPL", "MSFT"]);

        engine.apply(FeedMessage::End, now);
        assert_eq!(engine.view().keys(), vec!["GOOG"]);
    }

    #[test]
    fn repeated_begin_restarts_buffer() {
        let (mut engine, now) = opened(SubscriptionSpec::new("t"));
        engine.apply(FeedMessage::Begin, now);
        engine.apply(row("STALE", json!({})), now);
        engine.apply(FeedMessage::Begin, now);
        engine.apply(row("FRESH", json!({})), now);
        engine.apply(FeedMessage::End, now);

        assert_eq!(engine.view().keys(), vec!["FRESH"]);
    }

    #[test]
    fn stray_end_in_live_is_ignored() {
        let (mut engine, now) = live_with(SubscriptionSpec::new("t"), vec![row("A", json!({}))]);

        assert!(engine.apply(FeedMessage::End, now).is_empty());
        assert_eq!(engine.phase(), EnginePhase::Live);
        assert_eq!(engine.view().keys(), vec!["A"]);
    }

    #[test]
    fn close_discards_everything() {
        let (mut engine, now) = opened(SubscriptionSpec::new("t"));
        engine.apply(FeedMessage::Begin, now);
        engine.apply(row("A", json!({})), now);

        engine.close();

        assert_eq!(engine.phase(), EnginePhase::Closed);
        assert!(engine.apply(FeedMessage::End, now).is_empty());
        assert!(engine.view().is_empty());
    }

    #[test]
    fn conflation_coalesces_updates() {
        let interval = Duration::from_millis(100);
        let (mut engine, t0) = live_with(
            SubscriptionSpec::new("t").conflate(interval),
            vec![row("AAPL", json!({"bid": 100, "ask": 101}))],
        );

        let first = engine.apply(update("AAPL", json!({"bid": 101})), t0);
        let second = engine.apply(update("AAPL", json!({"bid": 102})), t0 + Duration::from_millis(10));
        let third = engine.apply(update("AAPL", json!({"ask": 103})), t0 + Duration::from_millis(20));

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert!(third.is_empty());
        assert_eq!(
            engine.view().get("AAPL").unwrap().fields,
            fields(json!({"bid": 102, "ask": 103}))
        );

        let flushed = engine.flush_conflated(t0 + interval);
        assert_eq!(
            flushed,
            vec![ViewEvent::Update {
                key: "AAPL".to_string(),
                fields: fields(json!({"bid": 102, "ask": 103}))
            }]
        );
    }

    #[test]
    fn evict_drops_pending_conflated_update() {
        let interval = Duration::from_millis(100);
        let (mut engine, t0) = live_with(
            SubscriptionSpec::new("t").conflate(interval),
            vec![row("AAPL", json!({"bid": 100}))],
        );
        engine.apply(update("AAPL", json!({"bid": 101})), t0);
        engine.apply(update("AAPL", json!({"bid": 102})), t0);

        let events = engine.apply(FeedMessage::Evict("AAPL".to_string()), t0);

        assert_eq!(
            events,
            vec![ViewEvent::Evict {
                key: "AAPL".to_string()
            }]
        );
        assert!(engine.flush_conflated(t0 + interval * 2).is_empty());
    }

    #[test]
    fn phase_round_trips_through_u8() {
        for phase in [
            EnginePhase::Idle,
            EnginePhase::SnapshotAccumulating,
            EnginePhase::Live,
            EnginePhase::Closed,
        ] {
            assert_eq!(EnginePhase::from_u8(phase.to_u8()), phase);
        }
    }
}

//! Materialized View Store
//!
//! Keyed rows plus an ordered index. Lookups by key go through the hash map,
//! ordering and bound checks go through the `BTreeMap` index.
//!
//! # Invariants
//!
//! - Every key in `rows` appears exactly once in `index` and vice versa.
//! - With a `top_n` bound, `len() <= top_n` at all times.
//! - Rows without an ordering field rank by arrival.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use super::rank::RankKey;
use crate::domain::record::{Fields, Record, RecordKey};
use crate::domain::spec::{Bound, Direction, OrderBy};

#[derive(Debug, Clone)]
struct Slot {
    record: Record,
    rank: RankKey,
}

/// Result of an upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Key was new and now ranks within the bound.
    Inserted {
        /// Row pushed out of a full bound to make room.
        displaced: Option<RecordKey>,
    },
    /// Key existed; fields were merged.
    Merged,
    /// Key was new but does not rank within a full bound.
    Excluded,
}

/// Ordered, identity-keyed, optionally bounded record collection.
#[derive(Debug, Clone)]
pub struct ViewStore {
    order_by: Option<OrderBy>,
    bound: Bound,
    rows: HashMap<RecordKey, Slot>,
    index: BTreeMap<RankKey, RecordKey>,
    next_seq: u64,
}

impl ViewStore {
    /// Create an empty store.
    #[must_use]
    pub fn new(order_by: Option<OrderBy>, bound: Bound) -> Self {
        Self {
            order_by,
            bound,
            rows: HashMap::new(),
            index: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Create an unordered, unbounded store.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(None, Bound::unbounded())
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Check whether a key is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.rows.contains_key(key)
    }

    /// Get a record by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Record> {
        self.rows.get(key).map(|slot| &slot.record)
    }

    /// Iterate records in rank order.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.index
            .values()
            .filter_map(|key| self.rows.get(key).map(|slot| &slot.record))
    }

    /// Keys in rank order.
    #[must_use]
    pub fn keys(&self) -> Vec<RecordKey> {
        self.index.values().cloned().collect()
    }

    /// Clone all records in rank order.
    #[must_use]
    pub fn rows(&self) -> Vec<Record> {
        self.iter().cloned().collect()
    }

    /// Remove every row.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.index.clear();
    }

    /// Replace the whole content with a snapshot.
    ///
    /// Rows are ranked, `skip_n` leading rows are dropped and the rest is cut
    /// at `top_n`. A key repeated in the snapshot keeps its first position and
    /// its last field values.
    pub fn replace_all(&mut self, snapshot: Vec<Record>) {
        self.clear();

        let mut staged: HashMap<RecordKey, Slot> = HashMap::with_capacity(snapshot.len());
        for record in snapshot {
            if let Some(slot) = staged.get_mut(&record.key) {
                slot.rank = self.rank_for(&record.fields, slot.rank.seq());
                slot.record = record;
                continue;
            }
            let seq = self.bump_seq();
            let rank = self.rank_for(&record.fields, seq);
            staged.insert(record.key.clone(), Slot { record, rank });
        }

        let mut ordered: Vec<Slot> = staged.into_values().collect();
        ordered.sort_by(|a, b| a.rank.cmp(&b.rank));

        let take = self.bound.top_n.unwrap_or(usize::MAX);
        for slot in ordered.into_iter().skip(self.bound.skip_n).take(take) {
            self.index.insert(slot.rank.clone(), slot.record.key.clone());
            self.rows.insert(slot.record.key.clone(), slot);
        }
    }

    /// Merge into an existing row or insert a new one.
    ///
    /// A merge that changes the ordering field re-ranks the row but keeps its
    /// arrival sequence. An insert into a full bound either displaces the
    /// lowest-ranked row or is excluded when it would itself rank last.
    pub fn upsert(&mut self, key: &str, fields: &Fields) -> UpsertOutcome {
        if let Some(slot) = self.rows.get_mut(key) {
            slot.record.merge(fields);
            let reranks = self
                .order_by
                .as_ref()
                .is_some_and(|o| fields.contains_key(&o.field));
            if reranks {
                let seq = slot.rank.seq();
                let new_rank = Self::rank_with(self.order_by.as_ref(), &slot.record.fields, seq);
                let old_rank = std::mem::replace(&mut slot.rank, new_rank.clone());
                self.index.remove(&old_rank);
                self.index.insert(new_rank, key.to_string());
            }
            return UpsertOutcome::Merged;
        }

        let seq = self.bump_seq();
        let rank = self.rank_for(fields, seq);

        let mut displaced = None;
        if let Some(cap) = self.bound.top_n
            && self.rows.len() >= cap
        {
            let Some((last_rank, _)) = self.index.last_key_value() else {
                return UpsertOutcome::Excluded;
            };
            if rank > *last_rank {
                return UpsertOutcome::Excluded;
            }
            if let Some((_, last_key)) = self.index.pop_last() {
                self.rows.remove(&last_key);
                displaced = Some(last_key);
            }
        }

        self.index.insert(rank.clone(), key.to_string());
        self.rows.insert(
            key.to_string(),
            Slot {
                record: Record::new(key, fields.clone()),
                rank,
            },
        );

        UpsertOutcome::Inserted { displaced }
    }

    /// Remove a key. Removing an absent key is a no-op.
    pub fn remove(&mut self, key: &str) -> Option<Record> {
        let slot = self.rows.remove(key)?;
        self.index.remove(&slot.rank);
        Some(slot.record)
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn rank_for(&self, fields: &Fields, seq: u64) -> RankKey {
        Self::rank_with(self.order_by.as_ref(), fields, seq)
    }

    fn rank_with(order_by: Option<&OrderBy>, fields: &Fields, seq: u64) -> RankKey {
        match order_by {
            Some(order) => RankKey::new(
                fields.get(&order.field).cloned().unwrap_or(Value::Null),
                order.direction,
                seq,
            ),
            None => RankKey::new(Value::Null, Direction::Asc, seq),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn rec(key: &str, value: Value) -> Record {
        Record::new(key, fields(value))
    }

    fn by_bid_desc(top_n: Option<usize>) -> ViewStore {
        ViewStore::new(
            Some(OrderBy::new("bid", Direction::Desc)),
            Bound { top_n, skip_n: 0 },
        )
    }

    #[test]
    fn replace_all_orders_rows() {
        let mut store = ViewStore::new(Some(OrderBy::new("bid", Direction::Asc)), Bound::default());

        store.replace_all(vec![
            rec("B", json!({"bid": 20})),
            rec("A", json!({"bid": 10})),
        ]);

        assert_eq!(store.keys(), vec!["A", "B"]);
    }

    #[test]
    fn replace_all_unordered_keeps_arrival_order() {
        let mut store = ViewStore::unbounded();

        store.replace_all(vec![rec("B", json!({})), rec("A", json!({}))]);

        assert_eq!(store.keys(), vec!["B", "A"]);
    }

    #[test]
    fn replace_all_discards_previous_rows() {
        let mut store = ViewStore::unbounded();
        store.replace_all(vec![rec("AAPL", json!({})), rec("MSFT", json!({}))]);

        store.replace_all(vec![rec("GOOG", json!({}))]);

        assert_eq!(store.keys(), vec!["GOOG"]);
        assert!(!store.contains("AAPL"));
    }

    #[test]
    fn replace_all_applies_skip_and_top() {
        let mut store = ViewStore::new(
            Some(OrderBy::new("bid", Direction::Desc)),
            Bound {
                top_n: Some(2),
                skip_n: 1,
            },
        );

        store.replace_all(vec![
            rec("A", json!({"bid": 10})),
            rec("B", json!({"bid": 40})),
            rec("C", json!({"bid": 30})),
            rec("D", json!({"bid": 20})),
        ]);

        assert_eq!(store.keys(), vec!["C", "D"]);
    }

    #[test]
    fn replace_all_duplicate_key_keeps_last_fields() {
        let mut store = ViewStore::unbounded();

        store.replace_all(vec![
            rec("A", json!({"bid": 1})),
            rec("B", json!({"bid": 2})),
            rec("A", json!({"bid": 3})),
        ]);

        assert_eq!(store.len(), 2);
        assert_eq!(store.keys(), vec!["A", "B"]);
        assert_eq!(store.get("A").unwrap().field("bid"), Some(&json!(3)));
    }

    #[test]
    fn upsert_merges_existing() {
        let mut store = ViewStore::unbounded();
        store.replace_all(vec![rec("AAPL", json!({"bid": 100, "ask": 101}))]);

        let outcome = store.upsert("AAPL", &fields(json!({"bid": 102})));

        assert_eq!(outcome, UpsertOutcome::Merged);
        assert_eq!(
            store.get("AAPL").unwrap().fields,
            fields(json!({"bid": 102, "ask": 101}))
        );
    }

    #[test]
    fn upsert_inserts_unknown_key() {
        let mut store = ViewStore::unbounded();

        let outcome = store.upsert("MSFT", &fields(json!({"bid": 50})));

        assert_eq!(outcome, UpsertOutcome::Inserted { displaced: None });
        assert_eq!(store.get("MSFT"), Some(&rec("MSFT", json!({"bid": 50}))));
    }

    #[test]
    fn bound_keeps_highest_ranked() {
        let mut store = by_bid_desc(Some(2));

        store.upsert("A", &fields(json!({"bid": 10})));
        store.upsert("B", &fields(json!({"bid": 30})));
        let outcome = store.upsert("C", &fields(json!({"bid": 20})));

        assert_eq!(
            outcome,
            UpsertOutcome::Inserted {
                displaced: Some("A".to_string())
            }
        );
        let bids: Vec<_> = store.iter().map(|r| r.field("bid").cloned()).collect();
        assert_eq!(bids, vec![Some(json!(30)), Some(json!(20))]);
    }

    #[test]
    fn bound_excludes_low_ranked_insert() {
        let mut store = by_bid_desc(Some(2));
        store.upsert("A", &fields(json!({"bid": 30})));
        store.upsert("B", &fields(json!({"bid": 20})));

        let outcome = store.upsert("C", &fields(json!({"bid": 5})));

        assert_eq!(outcome, UpsertOutcome::Excluded);
        assert_eq!(store.keys(), vec!["A", "B"]);
    }

    #[test]
    fn bound_without_ordering_excludes_late_arrivals() {
        let mut store = ViewStore::new(None, Bound::top(1));
        store.upsert("A", &fields(json!({})));

        assert_eq!(
            store.upsert("B", &fields(json!({}))),
            UpsertOutcome::Excluded
        );
        assert_eq!(store.keys(), vec!["A"]);
    }

    #[test]
    fn merge_on_order_field_reranks() {
        let mut store = by_bid_desc(None);
        store.upsert("A", &fields(json!({"bid": 10})));
        store.upsert("B", &fields(json!({"bid": 20})));

        store.upsert("A", &fields(json!({"bid": 30})));

        assert_eq!(store.keys(), vec!["A", "B"]);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut store = ViewStore::unbounded();
        store.upsert("AAPL", &fields(json!({"bid": 1})));

        assert!(store.remove("AAPL").is_some());
        assert!(store.remove("AAPL").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn missing_order_field_sorts_as_null() {
        let mut store = ViewStore::new(Some(OrderBy::new("bid", Direction::Asc)), Bound::default());
        store.upsert("A", &fields(json!({"bid": 1})));
        store.upsert("B", &fields(json!({})));

        assert_eq!(store.keys(), vec!["B", "A"]);
    }

    proptest! {
        #[test]
        fn bounded_store_holds_top_n_in_order(
            bids in proptest::collection::vec(0i64..1_000, 1..60),
            top_n in 1usize..10,
        ) {
            let mut store = by_bid_desc(Some(top_n));
            for (i, bid) in bids.iter().enumerate() {
                store.upsert(&format!("K{i}"), &fields(json!({"bid": bid})));
            }

            prop_assert!(store.len() <= top_n);
            prop_assert_eq!(store.len(), bids.len().min(top_n));

            let kept: Vec<i64> = store
                .iter()
                .map(|r| r.field("bid").and_then(Value::as_i64).unwrap())
                .collect();
            let mut expected = bids.clone();
            expected.sort_unstable_by(|a, b| b.cmp(a));
            expected.truncate(top_n);
            prop_assert_eq!(kept, expected);
        }

        #[test]
        fn index_and_rows_stay_consistent(
            ops in proptest::collection::vec((0u8..3, 0usize..8, 0i64..50), 1..100),
        ) {
            let mut store = by_bid_desc(Some(5));
            for (op, key, bid) in ops {
                let key = format!("K{key}");
                if op == 0 {
                    store.remove(&key);
                } else {
                    store.upsert(&key, &fields(json!({"bid": bid})));
                }
                prop_assert_eq!(store.keys().len(), store.len());
                for k in store.keys() {
                    prop_assert!(store.contains(&k));
                }
            }
        }
    }
}

//! Update Conflation
//!
//! Limits delivered update events to one per key per interval. The stored
//! view is never delayed; only the events describing it are.
//!
//! The first update for a key after a quiet interval goes out immediately.
//! Updates arriving inside the interval are merged into one pending delta
//! that becomes due when the interval since the last delivery expires.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::record::{Fields, RecordKey};

#[derive(Debug, Clone)]
struct Pending {
    fields: Fields,
    due: Instant,
    seq: u64,
}

/// Per-key event rate limiter.
#[derive(Debug, Clone)]
pub struct Conflator {
    interval: Duration,
    last_emitted: HashMap<RecordKey, Instant>,
    pending: HashMap<RecordKey, Pending>,
    next_seq: u64,
}

impl Conflator {
    /// Create a conflator.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emitted: HashMap::new(),
            pending: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Conflation interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of keys holding a pending delta.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Offer an update.
    ///
    /// Returns the fields to deliver now, or `None` if the update was
    /// folded into a pending delta.
    pub fn offer(&mut self, key: &str, fields: &Fields, now: Instant) -> Option<Fields> {
        if let Some(pending) = self.pending.get_mut(key) {
            merge_into(&mut pending.fields, fields);
            return None;
        }

        if let Some(last) = self.last_emitted.get(key)
            && now.saturating_duration_since(*last) < self.interval
        {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.pending.insert(
                key.to_string(),
                Pending {
                    fields: fields.clone(),
                    due: *last + self.interval,
                    seq,
                },
            );
            return None;
        }

        self.last_emitted.insert(key.to_string(), now);
        Some(fields.clone())
    }

    /// Forget a key, dropping any pending delta.
    pub fn discard(&mut self, key: &str) {
        self.pending.remove(key);
        self.last_emitted.remove(key);
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.last_emitted.clear();
    }

    /// Take every pending delta that is due, oldest first.
    pub fn drain_due(&mut self, now: Instant) -> Vec<(RecordKey, Fields)> {
        let mut due: Vec<(RecordKey, Pending)> = Vec::new();
        self.pending.retain(|key, pending| {
            if pending.due <= now {
                due.push((key.clone(), pending.clone()));
                false
            } else {
                true
            }
        });
        due.sort_by(|a, b| a.1.due.cmp(&b.1.due).then(a.1.seq.cmp(&b.1.seq)));

        for (key, _) in &due {
            self.last_emitted.insert(key.clone(), now);
        }

        let interval = self.interval;
        let pending = &self.pending;
        self.last_emitted.retain(|key, last| {
            pending.contains_key(key) || now.saturating_duration_since(*last) < interval
        });

        due.into_iter().map(|(key, p)| (key, p.fields)).collect()
    }

    /// Earliest pending due time.
    #[must_use]
    pub fn next_due(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.due).min()
    }
}

fn merge_into(target: &mut Fields, incoming: &Fields) {
    for (name, value) in incoming {
        target.insert(name.clone(), value.clone());
    }
}

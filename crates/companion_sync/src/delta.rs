//! Delta tracking
//!
//! Local changes go into an append-only log. Every entry gets a sequence
//! number; acknowledging a sequence number drops every entry up to it. Queries
//! coalesce the unacknowledged suffix per entity so a stale peer receives each
//! entity once, in the order of its latest change.

use crate::types::{ChangeOp, DeltaChange, TimestampMs};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedChange {
    pub seq: u64,
    pub change: DeltaChange,
}

/// A coalesced change set together with the cursor that acknowledges it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaSet {
    pub changes: Vec<LoggedChange>,
}

impl DeltaSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Highest sequence number covered by this set
    pub fn cursor(&self) -> Option<u64> {
        self.changes.iter().map(|c| c.seq).max()
    }

    pub fn into_changes(self) -> Vec<DeltaChange> {
        self.changes.into_iter().map(|c| c.change).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaTracker {
    log: Vec<LoggedChange>,
    next_seq: u64,
    acked_seq: u64,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self {
            log: Vec::new(),
            next_seq: 1,
            acked_seq: 0,
        }
    }

    /// Append a change and return its sequence number
    pub fn record(&mut self, change: DeltaChange) -> u64 {
        let seq = self.next_seq.max(self.acked_seq + 1);
        self.next_seq = seq + 1;
        self.log.push(LoggedChange { seq, change });
        seq
    }

    /// Coalesced unacknowledged changes with `timestamp >= since`
    pub fn changes_since(&self, since: TimestampMs) -> Vec<DeltaChange> {
        self.coalesce(|c| c.change.timestamp >= since).into_changes()
    }

    /// Every unacknowledged change, coalesced
    pub fn pending(&self) -> DeltaSet {
        self.coalesce(|_| true)
    }

    fn coalesce<P>(&self, include: P) -> DeltaSet
    where
        P: Fn(&LoggedChange) -> bool,
    {
        let mut latest: HashMap<&str, LoggedChange> = HashMap::new();
        let mut inserted: BTreeSet<&str> = BTreeSet::new();

        for entry in self.log.iter().filter(|c| c.seq > self.acked_seq && include(c)) {
            let entity = entry.change.entity.as_str();
            let mut merged = entry.clone();
            match entry.change.op {
                ChangeOp::Insert => {
                    inserted.insert(entity);
                }
                ChangeOp::Update if inserted.contains(entity) => {
                    // The peer has not seen the insert yet; keep it an insert
                    merged.change.op = ChangeOp::Insert;
                }
                ChangeOp::Delete => {
                    inserted.remove(entity);
                }
                ChangeOp::Update => {}
            }
            latest.insert(entity, merged);
        }

        let mut changes: Vec<LoggedChange> = latest.into_values().collect();
        changes.sort_by_key(|c| c.seq);
        DeltaSet { changes }
    }

    /// Drop every entry up to and including `cursor`
    pub fn acknowledge(&mut self, cursor: u64) {
        if cursor <= self.acked_seq {
            return;
        }
        self.acked_seq = cursor;
        self.log.retain(|c| c.seq > cursor);
    }

    /// Timestamp of the newest unacknowledged change to `entity`
    pub fn latest_pending(&self, entity: &str) -> Option<TimestampMs> {
        self.log
            .iter()
            .filter(|c| c.change.entity == entity)
            .map(|c| c.change.timestamp)
            .max()
    }

    pub fn pending_len(&self) -> usize {
        self.log.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.log.is_empty()
    }
}

/// Full-snapshot diff: one change per key whose value differs between `before`
/// and `after`, in key order
pub fn diff_snapshots(
    before: &BTreeMap<String, Value>,
    after: &BTreeMap<String, Value>,
    timestamp: TimestampMs,
) -> Vec<DeltaChange> {
    let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    keys.into_iter()
        .filter_map(|key| match (before.get(key), after.get(key)) {
            (None, Some(new)) => Some(DeltaChange::upsert(key.clone(), new.clone(), false, timestamp)),
            (Some(old), Some(new)) if old != new => {
                Some(DeltaChange::upsert(key.clone(), new.clone(), true, timestamp))
            }
            (Some(_), None) => Some(DeltaChange::delete(key.clone(), timestamp)),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MirrorCache;
    use serde_json::json;

    #[test]
    fn changes_since_then_acknowledge_is_quiescent() {
        let mut tracker = DeltaTracker::new();
        tracker.record(DeltaChange::upsert("progress.current_week", json!(2), false, 100));
        tracker.record(DeltaChange::upsert("progress.completed", json!(["w01d1"]), false, 110));

        let since = 50;
        let pending = tracker.pending();
        assert_eq!(tracker.changes_since(since).len(), 2);

        let mut cache = MirrorCache::new();
        for change in tracker.changes_since(since) {
            cache.apply(&change);
        }
        tracker.acknowledge(pending.cursor().unwrap());

        assert!(tracker.changes_since(since).is_empty());
        assert!(tracker.changes_since(120).is_empty());
        assert!(!tracker.has_pending());
    }

    #[test]
    fn coalesces_per_entity_keeping_latest() {
        let mut tracker = DeltaTracker::new();
        tracker.record(DeltaChange::upsert("progress.current_week", json!(1), false, 10));
        tracker.record(DeltaChange::upsert("settings.units", json!("yards"), false, 11));
        tracker.record(DeltaChange::upsert("progress.current_week", json!(2), true, 12));

        let changes = tracker.pending().into_changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].entity, "settings.units");
        assert_eq!(changes[1].entity, "progress.current_week");
        assert_eq!(changes[1].payload, Some(json!(2)));
        assert_eq!(changes[1].op, ChangeOp::Insert);
    }

    #[test]
    fn delete_wins_over_earlier_insert() {
        let mut tracker = DeltaTracker::new();
        tracker.record(DeltaChange::upsert("notes.today", json!("tight hamstring"), false, 1));
        tracker.record(DeltaChange::delete("notes.today", 2));
        let changes = tracker.pending().into_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].op, ChangeOp::Delete);
    }

    #[test]
    fn partial_acknowledge_keeps_the_rest() {
        let mut tracker = DeltaTracker::new();
        let first = tracker.record(DeltaChange::upsert("a", json!(1), false, 1));
        tracker.record(DeltaChange::upsert("b", json!(2), false, 2));
        tracker.acknowledge(first);
        let changes = tracker.pending().into_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].entity, "b");

        // Sequence numbers keep growing after acknowledgement
        let next = tracker.record(DeltaChange::upsert("c", json!(3), false, 3));
        assert!(next > first);
    }

    #[test]
    fn snapshot_diff_covers_insert_update_delete() {
        let before: BTreeMap<String, Value> = [
            ("a".to_string(), json!(1)),
            ("b".to_string(), json!(2)),
        ]
        .into_iter()
        .collect();
        let after: BTreeMap<String, Value> = [
            ("b".to_string(), json!(3)),
            ("c".to_string(), json!(4)),
        ]
        .into_iter()
        .collect();

        let ops: Vec<(String, ChangeOp)> = diff_snapshots(&before, &after, 9)
            .into_iter()
            .map(|c| (c.entity, c.op))
            .collect();
        assert_eq!(
            ops,
            vec![
                ("a".to_string(), ChangeOp::Delete),
                ("b".to_string(), ChangeOp::Update),
                ("c".to_string(), ChangeOp::Insert),
            ]
        );
        assert!(diff_snapshots(&after, &after, 9).is_empty());
    }
}

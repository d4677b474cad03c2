//! Local mirror cache: the last-synced view of the peer's state
//!
//! Changes are applied with last-timestamp-wins per entity and are idempotent by
//! change id, so redelivered or concurrently produced changes converge to the
//! same snapshot regardless of arrival order. Each entry remembers only the
//! change that produced it; a redelivered older change loses on timestamp.

use crate::types::{ChangeOp, DeltaChange, TimestampMs};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// A mirrored entity. Deleted entities are kept as tombstones so an older
/// insert cannot resurrect them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Option<Value>,
    pub updated_at: TimestampMs,
    pub change_id: Uuid,
}

/// Serializable snapshot of the cache
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub entries: BTreeMap<String, CacheEntry>,
    /// Newest change timestamp applied; never regresses
    pub last_update: TimestampMs,
}

/// Outcome of applying a change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The change id was already applied
    Duplicate,
    /// A newer change for the entity is already present
    Superseded,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MirrorCache {
    snapshot: CacheSnapshot,
}

impl MirrorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: CacheSnapshot) -> Self {
        Self { snapshot }
    }

    pub fn snapshot(&self) -> &CacheSnapshot {
        &self.snapshot
    }

    pub fn apply(&mut self, change: &DeltaChange) -> ApplyOutcome {
        if let Some(existing) = self.snapshot.entries.get(&change.entity) {
            if existing.change_id == change.id {
                return ApplyOutcome::Duplicate;
            }
            // Equal timestamps only arise between devices; the change id
            // breaks the tie so every replica agrees
            if (existing.updated_at, existing.change_id) > (change.timestamp, change.id) {
                return ApplyOutcome::Superseded;
            }
        }
        self.snapshot.last_update = self.snapshot.last_update.max(change.timestamp);

        let value = match change.op {
            ChangeOp::Delete => None,
            ChangeOp::Insert | ChangeOp::Update => change.payload.clone(),
        };
        self.snapshot.entries.insert(
            change.entity.clone(),
            CacheEntry {
                value,
                updated_at: change.timestamp,
                change_id: change.id,
            },
        );
        ApplyOutcome::Applied
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.snapshot.entries.get(key).and_then(|e| e.value.as_ref())
    }

    /// Timestamp of the change currently held for `key`, tombstones included
    pub fn updated_at(&self, key: &str) -> Option<TimestampMs> {
        self.snapshot.entries.get(key).map(|e| e.updated_at)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Live (non-deleted) entries
    pub fn values(&self) -> BTreeMap<String, Value> {
        self.snapshot
            .entries
            .iter()
            .filter_map(|(k, e)| e.value.clone().map(|v| (k.clone(), v)))
            .collect()
    }

    pub fn keys_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a String> + 'a {
        self.snapshot
            .entries
            .iter()
            .filter(move |(k, e)| k.starts_with(prefix) && e.value.is_some())
            .map(|(k, _)| k)
    }

    pub fn last_update(&self) -> TimestampMs {
        self.snapshot.last_update
    }

    /// Time since the newest applied change
    pub fn age(&self, now: TimestampMs) -> Duration {
        Duration::from_millis(now.saturating_sub(self.snapshot.last_update))
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn applying_same_change_twice_is_a_noop() {
        let mut cache = MirrorCache::new();
        let change = DeltaChange::upsert("progress.current_week", json!(4), false, 100);

        assert_eq!(cache.apply(&change), ApplyOutcome::Applied);
        let once = cache.clone();
        assert_eq!(cache.apply(&change), ApplyOutcome::Duplicate);
        assert_eq!(cache, once);
    }

    #[test]
    fn older_change_does_not_override_newer() {
        let mut cache = MirrorCache::new();
        let newer = DeltaChange::upsert("progress.current_week", json!(5), true, 200);
        let older = DeltaChange::upsert("progress.current_week", json!(4), true, 100);

        cache.apply(&newer);
        assert_eq!(cache.apply(&older), ApplyOutcome::Superseded);
        assert_eq!(cache.get("progress.current_week"), Some(&json!(5)));
        assert_eq!(cache.last_update(), 200);
    }

    #[test]
    fn application_order_does_not_matter() {
        let a = DeltaChange::upsert("settings.units", json!("yards"), false, 10);
        let b = DeltaChange::upsert("settings.units", json!("meters"), true, 20);
        let c = DeltaChange::delete("notes.today", 15);

        let mut forward = MirrorCache::new();
        for change in [&a, &b, &c] {
            forward.apply(change);
        }
        let mut backward = MirrorCache::new();
        for change in [&c, &b, &a] {
            backward.apply(change);
        }
        assert_eq!(forward.values(), backward.values());
        assert_eq!(forward.get("settings.units"), Some(&json!("meters")));
    }

    #[test]
    fn delete_leaves_a_tombstone() {
        let mut cache = MirrorCache::new();
        cache.apply(&DeltaChange::upsert("session.w01d1", json!({"id": "w01d1"}), false, 10));
        cache.apply(&DeltaChange::delete("session.w01d1", 20));
        assert!(!cache.contains("session.w01d1"));

        let stale_insert = DeltaChange::upsert("session.w01d1", json!({"id": "w01d1"}), false, 15);
        assert_eq!(cache.apply(&stale_insert), ApplyOutcome::Superseded);
        assert!(!cache.contains("session.w01d1"));
    }

    #[test]
    fn redelivered_superseded_change_leaves_no_trace() {
        let mut cache = MirrorCache::new();
        let first = DeltaChange::upsert("progress.current_week", json!(1), false, 100);
        let second = DeltaChange::upsert("progress.current_week", json!(2), true, 101);
        cache.apply(&first);
        cache.apply(&second);
        let settled = cache.clone();

        assert_eq!(cache.apply(&first), ApplyOutcome::Superseded);
        assert_eq!(cache.apply(&second), ApplyOutcome::Duplicate);
        assert_eq!(cache, settled);
        assert_eq!(cache.updated_at("progress.current_week"), Some(101));
        // Only the live entry is retained per key
        assert_eq!(cache.snapshot().entries.len(), 1);
    }

    #[test]
    fn last_update_never_regresses() {
        let mut cache = MirrorCache::new();
        cache.apply(&DeltaChange::upsert("a", json!(1), false, 500));
        cache.apply(&DeltaChange::upsert("b", json!(1), false, 100));
        assert_eq!(cache.last_update(), 500);
        assert_eq!(cache.age(800), Duration::from_millis(300));
    }
}

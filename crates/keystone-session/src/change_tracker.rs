//! Per-attribute change tracking.
//!
//! Baselines are captured lazily: the first time an attribute of an instance
//! is read or written in the current session generation, its persisted value
//! becomes the snapshot. Snapshots are never mutated afterwards except by
//! [`ChangeTracker::rebase`] once a flush has written the attribute.
//!
//! Volatile attributes get neither a snapshot nor a dirty flag. Writes to them
//! are still remembered so the next flush sends them, but they never take part
//! in optimistic guards.

use crate::identity_map::InstanceId;
use keystone_core::{AttributeInfo, Value};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
struct Tracked {
    snapshots: HashMap<&'static str, Value>,
    dirty: HashSet<&'static str>,
    volatile_writes: HashSet<&'static str>,
}

/// Tracks snapshots and dirty flags for every touched attribute.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    entries: HashMap<InstanceId, Tracked>,
}

impl ChangeTracker {
    /// Create a new empty change tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a read of `attr`, capturing `current` as the baseline on first touch.
    pub fn on_read(&mut self, id: InstanceId, attr: &'static AttributeInfo, current: &Value) {
        if !attr.is_tracked() {
            return;
        }
        self.entries
            .entry(id)
            .or_default()
            .snapshots
            .entry(attr.name)
            .or_insert_with(|| current.clone());
    }

    /// Record a write of `attr`. `baseline` is the value held before the write.
    pub fn on_write(&mut self, id: InstanceId, attr: &'static AttributeInfo, baseline: &Value) {
        let tracked = self.entries.entry(id).or_default();
        if !attr.is_tracked() {
            tracked.volatile_writes.insert(attr.name);
            return;
        }
        tracked
            .snapshots
            .entry(attr.name)
            .or_insert_with(|| baseline.clone());
        tracked.dirty.insert(attr.name);
    }

    /// Whether `attr` has been read or written this generation.
    pub fn is_touched(&self, id: InstanceId, attr: &str) -> bool {
        self.entries
            .get(&id)
            .is_some_and(|t| t.snapshots.contains_key(attr))
    }

    /// Touched attribute names, in no particular order.
    pub fn touched(&self, id: InstanceId) -> Vec<&'static str> {
        self.entries
            .get(&id)
            .map(|t| t.snapshots.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Baseline of `attr`, if it has been touched.
    pub fn snapshot(&self, id: InstanceId, attr: &str) -> Option<&Value> {
        self.entries.get(&id).and_then(|t| t.snapshots.get(attr))
    }

    pub fn is_dirty(&self, id: InstanceId, attr: &str) -> bool {
        self.entries.get(&id).is_some_and(|t| t.dirty.contains(attr))
    }

    /// Whether any write (tracked or volatile) is waiting for a flush.
    pub fn has_writes(&self, id: InstanceId) -> bool {
        self.entries
            .get(&id)
            .is_some_and(|t| !t.dirty.is_empty() || !t.volatile_writes.is_empty())
    }

    /// Attributes a flush must send: dirty ones plus volatile writes.
    pub fn pending_writes(&self, id: InstanceId) -> HashSet<&'static str> {
        self.entries
            .get(&id)
            .map(|t| t.dirty.union(&t.volatile_writes).copied().collect())
            .unwrap_or_default()
    }

    /// Start a new generation for `attr` after its value was written to storage.
    pub fn rebase(&mut self, id: InstanceId, attr: &'static AttributeInfo, value: &Value) {
        let Some(tracked) = self.entries.get_mut(&id) else {
            return;
        };
        tracked.dirty.remove(attr.name);
        tracked.volatile_writes.remove(attr.name);
        if attr.is_tracked() {
            tracked.snapshots.insert(attr.name, value.clone());
        }
    }

    /// Drop everything known about one instance.
    pub fn forget(&mut self, id: InstanceId) {
        self.entries.remove(&id);
    }

    /// Number of instances with at least one touched attribute.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

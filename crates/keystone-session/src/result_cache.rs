//! Per-session cache of select results.
//!
//! Entries map a compiled statement shape plus its bound parameters to the
//! instances the select produced. The cache holds instance ids only; the rows
//! themselves live in the identity map. Any write through the session drops
//! every entry, since a cached answer may no longer match the predicate.

use crate::identity_map::InstanceId;
use keystone_core::{Value, hash_values};
use keystone_query::CacheStats;
use std::collections::HashMap;

#[derive(Debug)]
struct Entry {
    params: Vec<Value>,
    results: Vec<InstanceId>,
}

/// Memoized select results for one session generation.
#[derive(Debug, Default)]
pub struct QueryResultCache {
    entries: HashMap<(u64, u64), Vec<Entry>>,
    hits: u64,
    misses: u64,
}

impl QueryResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached results for a statement shape and its parameters.
    pub fn get(&mut self, shape: u64, params: &[Value]) -> Option<Vec<InstanceId>> {
        let found = self
            .entries
            .get(&(shape, hash_values(params)))
            .and_then(|bucket| bucket.iter().find(|e| e.params == params))
            .map(|e| e.results.clone());
        if found.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        found
    }

    pub fn put(&mut self, shape: u64, params: Vec<Value>, results: Vec<InstanceId>) {
        let bucket = self
            .entries
            .entry((shape, hash_values(&params)))
            .or_default();
        match bucket.iter_mut().find(|e| e.params == params) {
            Some(entry) => entry.results = results,
            None => bucket.push(Entry { params, results }),
        }
    }

    /// Drop every entry after a write.
    pub fn invalidate(&mut self) {
        if !self.entries.is_empty() {
            tracing::trace!(entries = self.len(), "query result cache invalidated");
        }
        self.entries.clear();
    }

    /// Drop entries and reset counters.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.hits = 0;
        self.misses = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.len(),
        }
    }
}

//! Statement caching for compiled SQL queries.
//!
//! Two layers live here:
//!
//! - [`StatementCache`], a bounded LRU map from a query-shape hash to SQL text.
//! - [`CompilationCache`], the process-wide singleton wrapping a
//!   `StatementCache` behind a read-mostly lock. It is shared by every session
//!   and is never cleared by session lifecycle events.

use keystone_core::Result;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

/// A cached compiled SQL statement.
#[derive(Debug, Clone)]
pub struct CachedStatement {
    /// The compiled SQL string.
    pub sql: Arc<str>,
    /// Logical clock value of the last access.
    pub last_used: u64,
    /// Number of times this statement has been handed out.
    pub hit_count: u64,
}

/// LRU-style cache for compiled SQL statements.
///
/// Keyed by a `u64` hash that callers compute from their query structure.
/// When the cache exceeds `max_size`, the least-recently-used entry is evicted.
///
/// # Example
///
/// ```
/// use keystone_query::cache::StatementCache;
///
/// let mut cache = StatementCache::new(100);
/// let sql = cache.get_or_insert(12345, || "SELECT \"id\" FROM \"users\"".to_string());
/// assert_eq!(&*sql, "SELECT \"id\" FROM \"users\"");
/// assert!(cache.contains(12345));
/// ```
#[derive(Debug)]
pub struct StatementCache {
    cache: HashMap<u64, CachedStatement>,
    max_size: usize,
    clock: u64,
}

impl StatementCache {
    /// Create a new cache with the given maximum number of entries.
    pub fn new(max_size: usize) -> Self {
        Self {
            cache: HashMap::with_capacity(max_size.min(256)),
            max_size: max_size.max(1),
            clock: 0,
        }
    }

    /// Get a cached statement or compile and insert it.
    ///
    /// The `builder` closure is only called on cache miss.
    pub fn get_or_insert(&mut self, key: u64, builder: impl FnOnce() -> String) -> Arc<str> {
        if !self.cache.contains_key(&key) && self.cache.len() >= self.max_size {
            self.evict_lru();
        }

        self.clock += 1;
        let clock = self.clock;
        let entry = self.cache.entry(key).or_insert_with(|| CachedStatement {
            sql: Arc::from(builder()),
            last_used: clock,
            hit_count: 0,
        });
        entry.last_used = clock;
        entry.hit_count += 1;
        Arc::clone(&entry.sql)
    }

    /// Look up a statement without touching its recency.
    pub fn peek(&self, key: u64) -> Option<Arc<str>> {
        self.cache.get(&key).map(|entry| Arc::clone(&entry.sql))
    }

    /// Check if a statement is cached.
    pub fn contains(&self, key: u64) -> bool {
        self.cache.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Clear all cached statements.
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    fn evict_lru(&mut self) {
        if let Some((&lru_key, _)) = self.cache.iter().min_by_key(|(_, entry)| entry.last_used) {
            self.cache.remove(&lru_key);
        }
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Compute a hash key for caching from any hashable value.
pub fn cache_key(value: &impl Hash) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Hit/miss counters for the compilation cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Process-wide cache of compiled statements keyed by query-shape hash.
#[derive(Debug)]
pub struct CompilationCache {
    statements: RwLock<StatementCache>,
    hits: AtomicU64,
    misses: AtomicU64,
}

static GLOBAL: OnceLock<CompilationCache> = OnceLock::new();

impl CompilationCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            statements: RwLock::new(StatementCache::new(max_size)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// The process-lifetime instance.
    pub fn global() -> &'static CompilationCache {
        GLOBAL.get_or_init(|| CompilationCache::new(4096))
    }

    /// Return the cached SQL for `key`, compiling it on a miss.
    ///
    /// Hits only take the read lock. A miss compiles outside any lock and then
    /// inserts under the write lock; if another thread won the race its text
    /// is kept.
    #[allow(clippy::result_large_err)]
    pub fn get_or_compile(
        &self,
        key: u64,
        compile: impl FnOnce() -> Result<String>,
    ) -> Result<Arc<str>> {
        let cached = self
            .statements
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .peek(key);
        if let Some(sql) = cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(sql);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let sql = compile()?;
        tracing::trace!(key, sql = %sql, "Compiled statement cached");
        let mut guard = self
            .statements
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(guard.get_or_insert(key, || sql))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self
                .statements
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }
}

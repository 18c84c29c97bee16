//! Containment-aware LRU read cache.
//!
//! Entries are keyed by [`PathKey`]. A cached ancestor answers reads for all
//! of its descendants by projection, and a write below a cached ancestor is
//! patched into the ancestor's value instead of being cached separately, so
//! the cache never holds an ancestor and a descendant at the same time.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

use crate::path::PathKey;
use crate::tree;

/// Hit, miss and eviction counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn evict(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.hits() + self.misses()
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    value: Value,
    last_accessed: AtomicU64,
}

/// LRU map from [`PathKey`] to the value stored there.
pub struct ReadCache {
    entries: RwLock<HashMap<PathKey, CacheEntry>>,
    max_entries: usize,
    access_counter: AtomicU64,
    /// Bumped by every write; lets read-through fills detect a racing write.
    generation: AtomicU64,
    stats: Arc<CacheStats>,
}

impl ReadCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
            access_counter: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            stats: Arc::new(CacheStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Current write generation, to be passed to [`ReadCache::fill`].
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn touch(&self, entry: &CacheEntry) {
        let access = self.access_counter.fetch_add(1, Ordering::Relaxed);
        entry.last_accessed.store(access, Ordering::Relaxed);
    }

    /// The cached value at `key`, directly or projected out of a cached
    /// ancestor. `None` is a miss.
    pub fn get(&self, key: &PathKey) -> Option<Value> {
        let entries = self.entries.read();
        let mut candidate = Some(key.clone());
        while let Some(current) = candidate {
            if let Some(entry) = entries.get(&current) {
                self.touch(entry);
                let relative = current.relative_path(key)?;
                return match tree::get_path(&entry.value, &relative) {
                    Some(found) => {
                        self.stats.hit();
                        Some(found.clone())
                    }
                    None => {
                        self.stats.miss();
                        None
                    }
                };
            }
            candidate = current.parent();
        }
        self.stats.miss();
        None
    }

    /// Record that `value` is stored at `key`.
    pub fn set(&self, key: &PathKey, value: Value) {
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.insert_locked(&mut entries, key, value);
    }

    /// Cache a value read from the backend, unless a write happened since
    /// `seen_generation` was taken. Returns whether the value was cached.
    pub fn fill(&self, key: &PathKey, value: Value, seen_generation: u64) -> bool {
        let mut entries = self.entries.write();
        if self.generation.load(Ordering::Acquire) != seen_generation {
            trace!(key = %key, "Skipping stale cache fill");
            return false;
        }
        self.insert_locked(&mut entries, key, value);
        true
    }

    fn insert_locked(&self, entries: &mut HashMap<PathKey, CacheEntry>, key: &PathKey, value: Value) {
        let mut ancestor = key.parent();
        while let Some(current) = ancestor {
            if let Some(entry) = entries.get_mut(&current) {
                let relative = current.relative_path(key).unwrap_or_default();
                if tree::set_path(&mut entry.value, &relative, value).is_ok() {
                    self.touch(entry);
                } else {
                    entries.remove(&current);
                }
                return;
            }
            ancestor = current.parent();
        }

        entries.retain(|cached, _| !key.is_ancestor_of(cached));
        let access = self.access_counter.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            key.clone(),
            CacheEntry {
                value,
                last_accessed: AtomicU64::new(access),
            },
        );
        while entries.len() > self.max_entries {
            if !self.evict_lru(entries) {
                break;
            }
        }
    }

    /// Forget everything at or below `key`.
    pub fn delete(&self, key: &PathKey) {
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        if entries.remove(key).is_none() {
            entries.retain(|cached, _| !key.is_ancestor_of(cached));
        }
        let mut ancestor = key.parent();
        while let Some(current) = ancestor {
            if let Some(entry) = entries.get_mut(&current) {
                if let Some(relative) = current.relative_path(key) {
                    tree::clear_path(&mut entry.value, &relative);
                }
                return;
            }
            ancestor = current.parent();
        }
    }

    /// Drop the entry at `key` and every cached ancestor or descendant of it.
    /// Used when the stored state at `key` is unknown.
    pub fn invalidate(&self, key: &PathKey) {
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let before = entries.len();
        entries.retain(|cached, _| {
            cached != key && !cached.is_ancestor_of(key) && !key.is_ancestor_of(cached)
        });
        trace!(key = %key, dropped = before - entries.len(), "Invalidated cache entries");
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.clear();
    }

    fn evict_lru(&self, entries: &mut HashMap<PathKey, CacheEntry>) -> bool {
        let lru_key = entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_accessed.load(Ordering::Relaxed))
            .map(|(k, _)| k.clone());
        match lru_key {
            Some(key) => {
                entries.remove(&key);
                self.stats.evict();
                trace!(key = %key, "Evicted cache entry");
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for ReadCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadCache")
            .field("entries", &self.len())
            .field("max_entries", &self.max_entries)
            .field("hit_rate", &format!("{:.1}%", self.stats.hit_rate() * 100.0))
            .finish()
    }
}

//! Bounded in-memory cache with time-to-live and oldest-first eviction.
//!
//! Two independent mechanisms keep the cache honest:
//! - `get` checks expiry on read and drops the stale entry it finds.
//! - `sweep_expired` removes every expired entry in one pass and is run by the
//!   periodic sweep purely to reclaim memory.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::clock::{system_clock, Clock};

/// Cache entry with insertion time.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    /// Insertion order, breaks ties between equal timestamps.
    seq: u64,
}

#[derive(Debug)]
struct CacheInner<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    next_seq: u64,
}

/// Generic TTL and capacity bounded key/value store.
///
/// The store never holds more than `max_entries` entries. When a new key arrives
/// at capacity the single entry with the smallest insertion time is evicted.
#[derive(Debug)]
pub struct BoundedCache<K, V> {
    inner: Mutex<CacheInner<K, V>>,
    ttl: Duration,
    max_entries: usize,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    /// Creates a cache with the given TTL and capacity.
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self::with_clock(ttl, max_entries, system_clock())
    }

    /// Creates a cache reading time from `clock`.
    pub fn with_clock(ttl: Duration, max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                next_seq: 0,
            }),
            ttl,
            max_entries: max_entries.max(1),
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, entry: &CacheEntry<V>, now: Instant) -> bool {
        now.saturating_duration_since(entry.inserted_at) > self.ttl
    }

    /// Gets a value from the cache.
    ///
    /// Returns `None` if the key was never inserted or its entry outlived the TTL;
    /// in the latter case the stale entry is removed.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut inner = self.lock();

        let expired = match inner.entries.get(key) {
            Some(entry) if !self.is_expired(entry, now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            inner.entries.remove(key);
            debug!(key = ?key, "Dropped expired cache entry on read");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Inserts or overwrites a value.
    pub fn put(&self, key: K, value: V) {
        let now = self.clock.now();
        let mut inner = self.lock();

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.max_entries {
            Self::evict_oldest(&mut inner);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                seq,
            },
        );
    }

    /// Evicts the oldest entry.
    fn evict_oldest(inner: &mut CacheInner<K, V>) {
        if let Some(oldest_key) = inner
            .entries
            .iter()
            .min_by_key(|(_, entry)| (entry.inserted_at, entry.seq))
            .map(|(k, _)| k.clone())
        {
            inner.entries.remove(&oldest_key);
            debug!(key = ?oldest_key, "Cache full, evicted oldest entry");
        }
    }

    /// Removes a single key, returning its value if present.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.lock().entries.remove(key).map(|entry| entry.value)
    }

    /// Removes all expired entries and returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, entry| now.saturating_duration_since(entry.inserted_at) <= self.ttl);
        let removed = before - inner.entries.len();
        if removed > 0 {
            debug!(removed, "Swept expired cache entries");
        }
        removed
    }

    /// Clears the entire cache.
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Number of stored entries, expired ones included until they are swept.
    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Gets cache statistics.
    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let inner = self.lock();
        let total_entries = inner.entries.len();
        let expired_entries = inner
            .entries
            .values()
            .filter(|entry| self.is_expired(entry, now))
            .count();

        CacheStats {
            total_entries,
            expired_entries,
            active_entries: total_entries - expired_entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Statistics about the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Total number of entries
    pub total_entries: usize,
    /// Number of expired entries not yet removed
    pub expired_entries: usize,
    /// Number of active (non-expired) entries
    pub active_entries: usize,
    /// Reads that returned a value
    pub hits: u64,
    /// Reads that found nothing usable
    pub misses: u64,
}

/// Cache key for LLM analysis results.
///
/// Formatted as `provider:model:<sha256 of the table text>` so identical
/// (provider, model, data) triples always land on the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnalysisKey(String);

impl AnalysisKey {
    pub fn new(provider: &str, model: &str, table_text: &str) -> Self {
        let digest = Sha256::digest(table_text.as_bytes());
        Self(format!("{provider}:{model}:{}", hex::encode(digest)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AnalysisKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn cache_with_clock(ttl_secs: u64, max: usize) -> (BoundedCache<String, String>, Arc<ManualClock>) {
        let clock = ManualClock::shared();
        let cache = BoundedCache::with_clock(Duration::from_secs(ttl_secs), max, clock.clone());
        (cache, clock)
    }

    #[test]
    fn test_cache_basic_operations() {
        let (cache, _clock) = cache_with_clock(60, 10);

        cache.put("test_key".to_string(), "analysis".to_string());
        assert_eq!(cache.get(&"test_key".to_string()), Some("analysis".to_string()));
        assert_eq!(cache.get(&"missing_key".to_string()), None);
    }

    #[test]
    fn test_cache_expiration_is_lazy_on_read() {
        let (cache, clock) = cache_with_clock(60, 10);
        cache.put("k".to_string(), "v".to_string());

        // Exactly at the TTL boundary the entry is still visible.
        clock.advance(Duration::from_secs(60));
        assert_eq!(cache.get(&"k".to_string()), Some("v".to_string()));

        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.size(), 1);
        assert_eq!(cache.get(&"k".to_string()), None);
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_cache_eviction_removes_oldest() {
        let (cache, clock) = cache_with_clock(600, 3);

        for i in 0..5 {
            cache.put(format!("key{i}"), format!("value{i}"));
            clock.advance(Duration::from_secs(1));
        }

        assert_eq!(cache.size(), 3);
        assert_eq!(cache.get(&"key0".to_string()), None);
        assert_eq!(cache.get(&"key1".to_string()), None);
        assert_eq!(cache.get(&"key4".to_string()), Some("value4".to_string()));
    }

    #[test]
    fn test_eviction_ties_use_insertion_order() {
        // Same instant for every insert; the first inserted must go first.
        let (cache, _clock) = cache_with_clock(600, 2);
        cache.put("b".to_string(), "1".to_string());
        cache.put("a".to_string(), "2".to_string());
        cache.put("c".to_string(), "3".to_string());

        assert_eq!(cache.get(&"b".to_string()), None);
        assert!(cache.get(&"a".to_string()).is_some());
        assert!(cache.get(&"c".to_string()).is_some());
    }

    #[test]
    fn test_overwrite_at_capacity_keeps_other_entries() {
        let (cache, _clock) = cache_with_clock(600, 2);
        cache.put("a".to_string(), "1".to_string());
        cache.put("b".to_string(), "2".to_string());
        cache.put("a".to_string(), "3".to_string());

        assert_eq!(cache.size(), 2);
        assert_eq!(cache.get(&"a".to_string()), Some("3".to_string()));
        assert_eq!(cache.get(&"b".to_string()), Some("2".to_string()));
    }

    #[test]
    fn test_sweep_expired_counts_removed_entries() {
        let (cache, clock) = cache_with_clock(10, 10);
        cache.put("old1".to_string(), "x".to_string());
        cache.put("old2".to_string(), "x".to_string());
        clock.advance(Duration::from_secs(8));
        cache.put("fresh".to_string(), "y".to_string());
        clock.advance(Duration::from_secs(5));

        assert_eq!(cache.sweep_expired(), 2);
        assert_eq!(cache.size(), 1);
        assert_eq!(cache.sweep_expired(), 0);
    }

    #[test]
    fn test_cache_stats() {
        let (cache, clock) = cache_with_clock(10, 10);
        cache.put("key1".to_string(), "1".to_string());
        clock.advance(Duration::from_secs(11));
        cache.put("key2".to_string(), "2".to_string());

        let _ = cache.get(&"key2".to_string());
        let _ = cache.get(&"nope".to_string());

        let stats = cache.stats();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.expired_entries, 1);
        assert_eq!(stats.active_entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_clear() {
        let (cache, _clock) = cache_with_clock(60, 10);
        cache.put("k".to_string(), "v".to_string());
        cache.clear();
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_analysis_key_is_stable() {
        let key1 = AnalysisKey::new("openai", "gpt-4", "test data");
        let key2 = AnalysisKey::new("openai", "gpt-4", "test data");
        let key3 = AnalysisKey::new("yandex", "yandexgpt", "test data");

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
        assert!(key1.as_str().starts_with("openai:gpt-4:"));
        // provider:model: + 64 hex chars
        assert_eq!(key1.as_str().len(), "openai:gpt-4:".len() + 64);
    }
}

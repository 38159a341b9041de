//! TTL + LRU cache bounded by entry count and estimated memory.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheSettings;
use crate::metrics;

/// Rough in-memory footprint of a cached key or value.
pub trait EstimateSize {
    fn estimate_size(&self) -> usize;
}

impl EstimateSize for String {
    fn estimate_size(&self) -> usize {
        self.len()
    }
}

impl EstimateSize for Vec<u8> {
    fn estimate_size(&self) -> usize {
        self.len()
    }
}

impl EstimateSize for serde_json::Value {
    fn estimate_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

impl<T: EstimateSize + ?Sized> EstimateSize for Arc<T> {
    fn estimate_size(&self) -> usize {
        (**self).estimate_size()
    }
}

/// Limits and timings of a [`BoundedCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub default_ttl: Duration,
    pub max_entries: usize,
    pub max_memory_bytes: usize,
    /// Minimum time between two sweeps of expired entries.
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from(&CacheSettings::default())
    }
}

impl From<&CacheSettings> for CacheConfig {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            default_ttl: Duration::from_secs(settings.default_ttl_secs),
            max_entries: settings.max_entries,
            max_memory_bytes: settings.max_memory_mb * 1024 * 1024,
            cleanup_interval: Duration::from_secs(settings.cleanup_interval_secs),
        }
    }
}

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    size_bytes: usize,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

struct Inner<K: Hash + Eq, V> {
    entries: LruCache<K, CacheEntry<V>>,
    total_size: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    expired: u64,
    last_cleanup: Instant,
}

impl<K: Hash + Eq + Clone, V> Inner<K, V> {
    fn remove(&mut self, key: &K) -> Option<CacheEntry<V>> {
        let entry = self.entries.pop(key)?;
        self.total_size -= entry.size_bytes;
        Some(entry)
    }

    fn evict_lru(&mut self) -> bool {
        match self.entries.pop_lru() {
            Some((_, entry)) => {
                self.total_size -= entry.size_bytes;
                self.evictions += 1;
                true
            }
            None => false,
        }
    }

    fn sweep_expired(&mut self, now: Instant) -> usize {
        let expired_keys: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired_keys {
            self.remove(key);
        }
        self.expired += expired_keys.len() as u64;
        self.last_cleanup = now;
        expired_keys.len()
    }
}

/// Snapshot of a cache's size and counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub memory_bytes: usize,
    pub max_entries: usize,
    pub max_memory_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
    pub hit_rate_pct: f64,
}

/// Generic key/value cache with TTL expiry and LRU eviction.
///
/// Both the entry count and the summed entry size are bounded; whichever limit
/// is exceeded, the least recently used entry goes first. All operations take a
/// single lock, so two separate calls are never atomic together.
pub struct BoundedCache<K: Hash + Eq, V> {
    name: String,
    config: CacheConfig,
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> BoundedCache<K, V>
where
    K: Hash + Eq + Clone + EstimateSize,
    V: Clone + EstimateSize,
{
    pub fn new(name: impl Into<String>, config: CacheConfig) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                total_size: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                expired: 0,
                last_cleanup: Instant::now(),
            }),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a live entry, promoting it to most recently used.
    pub async fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        self.maybe_sweep(&mut inner, now);

        match inner.entries.peek(key).map(|entry| entry.is_expired(now)) {
            None => {
                inner.misses += 1;
                metrics::record_cache_lookup(&self.name, false);
                None
            }
            Some(true) => {
                inner.remove(key);
                inner.misses += 1;
                inner.expired += 1;
                metrics::record_cache_lookup(&self.name, false);
                None
            }
            Some(false) => {
                inner.hits += 1;
                metrics::record_cache_lookup(&self.name, true);
                inner.entries.get(key).map(|entry| entry.value.clone())
            }
        }
    }

    /// Insert with the default TTL.
    pub async fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, self.config.default_ttl).await
    }

    pub async fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let now = Instant::now();
        let size_bytes = key.estimate_size() + value.estimate_size();
        let mut inner = self.inner.lock().await;
        self.maybe_sweep(&mut inner, now);

        let entry = CacheEntry {
            value,
            expires_at: now + ttl,
            size_bytes,
        };
        if let Some(old) = inner.entries.put(key, entry) {
            inner.total_size -= old.size_bytes;
        }
        inner.total_size += size_bytes;

        while inner.entries.len() > self.config.max_entries {
            inner.evict_lru();
        }
        while inner.total_size > self.config.max_memory_bytes {
            if !inner.evict_lru() {
                break;
            }
        }
    }

    /// Remove one entry. Returns true if it was present.
    pub async fn delete(&self, key: &K) -> bool {
        let mut inner = self.inner.lock().await;
        inner.remove(key).is_some()
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.entries.clear();
        inner.total_size = 0;
    }

    /// Number of physically stored entries, expired ones included until swept.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove every expired entry now, regardless of the cleanup interval.
    pub async fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.sweep_expired(Instant::now())
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        let lookups = inner.hits + inner.misses;
        let hit_rate_pct = if lookups == 0 {
            0.0
        } else {
            inner.hits as f64 * 100.0 / lookups as f64
        };
        CacheStats {
            entries: inner.entries.len(),
            memory_bytes: inner.total_size,
            max_entries: self.config.max_entries,
            max_memory_bytes: self.config.max_memory_bytes,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expired: inner.expired,
            hit_rate_pct,
        }
    }

    /// Return the cached value or load, cache and return it.
    ///
    /// The lock is not held while `load` runs, so concurrent callers missing on
    /// the same key may each load it; the last write wins. Errors are not cached.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: K, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key).await {
            return Ok(value);
        }
        let value = load().await?;
        self.set(key, value.clone()).await;
        Ok(value)
    }

    fn maybe_sweep(&self, inner: &mut Inner<K, V>, now: Instant) {
        if now.duration_since(inner.last_cleanup) < self.config.cleanup_interval {
            return;
        }
        let removed = inner.sweep_expired(now);
        if removed > 0 {
            debug!("Cache {} swept {} expired entries", self.name, removed);
        }
    }
}

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries.
    pub max_size: usize,
    /// Byte budget across all entries (JSON-length estimate).
    pub max_memory_bytes: usize,
    /// TTL applied when `set` is called without an explicit one.
    pub default_ttl: Duration,
    /// Cadence of the background expiry sweep.
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1_000,
            max_memory_bytes: 16 * 1024 * 1024,
            default_ttl: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

struct Entry<V> {
    value: V,
    created_at: Instant,
    last_accessed: Instant,
    access_count: u64,
    ttl: Duration,
    size_bytes: usize,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= self.ttl
    }
}

struct Inner<V> {
    map: LruCache<String, Entry<V>>,
    mem_bytes: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
    access_time_ns: AtomicU64,
    accesses: AtomicU64,
}

/// Point-in-time view of a cache's statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub name: String,
    pub len: usize,
    pub memory_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub expired: u64,
    pub avg_access_time_us: f64,
}

/// Metadata handed to the background refresher; values are not cloned.
#[derive(Debug, Clone)]
pub struct RefreshCandidate {
    pub key: String,
    pub ttl: Duration,
    pub access_count: u64,
    pub recently_accessed: bool,
}

/// Bounded LRU + TTL store.
///
/// Recency order is kept by the hash-indexed doubly linked list inside
/// [`lru::LruCache`], so get/set/evict are O(1). Expiry is checked
/// lazily on read; [`MemoryCache::sweep_expired`] reclaims the rest on
/// an interval owned by the caller.
pub struct MemoryCache<V> {
    name: String,
    cfg: CacheConfig,
    inner: Mutex<Inner<V>>,
    counters: Counters,
}

impl<V: Clone + Serialize> MemoryCache<V> {
    pub fn new(name: impl Into<String>, cfg: CacheConfig) -> Self {
        let cap = NonZeroUsize::new(cfg.max_size).unwrap_or(NonZeroUsize::MIN);

        Self {
            name: name.into(),
            cfg,
            inner: Mutex::new(Inner {
                map: LruCache::new(cap),
                mem_bytes: 0,
            }),
            counters: Counters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.cfg.cleanup_interval
    }

    /// Read a value, promoting it to most-recently-used.
    ///
    /// An entry past its TTL is removed and reported as a miss; stale
    /// values are never served.
    pub fn get(&self, key: &str) -> Option<V> {
        let start = Instant::now();
        let now = start;

        let out = {
            let mut inner = self.inner.lock();

            let expired_size = match inner.map.peek(key) {
                Some(entry) if entry.is_expired(now) => Some(entry.size_bytes),
                _ => None,
            };

            if let Some(size) = expired_size {
                inner.map.pop(key);
                inner.mem_bytes -= size;
                self.counters.expired.fetch_add(1, Ordering::Relaxed);
                None
            } else {
                match inner.map.get_mut(key) {
                    Some(entry) => {
                        entry.last_accessed = now;
                        entry.access_count += 1;
                        Some(entry.value.clone())
                    }
                    None => None,
                }
            }
        };

        match &out {
            Some(_) => self.counters.hits.fetch_add(1, Ordering::Relaxed),
            None => self.counters.misses.fetch_add(1, Ordering::Relaxed),
        };

        self.counters
            .access_time_ns
            .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        self.counters.accesses.fetch_add(1, Ordering::Relaxed);

        out
    }

    /// Insert or replace a value.
    ///
    /// Returns `false` when the entry can never fit the byte budget;
    /// otherwise evicts from the LRU tail until both the entry-count and
    /// byte limits hold.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> bool {
        let size_bytes = serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(0);

        if size_bytes > self.cfg.max_memory_bytes {
            tracing::warn!(
                cache = %self.name,
                key,
                size_bytes,
                budget = self.cfg.max_memory_bytes,
                "entry larger than the whole cache budget; not inserted"
            );
            return false;
        }

        let now = Instant::now();
        let entry = Entry {
            value,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            ttl: ttl.unwrap_or(self.cfg.default_ttl),
            size_bytes,
        };

        let mut inner = self.inner.lock();

        if let Some(old) = inner.map.pop(key) {
            inner.mem_bytes -= old.size_bytes;
        }

        while inner.map.len() >= self.cfg.max_size
            || inner.mem_bytes + size_bytes > self.cfg.max_memory_bytes
        {
            let Some((_, victim)) = inner.map.pop_lru() else {
                break;
            };
            inner.mem_bytes -= victim.size_bytes;
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }

        inner.map.put(key.to_string(), entry);
        inner.mem_bytes += size_bytes;
        self.counters.sets.fetch_add(1, Ordering::Relaxed);

        true
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();

        match inner.map.pop(key) {
            Some(entry) => {
                inner.mem_bytes -= entry.size_bytes;
                self.counters.deletes.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.map.len();
        inner.map.clear();
        inner.mem_bytes = 0;
        self.counters.deletes.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    /// Delete every key the pattern matches. Returns the count.
    pub fn invalidate_pattern(&self, pattern: &Regex) -> usize {
        let mut inner = self.inner.lock();

        let victims: Vec<String> = inner
            .map
            .iter()
            .filter(|(k, _)| pattern.is_match(k))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &victims {
            if let Some(entry) = inner.map.pop(key) {
                inner.mem_bytes -= entry.size_bytes;
            }
        }

        self.counters
            .deletes
            .fetch_add(victims.len() as u64, Ordering::Relaxed);

        victims.len()
    }

    /// Evict everything past its TTL. Returns the count.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let victims: Vec<String> = inner
            .map
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &victims {
            if let Some(entry) = inner.map.pop(key) {
                inner.mem_bytes -= entry.size_bytes;
            }
        }

        self.counters
            .expired
            .fetch_add(victims.len() as u64, Ordering::Relaxed);

        victims.len()
    }

    /// Entries whose age has crossed `threshold` of their TTL.
    pub fn refresh_candidates(
        &self,
        threshold: f64,
        recent_window: Duration,
    ) -> Vec<RefreshCandidate> {
        let now = Instant::now();
        let inner = self.inner.lock();

        inner
            .map
            .iter()
            .filter_map(|(key, e)| {
                let age = now.duration_since(e.created_at);
                let ratio = age.as_secs_f64() / e.ttl.as_secs_f64().max(f64::EPSILON);
                if ratio < threshold {
                    return None;
                }

                Some(RefreshCandidate {
                    key: key.clone(),
                    ttl: e.ttl,
                    access_count: e.access_count,
                    recently_accessed: now.duration_since(e.last_accessed) <= recent_window,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memory_bytes(&self) -> usize {
        self.inner.lock().mem_bytes
    }

    pub fn stats(&self) -> CacheStats {
        let (len, memory_bytes) = {
            let inner = self.inner.lock();
            (inner.map.len(), inner.mem_bytes)
        };

        let accesses = self.counters.accesses.load(Ordering::Relaxed);
        let avg_access_time_us = if accesses == 0 {
            0.0
        } else {
            self.counters.access_time_ns.load(Ordering::Relaxed) as f64 / accesses as f64 / 1_000.0
        };

        CacheStats {
            name: self.name.clone(),
            len,
            memory_bytes,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            avg_access_time_us,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{Value, json};

    fn small_cache(max_size: usize) -> MemoryCache<Value> {
        MemoryCache::new(
            "test",
            CacheConfig {
                max_size,
                max_memory_bytes: 1024 * 1024,
                default_ttl: Duration::from_secs(60),
                cleanup_interval: Duration::from_secs(60),
            },
        )
    }

    #[test]
    fn lru_keeps_the_most_recent_inserts() {
        let cache = small_cache(3);

        for i in 0..5 {
            assert!(cache.set(&format!("k{i}"), json!(i), None));
        }

        assert!(cache.get("k0").is_none());
        assert!(cache.get("k1").is_none());
        for i in 2..5 {
            assert_eq!(cache.get(&format!("k{i}")), Some(json!(i)));
        }
    }

    #[test]
    fn get_promotes_to_most_recent() {
        let cache = small_cache(2);

        cache.set("a", json!(1), None);
        cache.set("b", json!(2), None);

        // Touch "a" so "b" becomes the LRU victim.
        assert!(cache.get("a").is_some());
        cache.set("c", json!(3), None);

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn expired_entries_miss_and_are_removed() {
        let cache = small_cache(10);

        cache.set("k", json!("v"), Some(Duration::from_millis(50)));
        assert_eq!(cache.get("k"), Some(json!("v")));

        std::thread::sleep(Duration::from_millis(80));

        assert!(cache.get("k").is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.memory_bytes(), 0);
    }

    #[test]
    fn sweep_reclaims_expired_entries() {
        let cache = small_cache(10);

        cache.set("short", json!("x"), Some(Duration::from_millis(5)));
        cache.set("long", json!("y"), Some(Duration::from_secs(60)));

        std::thread::sleep(Duration::from_millis(15));

        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("long").is_some());
    }

    #[test]
    fn memory_cap_evicts_from_the_tail() {
        let cache = MemoryCache::new(
            "test",
            CacheConfig {
                max_size: 100,
                // Roughly three of the ~20-byte payloads below.
                max_memory_bytes: 70,
                default_ttl: Duration::from_secs(60),
                cleanup_interval: Duration::from_secs(60),
            },
        );

        let payload = |i: usize| json!({ "data": format!("padding-{i}") });

        for i in 0..5 {
            assert!(cache.set(&format!("k{i}"), payload(i), None));
        }

        assert!(cache.len() < 5);
        assert!(cache.memory_bytes() <= 70);
        // The most recent insert always survives.
        assert!(cache.get("k4").is_some());
        assert!(cache.get("k0").is_none());
    }

    #[test]
    fn oversized_entry_is_refused() {
        let cache = MemoryCache::new(
            "test",
            CacheConfig {
                max_size: 10,
                max_memory_bytes: 8,
                default_ttl: Duration::from_secs(60),
                cleanup_interval: Duration::from_secs(60),
            },
        );

        cache.set("small", json!(1), None);
        assert!(!cache.set("big", json!("far-too-large-to-ever-fit"), None));

        // The refused insert evicted nothing.
        assert_eq!(cache.get("small"), Some(json!(1)));
    }

    #[test]
    fn replacing_a_key_adjusts_the_byte_count() {
        let cache = small_cache(10);

        cache.set("k", json!("aaaaaaaaaa"), None);
        let before = cache.memory_bytes();

        cache.set("k", json!("a"), None);
        assert!(cache.memory_bytes() < before);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn pattern_invalidation_counts_matches() {
        let cache = small_cache(10);

        cache.set("dashboard:u1:overview", json!(1), None);
        cache.set("dashboard:u1:leads", json!(2), None);
        cache.set("dashboard:u2:overview", json!(3), None);

        let re = Regex::new("^dashboard:u1:").unwrap();
        assert_eq!(cache.invalidate_pattern(&re), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("dashboard:u2:overview").is_some());
    }

    #[test]
    fn stats_track_the_basics() {
        let cache = small_cache(2);

        cache.set("a", json!(1), None);
        cache.set("b", json!(2), None);
        cache.set("c", json!(3), None); // evicts "a"

        cache.get("b");
        cache.get("missing");
        cache.delete("c");

        let stats = cache.stats();
        assert_eq!(stats.sets, 3);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.deletes, 1);
        assert_eq!(stats.len, 1);
    }

    proptest! {
        /// After k distinct inserts with no interleaved gets, the cache
        /// retains exactly the last `max_size` keys.
        #[test]
        fn retained_keys_are_the_most_recent(max_size in 1usize..16, total in 1usize..64) {
            let cache = small_cache(max_size);

            for i in 0..total {
                let key = format!("k{}", i);
                prop_assert!(cache.set(&key, json!(i), None));
            }

            let start = total.saturating_sub(max_size);
            prop_assert_eq!(cache.len(), total - start);

            for i in 0..total {
                let present = cache.get(&format!("k{i}")).is_some();
                prop_assert_eq!(present, i >= start);
            }
        }
    }
}

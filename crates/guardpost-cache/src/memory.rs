//! Bounded in-memory LRU cache with TTL.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use guardpost_core::verdict::ScanVerdict;
use lru::LruCache;
use parking_lot::Mutex;

use crate::{content_hash, ScanKind};

struct Entry {
    verdict: ScanVerdict,
    stored_at: Instant,
}

/// LRU verdict cache. Expired entries are evicted on access and counted as
/// misses; insertion past the bound evicts the least-recently-used entry.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, Entry>>,
    ttl: Duration,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryCache {
    pub fn new(max_size: usize, ttl_seconds: u64) -> Self {
        let capacity = NonZeroUsize::new(max_size.max(1)).expect("max(1) is non-zero");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: Duration::from_secs(ttl_seconds),
            max_size: max_size.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, kind: ScanKind, text: &str) -> Option<ScanVerdict> {
        let key = content_hash(kind, text);
        let mut entries = self.entries.lock();

        enum Lookup {
            Hit(ScanVerdict),
            Expired,
            Miss,
        }
        let lookup = match entries.get(&key) {
            Some(entry) if entry.stored_at.elapsed() <= self.ttl => {
                Lookup::Hit(entry.verdict.clone())
            }
            Some(_) => Lookup::Expired,
            None => Lookup::Miss,
        };

        match lookup {
            Lookup::Hit(verdict) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(verdict)
            }
            Lookup::Expired => {
                entries.pop(&key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %&key[..16], "cache entry expired");
                None
            }
            Lookup::Miss => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, kind: ScanKind, text: &str, verdict: &ScanVerdict) {
        let key = content_hash(kind, text);
        self.entries.lock().put(
            key,
            Entry {
                verdict: verdict.clone(),
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.stored_at.elapsed() > self.ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "cleaned up expired cache entries");
        }
        expired.len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> serde_json::Value {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64 * 100.0 * 100.0).round() / 100.0
        } else {
            0.0
        };
        serde_json::json!({
            "backend": "memory",
            "size": self.len(),
            "max_size": self.max_size,
            "hits": hits,
            "misses": misses,
            "hit_rate": hit_rate,
            "ttl_seconds": self.ttl.as_secs(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(text: &str) -> ScanVerdict {
        ScanVerdict::pass_through(text)
    }

    #[test]
    fn round_trip_within_ttl() {
        let cache = MemoryCache::new(10, 3600);
        cache.put(ScanKind::Input, "prompt", &verdict("prompt"));
        let got = cache.get(ScanKind::Input, "prompt").unwrap();
        assert_eq!(got.sanitized, "prompt");
    }

    #[test]
    fn expired_entries_count_as_misses() {
        let cache = MemoryCache::new(10, 0);
        cache.put(ScanKind::Input, "prompt", &verdict("prompt"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(ScanKind::Input, "prompt").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let cache = MemoryCache::new(2, 3600);
        cache.put(ScanKind::Input, "a", &verdict("a"));
        cache.put(ScanKind::Input, "b", &verdict("b"));
        // Touch "a" so "b" is the eviction candidate.
        cache.get(ScanKind::Input, "a");
        cache.put(ScanKind::Input, "c", &verdict("c"));

        assert!(cache.get(ScanKind::Input, "a").is_some());
        assert!(cache.get(ScanKind::Input, "b").is_none());
        assert!(cache.get(ScanKind::Input, "c").is_some());
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let cache = MemoryCache::new(10, 3600);
        cache.put(ScanKind::Input, "a", &verdict("a"));
        cache.get(ScanKind::Input, "a");
        cache.get(ScanKind::Input, "missing");

        let stats = cache.stats();
        assert_eq!(stats["hits"], 1);
        assert_eq!(stats["misses"], 1);
        assert_eq!(stats["hit_rate"], 50.0);
    }

    #[test]
    fn cleanup_removes_only_expired() {
        let cache = MemoryCache::new(10, 0);
        cache.put(ScanKind::Input, "old", &verdict("old"));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.cleanup_expired(), 1);
        assert!(cache.is_empty());
    }
}

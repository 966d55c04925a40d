//! Redis-backed distributed verdict cache with single-flight deduplication.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use guardpost_core::verdict::ScanVerdict;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::{namespaced_key, CacheError, MemoryCache, ScanKind};

/// Initial poll interval while waiting on another worker's computation.
const DEDUP_BACKOFF_START: Duration = Duration::from_millis(50);
/// Poll interval cap.
const DEDUP_BACKOFF_CAP: Duration = Duration::from_millis(500);

/// Verdict cache over a Redis connection pool.
///
/// Every operation falls back to the embedded in-memory cache on error;
/// callers never see a Redis failure, only a miss.
pub struct DistributedCache {
    manager: ConnectionManager,
    ttl: u64,
    fallback: MemoryCache,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl DistributedCache {
    /// Connect and verify the server responds to PING.
    pub async fn connect(
        url: &str,
        ttl_seconds: u64,
        fallback_max_size: usize,
    ) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;

        let mut conn = manager.clone();
        let _: () = redis::cmd("PING").query_async(&mut conn).await?;
        tracing::info!("redis verdict cache connected");

        Ok(Self {
            manager,
            ttl: ttl_seconds,
            fallback: MemoryCache::new(fallback_max_size, ttl_seconds),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        })
    }

    pub async fn get(&self, kind: ScanKind, text: &str) -> Option<ScanVerdict> {
        let key = namespaced_key(kind, text);
        let mut conn = self.manager.clone();

        let raw: Result<Option<String>, _> = conn.get(&key).await;
        match raw {
            Ok(Some(json)) => match serde_json::from_str::<ScanVerdict>(&json) {
                Ok(verdict) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key = %&key[..32.min(key.len())], "redis cache hit");
                    Some(verdict)
                }
                Err(err) => {
                    // A corrupted value is worse than a miss; drop it.
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %err, "discarding undeserializable cache value");
                    let _: Result<(), _> = conn.del(&key).await;
                    None
                }
            },
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(err) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %err, "redis get failed, trying fallback");
                self.fallback.get(kind, text)
            }
        }
    }

    pub async fn put(&self, kind: ScanKind, text: &str, verdict: &ScanVerdict) {
        let key = namespaced_key(kind, text);
        let json = match serde_json::to_string(verdict) {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!(error = %err, "could not serialize verdict for caching");
                return;
            }
        };

        let mut conn = self.manager.clone();
        let result: Result<(), _> = conn.set_ex(&key, json, self.ttl).await;
        if let Err(err) = result {
            self.errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %err, "redis set failed, writing to fallback");
            self.fallback.put(kind, text, verdict);
        }
    }

    /// Single-flight gate across workers sharing this Redis.
    ///
    /// Attempts to take a short-lived lock on the key. If another worker
    /// holds it, polls (exponential backoff, capped) for the cached value
    /// for up to `wait_timeout`, then gives up and lets the caller compute
    /// anyway. Returns the cached verdict when one appears.
    pub async fn deduplicate(
        &self,
        kind: ScanKind,
        text: &str,
        wait_timeout: Duration,
    ) -> Option<ScanVerdict> {
        if let Some(cached) = self.get(kind, text).await {
            return Some(cached);
        }

        let lock_key = format!("{}:lock", namespaced_key(kind, text));
        let lock_ttl = wait_timeout.as_secs().max(1);
        let mut conn = self.manager.clone();

        let acquired: Result<Option<String>, _> = redis::cmd("SET")
            .arg(&lock_key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(lock_ttl)
            .query_async(&mut conn)
            .await;

        match acquired {
            Ok(Some(_)) => {
                tracing::debug!("single-flight lock acquired, caller computes");
                None
            }
            Ok(None) => {
                tracing::debug!("another worker is scanning this content, waiting");
                let mut waited = Duration::ZERO;
                let mut backoff = DEDUP_BACKOFF_START;
                while waited < wait_timeout {
                    tokio::time::sleep(backoff).await;
                    waited += backoff;
                    if let Some(cached) = self.get(kind, text).await {
                        tracing::debug!(waited_ms = waited.as_millis() as u64, "got result from peer");
                        return Some(cached);
                    }
                    backoff = (backoff.mul_f32(1.5)).min(DEDUP_BACKOFF_CAP);
                }
                tracing::warn!("single-flight wait timed out, computing locally");
                None
            }
            Err(err) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %err, "single-flight lock failed, computing locally");
                None
            }
        }
    }

    /// Release the single-flight lock after the computed value was stored.
    pub async fn release(&self, kind: ScanKind, text: &str) {
        let lock_key = format!("{}:lock", namespaced_key(kind, text));
        let mut conn = self.manager.clone();
        let result: Result<(), _> = conn.del(&lock_key).await;
        if let Err(err) = result {
            tracing::debug!(error = %err, "releasing single-flight lock failed");
        }
    }

    pub async fn ping(&self) -> bool {
        let mut conn = self.manager.clone();
        let result: Result<(), _> = redis::cmd("PING").query_async(&mut conn).await;
        result.is_ok()
    }

    /// Delete every key under the guardpost namespace.
    pub async fn clear(&self) {
        let mut conn = self.manager.clone();
        let pattern = format!("{}:*", crate::KEY_PREFIX);
        let mut cursor: u64 = 0;
        let mut deleted = 0usize;
        loop {
            let scanned: Result<(u64, Vec<String>), _> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await;
            match scanned {
                Ok((next, keys)) => {
                    if !keys.is_empty() {
                        deleted += keys.len();
                        let _: Result<(), _> = conn.del(keys).await;
                    }
                    if next == 0 {
                        break;
                    }
                    cursor = next;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "redis clear aborted");
                    break;
                }
            }
        }
        self.fallback.clear();
        tracing::info!(deleted, "cleared distributed verdict cache");
    }

    pub async fn stats(&self) -> serde_json::Value {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64 * 100.0 * 100.0).round() / 100.0
        } else {
            0.0
        };
        serde_json::json!({
            "backend": "distributed",
            "hits": hits,
            "misses": misses,
            "errors": self.errors.load(Ordering::Relaxed),
            "hit_rate": hit_rate,
            "ttl_seconds": self.ttl,
            "connected": self.ping().await,
            "fallback": self.fallback.stats(),
        })
    }
}

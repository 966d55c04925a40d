//! Content-addressed cache for scan verdicts.
//!
//! Two backends share one contract: an in-memory LRU with TTL and a Redis
//! distributed cache (with the LRU as silent fallback). Keys are SHA-256
//! hashes of the scanned text namespaced by scan kind; values are the
//! JSON-serialized verdict. Cache failures are never fatal — every error
//! path degrades to a miss.

pub mod distributed;
pub mod memory;

use guardpost_core::config::{CacheBackendKind, ProxyConfig};
use guardpost_core::verdict::ScanVerdict;
use sha2::{Digest, Sha256};

pub use distributed::DistributedCache;
pub use memory::MemoryCache;

/// Which pipeline produced (or will produce) the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKind {
    Input,
    Output,
}

impl ScanKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanKind::Input => "input",
            ScanKind::Output => "output",
        }
    }
}

/// Key namespace prefix for the distributed backend.
pub const KEY_PREFIX: &str = "guardpost";

/// SHA-256 over `kind:text`, hex-encoded.
///
/// Hashing the namespaced text keeps input and output verdicts for the same
/// string distinct and avoids storing raw prompts as keys.
pub fn content_hash(kind: ScanKind, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Full key as stored in the distributed backend.
pub fn namespaced_key(kind: ScanKind, text: &str) -> String {
    format!("{}:{}:{}", KEY_PREFIX, kind.as_str(), content_hash(kind, text))
}

/// Cache backend failure. Callers treat any error as a miss.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

enum Backend {
    Memory(MemoryCache),
    Distributed(DistributedCache),
}

/// Front door over the configured cache backend.
pub struct VerdictCache {
    backend: Backend,
}

impl VerdictCache {
    /// Build the cache selected by configuration, or `None` when caching is
    /// disabled. `auto` resolves to the distributed backend when a Redis URL
    /// is configured and reachable, else the in-memory LRU; a configured but
    /// unreachable Redis degrades to memory with a warning.
    pub async fn from_config(config: &ProxyConfig) -> Option<Self> {
        if !config.cache_enabled {
            tracing::info!("verdict caching disabled");
            return None;
        }

        let want_distributed = match config.cache_backend {
            CacheBackendKind::Memory => false,
            CacheBackendKind::Distributed => true,
            CacheBackendKind::Auto => config.redis_url.is_some(),
        };

        let backend = if want_distributed {
            match config.redis_url.as_deref() {
                Some(url) => {
                    match DistributedCache::connect(url, config.cache_ttl, config.cache_max_size)
                        .await
                    {
                        Ok(cache) => {
                            tracing::info!("verdict cache using distributed backend");
                            Backend::Distributed(cache)
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "redis unavailable, falling back to in-memory cache");
                            Backend::Memory(MemoryCache::new(
                                config.cache_max_size,
                                config.cache_ttl,
                            ))
                        }
                    }
                }
                None => {
                    tracing::warn!("distributed cache requested without redis_url, using memory");
                    Backend::Memory(MemoryCache::new(config.cache_max_size, config.cache_ttl))
                }
            }
        } else {
            tracing::info!(
                max_size = config.cache_max_size,
                ttl = config.cache_ttl,
                "verdict cache using in-memory backend"
            );
            Backend::Memory(MemoryCache::new(config.cache_max_size, config.cache_ttl))
        };

        Some(Self { backend })
    }

    /// A memory-backed cache, mainly for tests and embedders.
    pub fn in_memory(max_size: usize, ttl_seconds: u64) -> Self {
        Self {
            backend: Backend::Memory(MemoryCache::new(max_size, ttl_seconds)),
        }
    }

    /// Look up a cached verdict. Errors and expiry count as misses.
    pub async fn get(&self, kind: ScanKind, text: &str) -> Option<ScanVerdict> {
        match &self.backend {
            Backend::Memory(cache) => cache.get(kind, text),
            Backend::Distributed(cache) => cache.get(kind, text).await,
        }
    }

    /// Store a verdict. Failures are logged and swallowed.
    pub async fn put(&self, kind: ScanKind, text: &str, verdict: &ScanVerdict) {
        match &self.backend {
            Backend::Memory(cache) => cache.put(kind, text, verdict),
            Backend::Distributed(cache) => cache.put(kind, text, verdict).await,
        }
    }

    /// Single-flight gate for one cache key.
    ///
    /// Returns the cached verdict if some worker produced it while we
    /// waited; `None` means the caller holds the computation slot and should
    /// scan, then `put` and `release`. The in-memory backend has no
    /// cross-worker races, so it always grants the slot.
    pub async fn deduplicate(
        &self,
        kind: ScanKind,
        text: &str,
        wait_timeout: std::time::Duration,
    ) -> Option<ScanVerdict> {
        match &self.backend {
            Backend::Memory(cache) => cache.get(kind, text),
            Backend::Distributed(cache) => cache.deduplicate(kind, text, wait_timeout).await,
        }
    }

    /// Release the single-flight slot taken via [`deduplicate`](Self::deduplicate).
    pub async fn release(&self, kind: ScanKind, text: &str) {
        if let Backend::Distributed(cache) = &self.backend {
            cache.release(kind, text).await;
        }
    }

    pub async fn stats(&self) -> serde_json::Value {
        match &self.backend {
            Backend::Memory(cache) => cache.stats(),
            Backend::Distributed(cache) => cache.stats().await,
        }
    }

    pub async fn healthy(&self) -> bool {
        match &self.backend {
            Backend::Memory(_) => true,
            Backend::Distributed(cache) => cache.ping().await,
        }
    }

    pub async fn clear(&self) {
        match &self.backend {
            Backend::Memory(cache) => cache.clear(),
            Backend::Distributed(cache) => cache.clear().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_are_namespaced_by_kind() {
        let input = content_hash(ScanKind::Input, "hello");
        let output = content_hash(ScanKind::Output, "hello");
        assert_ne!(input, output);
        assert_eq!(input.len(), 64);
    }

    #[test]
    fn namespaced_key_shape() {
        let key = namespaced_key(ScanKind::Input, "hello");
        assert!(key.starts_with("guardpost:input:"));
        assert_eq!(key.len(), "guardpost:input:".len() + 64);
    }

    #[tokio::test]
    async fn disabled_config_yields_no_cache() {
        let mut config = guardpost_core::ProxyConfig::default();
        config.cache_enabled = false;
        assert!(VerdictCache::from_config(&config).await.is_none());
    }

    #[tokio::test]
    async fn memory_round_trip_through_front() {
        let cache = VerdictCache::in_memory(10, 60);
        let verdict = ScanVerdict::pass_through("hello");
        cache.put(ScanKind::Input, "hello", &verdict).await;

        let cached = cache.get(ScanKind::Input, "hello").await.unwrap();
        assert!(cached.allowed);
        assert_eq!(cached.sanitized, "hello");

        // Output namespace is distinct.
        assert!(cache.get(ScanKind::Output, "hello").await.is_none());
    }
}

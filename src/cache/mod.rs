//! # Two-Tier Cache Layer
//!
//! Keyed wrapper used by metadata reads: an optional remote KV tier
//! (redis) consulted first, backed by a bounded in-memory tier with TTL
//! eviction. Keys are hierarchical, ':'-delimited; pattern deletion
//! supports a trailing `*` prefix match only.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bounded in-memory tier.
pub mod memory;

pub use memory::MemoryCache;

use crate::metrics::{CACHE_HIT_TOTAL, CACHE_MISS_TOTAL, SharedMetrics};

/// Errors from the cache layer. Remote-tier failures are soft: the service
/// logs and falls through to memory, so these mostly surface from explicit
/// remote operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("remote cache error: {0}")]
    Remote(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        Self::Remote(e.to_string())
    }
}

/// Remote key-value tier contract.
#[async_trait]
pub trait RemoteKv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    /// Keys matching a glob pattern (trailing `*` only).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError>;
    async fn close(&self) -> Result<(), CacheError>;
}

/// Redis-backed remote tier.
pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    /// Connect to `url` with an auto-reconnecting manager.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Remote`] when the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        debug!(url, "connected remote cache tier");
        Ok(Self { conn })
    }
}

#[async_trait]
impl RemoteKv for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.keys(pattern).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(key, ttl.as_secs().max(1) as i64)
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), CacheError> {
        // The connection manager reconnects lazily; dropping it is enough.
        Ok(())
    }
}

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL applied when the caller passes zero
    pub default_ttl: Duration,
    /// In-memory capacity bound
    pub max_memory_items: usize,
    /// Background sweep cadence
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            max_memory_items: 10_000,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Hit/miss counters and the memory-tier size.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub memory_items: usize,
}

/// The two-tier cache service.
pub struct CacheService {
    remote: Option<Arc<dyn RemoteKv>>,
    memory: MemoryCache,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    metrics: SharedMetrics,
}

impl CacheService {
    pub fn new(config: CacheConfig, remote: Option<Arc<dyn RemoteKv>>, metrics: SharedMetrics) -> Self {
        Self {
            remote,
            memory: MemoryCache::new(config.max_memory_items),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            metrics,
        }
    }

    /// Fetch a value: remote tier first, memory on miss or remote failure.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(remote) = &self.remote {
            match remote.get(key).await {
                Ok(Some(value)) => {
                    self.record_hit();
                    return Some(value);
                }
                Ok(None) => {}
                Err(e) => warn!(key, error = %e, "remote cache get failed"),
            }
        }

        match self.memory.get(key) {
            Some(value) => {
                self.record_hit();
                Some(value)
            }
            None => {
                self.record_miss();
                None
            }
        }
    }

    /// Store a value in both tiers. A zero TTL uses the configured default.
    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration) {
        let ttl = if ttl.is_zero() {
            self.config.default_ttl
        } else {
            ttl
        };

        if let Some(remote) = &self.remote {
            if let Err(e) = remote.set(key, value, ttl).await {
                warn!(key, error = %e, "remote cache set failed");
            }
        }
        self.memory.set(key, value, ttl);
    }

    /// Remove a key from both tiers.
    pub async fn delete(&self, key: &str) {
        if let Some(remote) = &self.remote {
            if let Err(e) = remote.delete(key).await {
                warn!(key, error = %e, "remote cache delete failed");
            }
        }
        self.memory.delete(key);
    }

    /// Remove keys matching `pattern`: a trailing `*` deletes by prefix,
    /// anything else deletes the exact key.
    pub async fn delete_pattern(&self, pattern: &str) {
        if let Some(remote) = &self.remote {
            match remote.keys(pattern).await {
                Ok(keys) => {
                    for key in keys {
                        if let Err(e) = remote.delete(&key).await {
                            warn!(key, error = %e, "remote cache delete failed");
                        }
                    }
                }
                Err(e) => warn!(pattern, error = %e, "remote cache keys failed"),
            }
        }

        match pattern.strip_suffix('*') {
            Some(prefix) => {
                self.memory.delete_prefix(prefix);
            }
            None => {
                self.memory.delete(pattern);
            }
        }
    }

    /// Counters and the current memory-tier size.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_ratio: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            memory_items: self.memory.len(),
        }
    }

    /// Run the minute sweep until the token fires.
    pub fn spawn_sweeper(self: &Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        service.memory.evict_expired();
                    }
                }
            }
        })
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.metrics.incr_counter(CACHE_HIT_TOTAL, 1);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.metrics.incr_counter(CACHE_MISS_TOTAL, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics;

    fn service() -> CacheService {
        CacheService::new(
            CacheConfig {
                default_ttl: Duration::from_secs(60),
                max_memory_items: 64,
                sweep_interval: Duration::from_millis(50),
            },
            None,
            metrics::noop(),
        )
    }

    #[tokio::test]
    async fn test_memory_round_trip_and_stats() {
        let cache = service();
        cache.set("project:1:meta", b"data", Duration::ZERO).await;

        assert_eq!(cache.get("project:1:meta").await, Some(b"data".to_vec()));
        assert_eq!(cache.get("project:2:meta").await, None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_ratio - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.memory_items, 1);
    }

    #[tokio::test]
    async fn test_ttl_obedience() {
        let cache = service();
        cache
            .set("ephemeral", b"x", Duration::from_millis(20))
            .await;
        assert!(cache.get("ephemeral").await.is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get("ephemeral").await, None);
    }

    #[tokio::test]
    async fn test_delete_pattern_prefix_and_exact() {
        let cache = service();
        cache.set("user:1:name", b"a", Duration::ZERO).await;
        cache.set("user:1:email", b"b", Duration::ZERO).await;
        cache.set("user:2:name", b"c", Duration::ZERO).await;

        cache.delete_pattern("user:1:*").await;
        assert_eq!(cache.get("user:1:name").await, None);
        assert_eq!(cache.get("user:1:email").await, None);
        assert!(cache.get("user:2:name").await.is_some());

        cache.delete_pattern("user:2:name").await;
        assert_eq!(cache.get("user:2:name").await, None);
    }

    #[tokio::test]
    async fn test_sweeper_evicts_in_background() {
        let cache = Arc::new(service());
        let token = CancellationToken::new();
        let sweeper = cache.spawn_sweeper(token.clone());

        cache.set("gone-soon", b"x", Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(cache.stats().memory_items, 0);

        token.cancel();
        sweeper.await.unwrap();
    }
}

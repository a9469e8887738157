//! Decision cache with pluggable storage backends.
//!
//! Backends:
//! - no-op (caching disabled)
//! - in-process LRU with per-entry TTL
//! - Redis (when CACHE/REDIS_URL points at a reachable server)
//!
//! The cache is advisory: a miss triggers reclassification, and runtime
//! backend errors are swallowed after a warn log. Read-your-writes holds
//! within a single backend instance; no cross-instance coordination.

use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Narrow cache capability: optional-string get/set.
#[async_trait]
pub trait DecisionCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str);
}

/// Cache construction settings, frozen at startup.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub redis_url: Option<String>,
    pub ttl_ms: u64,
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_url: None,
            ttl_ms: 3_600_000,
            max_entries: 50_000,
        }
    }
}

/// Inert backend used when caching is disabled.
pub struct NoopCache;

#[async_trait]
impl DecisionCache for NoopCache {
    async fn get(&self, _key: &str) -> Option<String> {
        None
    }

    async fn set(&self, _key: &str, _value: &str) {}
}

/// Fixed-capacity LRU with a per-entry TTL.
pub struct MemoryCache {
    inner: Mutex<LruCache<String, Entry>>,
    ttl: Duration,
}

struct Entry {
    value: String,
    expires_at: Instant,
}

impl MemoryCache {
    pub fn new(max_entries: usize, ttl_ms: u64) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl: Duration::from_millis(ttl_ms),
        }
    }
}

#[async_trait]
impl DecisionCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        let mut guard = self.inner.lock().ok()?;
        match guard.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                guard.pop(key);
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: &str, value: &str) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.put(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Instant::now() + self.ttl,
                },
            );
        }
    }
}

/// Redis-backed cache. TTL is expressed in whole seconds, clamped to at
/// least one second.
pub struct RedisCache {
    conn: redis::aio::ConnectionManager,
    ttl_secs: u64,
}

const KEY_NS: &str = "trigate:decision:";

impl RedisCache {
    pub async fn connect(url: &str, ttl_ms: u64) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            ttl_secs: (ttl_ms / 1000).max(1),
        })
    }

    fn key_for(key: &str) -> String {
        format!("{KEY_NS}{key}")
    }
}

#[async_trait]
impl DecisionCache for RedisCache {
    async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<Option<String>> = redis::cmd("GET")
            .arg(Self::key_for(key))
            .query_async(&mut conn)
            .await;
        match result {
            Ok(v) => v,
            Err(e) => {
                warn!("redis cache get failed: {e}");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: &str) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = redis::cmd("SET")
            .arg(Self::key_for(key))
            .arg(value)
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            warn!("redis cache set failed: {e}");
        }
    }
}

/// Select a backend from settings. Redis connection errors at construction
/// fall back to the in-process cache with a warning.
pub async fn make_cache(settings: &CacheSettings) -> Arc<dyn DecisionCache> {
    if !settings.enabled {
        debug!("decision cache disabled");
        return Arc::new(NoopCache);
    }

    if let Some(url) = settings.redis_url.as_deref() {
        match RedisCache::connect(url, settings.ttl_ms).await {
            Ok(cache) => {
                debug!("decision cache backed by redis");
                return Arc::new(cache);
            }
            Err(e) => {
                warn!("redis unavailable ({e}), falling back to in-process cache");
            }
        }
    }

    Arc::new(MemoryCache::new(settings.max_entries, settings.ttl_ms))
}

//! Enrichment result cache.
//!
//! The store is a plain key/value service: `GET key` and `SETEX key ttl value`. No
//! transactions and no compare-and-set; concurrent writers race and the last one wins.

use crate::config::CacheConfig;
use crate::schemas::Chain;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::info;

/// Upper bound on a single cache round trip
const CACHE_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Stand-in expiry for TTLs too large to represent as an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Cache unavailable: {0}")]
    Unavailable(String),
}

fn map_redis_err(e: redis::RedisError) -> CacheError {
    if e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() || e.is_io_error() {
        return CacheError::Unavailable(e.to_string());
    }
    CacheError::Redis(e.to_string())
}

/// Cache key for one `(chain, address)` pair
pub fn cache_key(chain: Chain, address: &str) -> String {
    format!("{}:{}", chain.as_str(), address)
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set_ex(&self, key: &str, ttl_secs: u64, value: &[u8]) -> Result<(), CacheError>;
}

/// Redis-backed store over a reconnecting async connection
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(|e| CacheError::Redis(e.to_string()))?;
        let conn = tokio::time::timeout(CACHE_OP_TIMEOUT, client.get_connection_manager())
            .await
            .map_err(|_| CacheError::Unavailable(format!("connecting to {} timed out", url)))?
            .map_err(map_redis_err)?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn.clone();
        let cmd = redis::cmd("GET").arg(key).clone();
        let value: Option<Vec<u8>> =
            tokio::time::timeout(CACHE_OP_TIMEOUT, cmd.query_async(&mut conn))
                .await
                .map_err(|_| CacheError::Unavailable(format!("GET {} timed out", key)))?
                .map_err(map_redis_err)?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, ttl_secs: u64, value: &[u8]) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let cmd = redis::cmd("SETEX").arg(key).arg(ttl_secs).arg(value).clone();
        let _: () = tokio::time::timeout(CACHE_OP_TIMEOUT, cmd.query_async(&mut conn))
            .await
            .map_err(|_| CacheError::Unavailable(format!("SETEX {} timed out", key)))?
            .map_err(map_redis_err)?;
        Ok(())
    }
}

fn expires_at(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Process-local store with per-entry expiry
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, (Vec<u8>, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|(_, expires)| *expires > now)
            .count()
    }

    /// Overwrite a raw value, bypassing serialization
    pub async fn insert_raw(&self, key: &str, value: &[u8], ttl: Duration) {
        self.entries
            .write()
            .await
            .insert(key.to_string(), (value.to_vec(), expires_at(Instant::now(), ttl)));
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(value, _)| value.clone()))
    }

    async fn set_ex(&self, key: &str, ttl_secs: u64, value: &[u8]) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        entries.retain(|_, (_, expires)| *expires > now);
        entries.insert(
            key.to_string(),
            (value.to_vec(), expires_at(now, Duration::from_secs(ttl_secs))),
        );
        Ok(())
    }
}

/// Redis when a URL is configured, otherwise an in-process store
pub async fn open_cache(config: &CacheConfig) -> Result<Arc<dyn CacheStore>, CacheError> {
    match config.redis_url.as_deref().filter(|u| !u.trim().is_empty()) {
        Some(url) => {
            let cache = RedisCache::connect(url).await?;
            info!("Using Redis cache");
            Ok(Arc::new(cache))
        }
        None => {
            info!("REDIS_URL not set, using in-process cache");
            Ok(Arc::new(MemoryCache::new()))
        }
    }
}

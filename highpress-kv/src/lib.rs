//! Counter store client
//!
//! Counters are decimal integers stored under
//! `counter:{resource_id}:{counter_type}`. Increments are atomic at the
//! store (`INCRBY`); reads of unknown keys return zero. The production
//! backend is redis; [`MemoryStore`] backs tests and local runs.

use async_trait::async_trait;
use highpress::FabricError;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Store identifier carried by every error.
const STORE_REDIS: &str = "redis";
const STORE_MEMORY: &str = "memory";

/// Build the addressable key for one counter.
pub fn counter_key(resource_id: &str, counter_type: &str) -> String {
    format!("counter:{}:{}", resource_id, counter_type)
}

/// Typed failure from the store, carrying the store name.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{store} unavailable: {message}")]
    Unavailable { store: &'static str, message: String },
    #[error("{store} protocol error: {message}")]
    Protocol { store: &'static str, message: String },
    #[error("{store} returned an unexpected value: {message}")]
    Value { store: &'static str, message: String },
}

impl StoreError {
    fn from_redis(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            Self::Unavailable { store: STORE_REDIS, message: err.to_string() }
        } else {
            Self::Protocol { store: STORE_REDIS, message: err.to_string() }
        }
    }

    pub fn store(&self) -> &'static str {
        match self {
            Self::Unavailable { store, .. }
            | Self::Protocol { store, .. }
            | Self::Value { store, .. } => store,
        }
    }
}

impl From<StoreError> for FabricError {
    fn from(err: StoreError) -> Self {
        FabricError::system(err.to_string()).with_source(err)
    }
}

/// Which store backend to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvMode {
    Redis,
    Memory,
}

/// Store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    #[serde(default = "default_mode")]
    pub mode: KvMode,
    #[serde(default = "default_url")]
    pub url: String,
}

fn default_mode() -> KvMode {
    KvMode::Redis
}

fn default_url() -> String {
    "redis://127.0.0.1:6379".to_owned()
}

impl Default for KvConfig {
    fn default() -> Self {
        Self { mode: default_mode(), url: default_url() }
    }
}

/// Build the configured store backend.
pub async fn build_store(config: &KvConfig) -> Result<std::sync::Arc<dyn CounterStore>, StoreError> {
    match config.mode {
        KvMode::Memory => {
            tracing::info!("using in-memory counter store");
            Ok(std::sync::Arc::new(MemoryStore::new()))
        }
        KvMode::Redis => Ok(std::sync::Arc::new(RedisStore::connect(config).await?)),
    }
}

/// Operations the counter worker needs from the store.
#[async_trait]
pub trait CounterStore: Send + Sync + 'static {
    /// Atomically add `delta` and return the post-increment value.
    async fn increment(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    /// Current value; unknown keys read as zero.
    async fn get(&self, key: &str) -> Result<i64, StoreError>;

    /// Values for `keys`, order-preserving; unknown keys read as zero.
    async fn batch_get(&self, keys: &[String]) -> Result<Vec<i64>, StoreError>;

    /// No-op probe used by health checks.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Redis-backed store over a reconnecting connection manager.
#[derive(Clone)]
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish()
    }
}

impl RedisStore {
    pub async fn connect(config: &KvConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(StoreError::from_redis)?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(StoreError::from_redis)?;
        tracing::info!(url = %config.url, "connected to counter store");
        Ok(Self { conn })
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        conn.incr(key, delta).await.map_err(StoreError::from_redis)
    }

    async fn get(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn.get(key).await.map_err(StoreError::from_redis)?;
        Ok(value.unwrap_or(0))
    }

    async fn batch_get(&self, keys: &[String]) -> Result<Vec<i64>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<i64>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(StoreError::from_redis)?;
        if values.len() != keys.len() {
            return Err(StoreError::Value {
                store: STORE_REDIS,
                message: format!("MGET returned {} values for {} keys", values.len(), keys.len()),
            });
        }
        Ok(values.into_iter().map(|value| value.unwrap_or(0)).collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(StoreError::from_redis)?;
        Ok(())
    }
}

/// In-memory store for tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, i64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut values = self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = values.entry(key.to_owned()).or_insert(0);
        *entry = entry.saturating_add(delta);
        Ok(*entry)
    }

    async fn get(&self, key: &str) -> Result<i64, StoreError> {
        let values = self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(values.get(key).copied().unwrap_or(0))
    }

    async fn batch_get(&self, keys: &[String]) -> Result<Vec<i64>, StoreError> {
        let values = self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(keys.iter().map(|key| values.get(key).copied().unwrap_or(0)).collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Always-failing store for outage tests.
#[derive(Debug, Clone, Copy)]
pub struct PoisonedStore;

#[async_trait]
impl CounterStore for PoisonedStore {
    async fn increment(&self, _key: &str, _delta: i64) -> Result<i64, StoreError> {
        Err(StoreError::Unavailable { store: STORE_MEMORY, message: "store offline".into() })
    }

    async fn get(&self, _key: &str) -> Result<i64, StoreError> {
        Err(StoreError::Unavailable { store: STORE_MEMORY, message: "store offline".into() })
    }

    async fn batch_get(&self, _keys: &[String]) -> Result<Vec<i64>, StoreError> {
        Err(StoreError::Unavailable { store: STORE_MEMORY, message: "store offline".into() })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Err(StoreError::Unavailable { store: STORE_MEMORY, message: "store offline".into() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_format_matches_the_store_layout() {
        assert_eq!(counter_key("article_001", "like"), "counter:article_001:like");
    }

    #[tokio::test]
    async fn increment_accumulates_and_returns_new_value() {
        let store = MemoryStore::new();
        let key = counter_key("article_001", "like");
        assert_eq!(store.increment(&key, 1).await.unwrap(), 1);
        assert_eq!(store.increment(&key, 4).await.unwrap(), 5);
        assert_eq!(store.get(&key).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn unknown_keys_read_as_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.get(&counter_key("nope", "view")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn batch_get_preserves_order_and_fills_zeroes() {
        let store = MemoryStore::new();
        store.increment(&counter_key("a", "like"), 3).await.unwrap();
        let keys =
            vec![counter_key("a", "like"), counter_key("missing", "view"), counter_key("a", "like")];
        assert_eq!(store.batch_get(&keys).await.unwrap(), vec![3, 0, 3]);
    }

    #[tokio::test]
    async fn empty_batch_is_empty_success() {
        let store = MemoryStore::new();
        assert!(store.batch_get(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn negative_delta_decrements() {
        let store = MemoryStore::new();
        let key = counter_key("a", "like");
        store.increment(&key, 10).await.unwrap();
        assert_eq!(store.increment(&key, -3).await.unwrap(), 7);
    }

    #[test]
    fn errors_carry_the_store_name() {
        let err = StoreError::Unavailable { store: "redis", message: "connection refused".into() };
        assert_eq!(err.store(), "redis");
        assert!(err.to_string().contains("redis"));

        let fabric: FabricError = err.into();
        assert_eq!(fabric.kind(), highpress::ErrorKind::System);
    }
}

//! # rcache
//!
//! Namespaced key-value cache with TTL and a best-effort distributed mutex.
//!
//! Cache keys have the form `{global_prefix}:{key_prefix}:{key}`; mutex keys
//! have the form `{global_prefix}:mutex:{name}`. Values are opaque bytes with
//! JSON helpers layered on top.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::warn;

mod memory;
mod mutex;
mod redis_store;

pub use memory::MemoryStore;
pub use mutex::{MutexGuard, MutexOptions, try_acquire_mutex};
pub use redis_store::RedisStore;

/// Errors surfaced by cache backends.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for CacheError {
    fn from(error: redis::RedisError) -> Self {
        CacheError::Backend(error.to_string())
    }
}

/// Storage primitives the cache and mutex are built on.
///
/// Keys passed to a store are fully qualified; stores never add prefixes.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Values in the same order as `keys`, `None` for misses.
    async fn get_multi(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError>;

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
    -> Result<(), CacheError>;

    async fn set_multi_ex(
        &self,
        entries: Vec<(String, Vec<u8>)>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError>;

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError>;

    /// Store `value` only if `key` is absent. Returns whether the write happened.
    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    /// Reset the expiry of `key` only while it still holds `value`.
    async fn extend_if_value(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    /// Delete `key` only while it still holds `value`.
    async fn delete_if_value(&self, key: &str, value: &str) -> Result<bool, CacheError>;
}

/// Entry point binding a store to the deployment-wide key prefix.
#[derive(Clone)]
pub struct Rcache {
    store: Arc<dyn KeyValueStore>,
    global_prefix: Arc<str>,
}

impl Rcache {
    pub fn new(store: Arc<dyn KeyValueStore>, global_prefix: &str) -> Self {
        Self {
            store,
            global_prefix: Arc::from(global_prefix),
        }
    }

    /// In-process cache, used when no Redis URL is configured and in tests.
    pub fn in_memory(global_prefix: &str) -> Self {
        Self::new(Arc::new(MemoryStore::new()), global_prefix)
    }

    /// Connect to Redis at `url`.
    pub async fn connect(url: &str, global_prefix: &str) -> Result<Self, CacheError> {
        let store = RedisStore::connect(url).await?;
        Ok(Self::new(Arc::new(store), global_prefix))
    }

    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.store)
    }

    pub fn global_prefix(&self) -> &str {
        &self.global_prefix
    }

    /// Cache whose entries never expire.
    pub fn cache(&self, key_prefix: &str) -> Cache {
        Cache::new(self.store(), &self.global_prefix, key_prefix)
    }

    /// Cache whose entries expire `ttl` after being written.
    pub fn cache_with_ttl(&self, key_prefix: &str, ttl: Duration) -> Cache {
        Cache::with_ttl(self.store(), &self.global_prefix, key_prefix, ttl)
    }

    /// Try to take the named mutex. `Ok(None)` means another holder has it.
    pub async fn try_acquire_mutex(
        &self,
        name: &str,
        options: MutexOptions,
    ) -> Result<Option<MutexGuard>, CacheError> {
        try_acquire_mutex(self.store(), &self.global_prefix, name, options).await
    }
}

/// A key namespace within an [`Rcache`].
#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
    ttl: Option<Duration>,
}

impl Cache {
    pub fn new(store: Arc<dyn KeyValueStore>, global_prefix: &str, key_prefix: &str) -> Self {
        Self {
            store,
            prefix: format!("{global_prefix}:{key_prefix}:"),
            ttl: None,
        }
    }

    pub fn with_ttl(
        store: Arc<dyn KeyValueStore>,
        global_prefix: &str,
        key_prefix: &str,
        ttl: Duration,
    ) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::new(store, global_prefix, key_prefix)
        }
    }

    /// Fully qualified key for `key`.
    pub fn rkey(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.store.get(&self.rkey(key)).await
    }

    pub async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        self.store.set_ex(&self.rkey(key), value, self.ttl).await
    }

    pub async fn get_multi(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let rkeys: Vec<String> = keys.iter().map(|key| self.rkey(key)).collect();
        self.store.get_multi(&rkeys).await
    }

    pub async fn set_multi(&self, entries: Vec<(String, Vec<u8>)>) -> Result<(), CacheError> {
        if entries.is_empty() {
            return Ok(());
        }
        let entries = entries
            .into_iter()
            .map(|(key, value)| (self.rkey(&key), value))
            .collect();
        self.store.set_multi_ex(entries, self.ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.store.delete(&[self.rkey(key)]).await
    }

    pub async fn delete_multi(&self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let rkeys: Vec<String> = keys.iter().map(|key| self.rkey(key)).collect();
        self.store.delete(&rkeys).await
    }

    /// Decode a JSON entry. Undecodable entries are reported as misses.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        Ok(self
            .get(key)
            .await?
            .and_then(|raw| self.decode(key, &raw)))
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        self.set(key, serde_json::to_vec(value)?).await
    }

    pub async fn get_multi_json<T: DeserializeOwned>(
        &self,
        keys: &[String],
    ) -> Result<Vec<Option<T>>, CacheError> {
        let raw = self.get_multi(keys).await?;
        Ok(keys
            .iter()
            .zip(raw)
            .map(|(key, value)| value.and_then(|bytes| self.decode(key, &bytes)))
            .collect())
    }

    pub async fn set_multi_json<T: Serialize>(
        &self,
        entries: &[(String, T)],
    ) -> Result<(), CacheError> {
        let encoded = entries
            .iter()
            .map(|(key, value)| Ok((key.clone(), serde_json::to_vec(value)?)))
            .collect::<Result<Vec<_>, CacheError>>()?;
        self.set_multi(encoded).await
    }

    fn decode<T: DeserializeOwned>(&self, key: &str, raw: &[u8]) -> Option<T> {
        match serde_json::from_slice(raw) {
            Ok(value) => Some(value),
            Err(error) => {
                warn!(key = %self.rkey(key), %error, "discarding undecodable cache entry");
                None
            }
        }
    }
}

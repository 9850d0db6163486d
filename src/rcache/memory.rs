//! In-process [`KeyValueStore`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{CacheError, KeyValueStore};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

/// Map-backed store honouring TTLs. Expired entries are invisible and pruned lazily.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn entry(value: Vec<u8>, ttl: Option<Duration>) -> Entry {
    Entry {
        value,
        expires_at: ttl.map(|ttl| Instant::now() + ttl),
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(found) if found.is_live(now) => Ok(Some(found.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn get_multi(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(keys
            .iter()
            .map(|key| {
                entries
                    .get(key)
                    .filter(|found| found.is_live(now))
                    .map(|found| found.value.clone())
            })
            .collect())
    }

    async fn set_ex(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), entry(value, ttl));
        Ok(())
    }

    async fn set_multi_ex(
        &self,
        values: Vec<(String, Vec<u8>)>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().await;
        for (key, value) in values {
            entries.insert(key, entry(value, ttl));
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().await;
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(|found| found.is_live(now)) {
            return Ok(false);
        }
        entries.insert(key.to_string(), entry(value.as_bytes().to_vec(), Some(ttl)));
        Ok(true)
    }

    async fn extend_if_value(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(found) if found.is_live(now) && found.value == value.as_bytes() => {
                found.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_value(&self, key: &str, value: &str) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let owned = entries
            .get(key)
            .is_some_and(|found| found.is_live(now) && found.value == value.as_bytes());
        if owned {
            entries.remove(key);
        }
        Ok(owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_ex_respects_live_entries() {
        let store = MemoryStore::new();
        assert!(
            store
                .set_nx_ex("lock", "a", Duration::from_secs(5))
                .await
                .unwrap()
        );
        assert!(
            !store
                .set_nx_ex("lock", "b", Duration::from_secs(5))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn compare_and_act_requires_matching_value() {
        let store = MemoryStore::new();
        store
            .set_nx_ex("lock", "owner", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(
            !store
                .extend_if_value("lock", "intruder", Duration::from_secs(5))
                .await
                .unwrap()
        );
        assert!(!store.delete_if_value("lock", "intruder").await.unwrap());
        assert!(store.delete_if_value("lock", "owner").await.unwrap());
        assert!(store.get("lock").await.unwrap().is_none());
    }
}

//! Best-effort distributed mutex on top of a [`KeyValueStore`].
//!
//! The holder writes a random token with an expiry and renews it every
//! `expiry / 2`. When a renewal fails the lease is considered lost and the
//! guard's [`MutexGuard::lease_lost`] token fires; holders must stop work that
//! relies on exclusivity when it does.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{CacheError, KeyValueStore};

#[derive(Debug, Clone, Copy)]
pub struct MutexOptions {
    /// Lease length; renewed every half of it.
    pub expiry: Duration,
    /// Acquisition attempts before giving up.
    pub tries: u32,
    pub retry_delay: Duration,
}

impl Default for MutexOptions {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(60),
            tries: 3,
            retry_delay: Duration::from_millis(512),
        }
    }
}

/// Try to acquire `{global_prefix}:mutex:{name}`.
///
/// Returns `Ok(None)` when every attempt found the mutex held elsewhere.
pub async fn try_acquire_mutex(
    store: Arc<dyn KeyValueStore>,
    global_prefix: &str,
    name: &str,
    options: MutexOptions,
) -> Result<Option<MutexGuard>, CacheError> {
    let key = format!("{global_prefix}:mutex:{name}");
    let token = uuid::Uuid::new_v4().to_string();
    let tries = options.tries.max(1);

    for attempt in 1..=tries {
        if store.set_nx_ex(&key, &token, options.expiry).await? {
            debug!(%key, attempt, "mutex acquired");
            return Ok(Some(MutexGuard::start(store, key, token, options.expiry)));
        }
        if attempt < tries {
            tokio::time::sleep(options.retry_delay).await;
        }
    }

    debug!(%key, tries, "mutex held elsewhere");
    Ok(None)
}

/// Held mutex. Dropping the guard stops renewal and lets the lease expire;
/// [`MutexGuard::release`] frees it immediately.
pub struct MutexGuard {
    store: Arc<dyn KeyValueStore>,
    key: String,
    token: String,
    stop: CancellationToken,
    lost: CancellationToken,
    renewal: Option<JoinHandle<()>>,
}

impl MutexGuard {
    fn start(store: Arc<dyn KeyValueStore>, key: String, token: String, expiry: Duration) -> Self {
        let stop = CancellationToken::new();
        let lost = CancellationToken::new();
        let renewal = tokio::spawn(renew(
            Arc::clone(&store),
            key.clone(),
            token.clone(),
            expiry,
            stop.clone(),
            lost.clone(),
        ));
        Self {
            store,
            key,
            token,
            stop,
            lost,
            renewal: Some(renewal),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Fires once the lease could not be renewed.
    pub fn lease_lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    /// Stop renewing and delete the key if this guard still owns it.
    pub async fn release(mut self) -> Result<bool, CacheError> {
        self.stop.cancel();
        if let Some(handle) = self.renewal.take() {
            let _ = handle.await;
        }
        self.store.delete_if_value(&self.key, &self.token).await
    }
}

impl Drop for MutexGuard {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn renew(
    store: Arc<dyn KeyValueStore>,
    key: String,
    token: String,
    expiry: Duration,
    stop: CancellationToken,
    lost: CancellationToken,
) {
    let interval = expiry / 2;
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        match store.extend_if_value(&key, &token, expiry).await {
            Ok(true) => debug!(%key, "mutex lease renewed"),
            Ok(false) => {
                warn!(%key, "mutex lease lost to another holder");
                lost.cancel();
                return;
            }
            Err(error) => {
                warn!(%key, %error, "failed to renew mutex lease");
                lost.cancel();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rcache::MemoryStore;

    fn fast_options() -> MutexOptions {
        MutexOptions {
            expiry: Duration::from_millis(100),
            tries: 2,
            retry_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn second_acquire_fails_while_held() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let guard = try_acquire_mutex(Arc::clone(&store), "v2", "sync", fast_options())
            .await
            .unwrap()
            .expect("first acquire succeeds");
        assert_eq!(guard.key(), "v2:mutex:sync");

        let second = try_acquire_mutex(Arc::clone(&store), "v2", "sync", fast_options())
            .await
            .unwrap();
        assert!(second.is_none());

        assert!(guard.release().await.unwrap());
        let third = try_acquire_mutex(store, "v2", "sync", fast_options())
            .await
            .unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn lease_is_renewed_past_expiry() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let guard = try_acquire_mutex(Arc::clone(&store), "v2", "renew", fast_options())
            .await
            .unwrap()
            .expect("acquired");

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(store.get("v2:mutex:renew").await.unwrap().is_some());
        assert!(!guard.lease_lost().is_cancelled());
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn lease_lost_fires_when_key_is_stolen() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let guard = try_acquire_mutex(Arc::clone(&store), "v2", "steal", fast_options())
            .await
            .unwrap()
            .expect("acquired");
        let lost = guard.lease_lost();

        store
            .set_ex("v2:mutex:steal", b"someone-else".to_vec(), None)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_millis(500), lost.cancelled())
            .await
            .expect("lease loss observed");
        assert!(!guard.release().await.unwrap());
    }
}

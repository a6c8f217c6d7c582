//! Cache-aside accessor.
//!
//! Reads check the cache first and fall back to a loader on a miss, then
//! populate the cache. Writers call [`CacheAside::invalidate`] before they
//! return, so the next read goes to the store.
//!
//! Cache failures are logged and swallowed here. A cache outage makes reads
//! slower, never fail.

use super::key::CacheKey;
use super::traits::{CacheBackend, CacheStats, Cacheable};
use fleet_core::FleetResult;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Best-effort cache in front of the document store.
#[derive(Clone)]
pub struct CacheAside {
    backend: Arc<dyn CacheBackend>,
}

impl CacheAside {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// Key for a cacheable value.
    pub fn key_for<T: Cacheable>(identifier: impl Into<String>) -> CacheKey {
        CacheKey::new(T::ENTITY, identifier)
    }

    /// Cached value, or `None` on miss, outage or undecodable entry.
    pub async fn get<T: Cacheable>(&self, key: &CacheKey) -> Option<T> {
        let bytes = match self.backend.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::debug!(%key, "Cache miss");
                return None;
            }
            Err(e) => {
                tracing::warn!(%key, error = %e, "Cache read failed, falling back to store");
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => {
                tracing::debug!(%key, "Cache hit");
                Some(value)
            }
            Err(e) => {
                tracing::warn!(%key, error = %e, "Discarding undecodable cache entry");
                self.invalidate(key).await;
                None
            }
        }
    }

    /// Store a value. Failures are logged.
    pub async fn put<T: Cacheable>(&self, key: &CacheKey, value: &T, ttl: Duration) {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(%key, error = %e, "Failed to encode value for cache");
                return;
            }
        };
        if let Err(e) = self.backend.set(key, bytes, ttl).await {
            tracing::warn!(%key, error = %e, "Cache populate failed");
        }
    }

    /// Return the cached value, or run `loader`, cache its result and
    /// return it. Loader errors are returned unchanged and nothing is cached.
    pub async fn get_or_load<T, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        loader: F,
    ) -> FleetResult<T>
    where
        T: Cacheable,
        F: FnOnce() -> Fut,
        Fut: Future<Output = FleetResult<T>>,
    {
        if let Some(hit) = self.get(key).await {
            return Ok(hit);
        }
        let loaded = loader().await?;
        self.put(key, &loaded, ttl).await;
        Ok(loaded)
    }

    /// Drop a cached entry. Failures are logged.
    pub async fn invalidate(&self, key: &CacheKey) {
        match self.backend.delete(key).await {
            Ok(()) => tracing::debug!(%key, "Cache entry invalidated"),
            Err(e) => tracing::warn!(%key, error = %e, "Cache invalidation failed"),
        }
    }

    pub async fn invalidate_all(&self, keys: impl IntoIterator<Item = CacheKey>) {
        for key in keys {
            self.invalidate(&key).await;
        }
    }

    pub async fn stats(&self) -> CacheStats {
        match self.backend.stats().await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!(error = %e, "Cache stats unavailable");
                CacheStats::default()
            }
        }
    }
}

impl std::fmt::Debug for CacheAside {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheAside").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheBackend;
    use fleet_core::{EntityType, FleetError, SystemSettings};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (Arc<InMemoryCacheBackend>, CacheAside) {
        let backend = Arc::new(InMemoryCacheBackend::new());
        let aside = CacheAside::new(backend.clone());
        (backend, aside)
    }

    #[tokio::test]
    async fn test_hit_skips_loader() {
        let (_, aside) = setup();
        let key = CacheAside::key_for::<SystemSettings>("global");
        let calls = AtomicUsize::new(0);
        let load = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(SystemSettings::default())
        };

        aside
            .get_or_load(&key, Duration::from_secs(60), load)
            .await
            .unwrap();
        aside
            .get_or_load(&key, Duration::from_secs(60), load)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_outage_falls_back_to_loader() {
        let (backend, aside) = setup();
        backend.set_available(false);
        let key = CacheAside::key_for::<SystemSettings>("global");

        let settings = aside
            .get_or_load(&key, Duration::from_secs(60), || async {
                Ok(SystemSettings {
                    setup_done: true,
                    ..Default::default()
                })
            })
            .await
            .unwrap();
        assert!(settings.setup_done);
        aside.invalidate(&key).await;
    }

    #[tokio::test]
    async fn test_loader_error_is_not_cached() {
        let (backend, aside) = setup();
        let key = CacheAside::key_for::<SystemSettings>("global");

        let err = aside
            .get_or_load::<SystemSettings, _, _>(&key, Duration::from_secs(60), || async {
                Err(FleetError::not_found(EntityType::SystemSettings, "global"))
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(!backend.contains(&key).await);
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_discarded() {
        let (backend, aside) = setup();
        let key = CacheKey::new(EntityType::SystemSettings, "global");
        backend
            .set(&key, b"not json".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(aside.get::<SystemSettings>(&key).await.is_none());
        assert!(!backend.contains(&key).await);
    }
}

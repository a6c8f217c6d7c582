//! In-memory cache backend.

use super::key::CacheKey;
use super::traits::{CacheBackend, CacheError, CacheStats};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Process-local cache with per-entry expiry.
///
/// `set_available(false)` makes every call fail, which is how tests model a
/// cache outage.
#[derive(Debug, Default)]
pub struct InMemoryCacheBackend {
    entries: RwLock<HashMap<CacheKey, Entry>>,
    stats: RwLock<CacheStats>,
    unavailable: AtomicBool,
}

impl InMemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Whether a live entry exists, without touching statistics.
    pub async fn contains(&self, key: &CacheKey) -> bool {
        self.entries
            .read()
            .await
            .get(key)
            .is_some_and(|e| e.expires_at > Instant::now())
    }

    fn check_available(&self) -> Result<(), CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("in-memory cache disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let mut stats = self.stats.write().await;

        let live = entries.get(key).map(|e| e.expires_at > now);
        match live {
            Some(true) => {
                stats.hits += 1;
                Ok(entries.get(key).map(|e| e.value.clone()))
            }
            Some(false) => {
                if let Some(expired) = entries.remove(key) {
                    stats.entry_count = stats.entry_count.saturating_sub(1);
                    stats.memory_bytes = stats
                        .memory_bytes
                        .saturating_sub(expired.value.len() as u64);
                }
                stats.expirations += 1;
                stats.misses += 1;
                Ok(None)
            }
            None => {
                stats.misses += 1;
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &CacheKey, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        self.check_available()?;
        let size = value.len() as u64;
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        let previous = self.entries.write().await.insert(key.clone(), entry);

        let mut stats = self.stats.write().await;
        match previous {
            Some(old) => {
                stats.memory_bytes = stats.memory_bytes.saturating_sub(old.value.len() as u64);
            }
            None => stats.entry_count += 1,
        }
        stats.memory_bytes += size;
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.check_available()?;
        if let Some(old) = self.entries.write().await.remove(key) {
            let mut stats = self.stats.write().await;
            stats.entry_count = stats.entry_count.saturating_sub(1);
            stats.memory_bytes = stats.memory_bytes.saturating_sub(old.value.len() as u64);
        }
        Ok(())
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        Ok(self.stats.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::EntityType;

    fn key(id: &str) -> CacheKey {
        CacheKey::new(EntityType::Device, id)
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = InMemoryCacheBackend::new();
        cache
            .set(&key("a"), b"one".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get(&key("a")).await.unwrap(), Some(b"one".to_vec()));

        cache.delete(&key("a")).await.unwrap();
        assert_eq!(cache.get(&key("a")).await.unwrap(), None);

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 0);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = InMemoryCacheBackend::new();
        cache
            .set(&key("a"), b"one".to_vec(), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(cache.get(&key("a")).await.unwrap(), None);
        assert_eq!(cache.stats().await.unwrap().expirations, 1);
    }

    #[tokio::test]
    async fn test_unavailable_cache_errors() {
        let cache = InMemoryCacheBackend::new();
        cache.set_available(false);
        assert!(matches!(
            cache.get(&key("a")).await,
            Err(CacheError::Unavailable(_))
        ));
        cache.set_available(true);
        assert!(cache.get(&key("a")).await.is_ok());
    }
}

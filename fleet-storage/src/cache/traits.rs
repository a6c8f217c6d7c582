//! Cache backend trait and cacheable marker.

use super::key::CacheKey;
use async_trait::async_trait;
use fleet_core::{Device, EntityType, Namespace, SystemSettings};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

/// Errors raised by cache backends. They never leave the cache-aside
/// accessor.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    #[error("Cache backend error: {0}")]
    Backend(String),

    #[error("Cache serialization error: {0}")]
    Serialization(String),
}

/// Marker for values the store caches.
pub trait Cacheable: Serialize + DeserializeOwned + Send + Sync + 'static {
    const ENTITY: EntityType;
}

impl Cacheable for Namespace {
    const ENTITY: EntityType = EntityType::Namespace;
}

impl Cacheable for Device {
    const ENTITY: EntityType = EntityType::Device;
}

impl Cacheable for SystemSettings {
    const ENTITY: EntityType = EntityType::SystemSettings;
}

/// Pluggable byte cache.
///
/// Implementations must be safe for concurrent use. Entries past their TTL
/// must read as misses.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &CacheKey, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    /// Remove an entry. Removing a missing key is not an error.
    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError>;

    async fn stats(&self) -> Result<CacheStats, CacheError>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entry_count: u64,
    /// Approximate stored bytes.
    pub memory_bytes: u64,
    /// Entries dropped because their TTL passed.
    pub expirations: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

//! LMDB-backed cache.
//!
//! Uses the heed crate (Rust bindings for LMDB) for a memory-mapped cache
//! that survives process restarts and can be shared by several store
//! processes on one host.
//!
//! # Value format
//!
//! `[expires_at: 8 bytes, i64 millis LE][payload]`
//!
//! Entries past their expiry read as misses and are removed lazily, on the
//! read that finds them or by [`LmdbCacheBackend::purge_expired`].

use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};

use super::key::CacheKey;
use super::traits::{CacheBackend, CacheError, CacheStats};

/// Error type for LMDB cache operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbCacheError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Corrupt entry: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbCacheError> for CacheError {
    fn from(e: LmdbCacheError) -> Self {
        match e {
            LmdbCacheError::Corrupt(reason) => CacheError::Serialization(reason),
            other => CacheError::Backend(other.to_string()),
        }
    }
}

fn txn_err(e: heed::Error) -> LmdbCacheError {
    LmdbCacheError::Transaction(e.to_string())
}

/// LMDB-backed [`CacheBackend`].
///
/// # Example
///
/// ```ignore
/// use fleet_storage::cache::{CacheBackend, CacheKey, LmdbCacheBackend};
/// use fleet_core::EntityType;
///
/// let backend = LmdbCacheBackend::new("/var/cache/fleet", 100)?;
/// let key = CacheKey::new(EntityType::Namespace, tenant_id);
/// backend.set(&key, bytes, Duration::from_secs(60)).await?;
/// ```
pub struct LmdbCacheBackend {
    env: Env,
    db: Database<Bytes, Bytes>,
    stats: RwLock<CacheStats>,
}

impl LmdbCacheBackend {
    /// Open (creating if needed) a cache rooted at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the LMDB
    /// environment or database cannot be opened.
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbCacheError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbCacheError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        let entry_count = {
            let rtxn = env.read_txn().map_err(txn_err)?;
            db.len(&rtxn).map_err(txn_err)?
        };

        Ok(Self {
            env,
            db,
            stats: RwLock::new(CacheStats {
                entry_count,
                ..Default::default()
            }),
        })
    }

    fn with_stats(&self, f: impl FnOnce(&mut CacheStats)) {
        if let Ok(mut stats) = self.stats.write() {
            f(&mut stats);
        }
    }

    /// Split a stored value into expiry and payload.
    fn decode_entry(bytes: &[u8]) -> Result<(i64, &[u8]), LmdbCacheError> {
        if bytes.len() < 8 {
            return Err(LmdbCacheError::Corrupt(format!(
                "entry of {} bytes has no expiry header",
                bytes.len()
            )));
        }
        let header: [u8; 8] = bytes[0..8]
            .try_into()
            .map_err(|_| LmdbCacheError::Corrupt("invalid expiry header".into()))?;
        Ok((i64::from_le_bytes(header), &bytes[8..]))
    }

    fn remove_key(&self, encoded: &[u8]) -> Result<bool, LmdbCacheError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let deleted = self.db.delete(&mut wtxn, encoded).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(deleted)
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<u64, LmdbCacheError> {
        let now = Utc::now().timestamp_millis();
        let expired: Vec<Vec<u8>> = {
            let rtxn = self.env.read_txn().map_err(txn_err)?;
            let iter = self.db.iter(&rtxn).map_err(txn_err)?;
            let mut keys = Vec::new();
            for item in iter {
                let (key, value) = item.map_err(txn_err)?;
                match Self::decode_entry(value) {
                    Ok((expires_at, _)) if expires_at > now => {}
                    _ => keys.push(key.to_vec()),
                }
            }
            keys
        };

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let mut removed = 0u64;
        for key in &expired {
            if self.db.delete(&mut wtxn, key).map_err(txn_err)? {
                removed += 1;
            }
        }
        wtxn.commit().map_err(txn_err)?;

        self.with_stats(|s| {
            s.entry_count = s.entry_count.saturating_sub(removed);
            s.expirations += removed;
        });
        tracing::debug!(removed, "Purged expired LMDB cache entries");
        Ok(removed)
    }
}

#[async_trait]
impl CacheBackend for LmdbCacheBackend {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        let encoded = key.encode();
        let found = {
            let rtxn = self.env.read_txn().map_err(txn_err)?;
            match self.db.get(&rtxn, &encoded).map_err(txn_err)? {
                Some(bytes) => {
                    let (expires_at, payload) = Self::decode_entry(bytes)?;
                    Some((expires_at, payload.to_vec()))
                }
                None => None,
            }
        };

        match found {
            Some((expires_at, payload)) if expires_at > Utc::now().timestamp_millis() => {
                self.with_stats(|s| s.hits += 1);
                Ok(Some(payload))
            }
            Some(_) => {
                let removed = self.remove_key(&encoded)?;
                self.with_stats(|s| {
                    s.misses += 1;
                    s.expirations += 1;
                    if removed {
                        s.entry_count = s.entry_count.saturating_sub(1);
                    }
                });
                Ok(None)
            }
            None => {
                self.with_stats(|s| s.misses += 1);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &CacheKey, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let encoded = key.encode();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = Utc::now().timestamp_millis().saturating_add(ttl_ms);

        let mut full = Vec::with_capacity(8 + value.len());
        full.extend_from_slice(&expires_at.to_le_bytes());
        full.extend_from_slice(&value);

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let is_new = self.db.get(&wtxn, &encoded).map_err(txn_err)?.is_none();
        self.db.put(&mut wtxn, &encoded, &full).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;

        self.with_stats(|s| {
            if is_new {
                s.entry_count += 1;
            }
            s.memory_bytes += full.len() as u64;
        });
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        if self.remove_key(&key.encode())? {
            self.with_stats(|s| s.entry_count = s.entry_count.saturating_sub(1));
        }
        Ok(())
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        Ok(self
            .stats
            .read()
            .map(|s| s.clone())
            .unwrap_or_default())
    }
}

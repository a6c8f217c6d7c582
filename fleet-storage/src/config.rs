//! Store configuration.

use fleet_core::ConfigError;
use std::path::PathBuf;
use std::time::Duration;

/// Default presence window: a device seen within this long is online.
pub const DEFAULT_ONLINE_WINDOW_SECS: u64 = 120;

/// Default TTL for cached namespaces and devices.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 60;

/// Default TTL for cached system settings.
pub const DEFAULT_SETTINGS_CACHE_TTL_SECS: u64 = 300;

/// Default upper bound on a cascade transaction.
pub const DEFAULT_TRANSACTION_TIMEOUT_SECS: u64 = 30;

/// Default LMDB map size.
pub const DEFAULT_CACHE_MAX_SIZE_MB: usize = 256;

/// Tunables for [`Store`](crate::Store).
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Sliding window used to derive "online" (default: 2 minutes).
    pub online_window: Duration,

    /// TTL for cached namespaces and devices (default: 60 seconds).
    pub cache_ttl: Duration,

    /// TTL for cached system settings (default: 5 minutes).
    pub settings_cache_ttl: Duration,

    /// Cascades taking longer than this are aborted (default: 30 seconds).
    pub transaction_timeout: Duration,

    /// Directory for the LMDB cache. `None` selects the in-memory cache.
    pub cache_dir: Option<PathBuf>,

    /// LMDB map size in megabytes (default: 256).
    pub cache_max_size_mb: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            online_window: Duration::from_secs(DEFAULT_ONLINE_WINDOW_SECS),
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            settings_cache_ttl: Duration::from_secs(DEFAULT_SETTINGS_CACHE_TTL_SECS),
            transaction_timeout: Duration::from_secs(DEFAULT_TRANSACTION_TIMEOUT_SECS),
            cache_dir: None,
            cache_max_size_mb: DEFAULT_CACHE_MAX_SIZE_MB,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build configuration from environment variables.
    ///
    /// # Environment Variables
    /// - `FLEET_ONLINE_WINDOW_SECS`: presence window (default: 120)
    /// - `FLEET_CACHE_TTL_SECS`: namespace/device cache TTL (default: 60)
    /// - `FLEET_SETTINGS_CACHE_TTL_SECS`: settings cache TTL (default: 300)
    /// - `FLEET_TRANSACTION_TIMEOUT_SECS`: cascade timeout (default: 30)
    /// - `FLEET_CACHE_DIR`: LMDB cache directory (default: in-memory cache)
    /// - `FLEET_CACHE_MAX_SIZE_MB`: LMDB map size (default: 256)
    pub fn from_env() -> Self {
        let secs = |name: &str, default: u64| {
            Duration::from_secs(
                std::env::var(name)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(default),
            )
        };

        Self {
            online_window: secs("FLEET_ONLINE_WINDOW_SECS", DEFAULT_ONLINE_WINDOW_SECS),
            cache_ttl: secs("FLEET_CACHE_TTL_SECS", DEFAULT_CACHE_TTL_SECS),
            settings_cache_ttl: secs(
                "FLEET_SETTINGS_CACHE_TTL_SECS",
                DEFAULT_SETTINGS_CACHE_TTL_SECS,
            ),
            transaction_timeout: secs(
                "FLEET_TRANSACTION_TIMEOUT_SECS",
                DEFAULT_TRANSACTION_TIMEOUT_SECS,
            ),
            cache_dir: std::env::var("FLEET_CACHE_DIR")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            cache_max_size_mb: std::env::var("FLEET_CACHE_MAX_SIZE_MB")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_CACHE_MAX_SIZE_MB),
        }
    }

    pub fn with_online_window(mut self, window: Duration) -> Self {
        self.online_window = window;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_settings_cache_ttl(mut self, ttl: Duration) -> Self {
        self.settings_cache_ttl = ttl;
        self
    }

    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn with_cache_max_size_mb(mut self, mb: usize) -> Self {
        self.cache_max_size_mb = mb;
        self
    }

    /// Reject values the store cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.online_window.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "online_window".to_string(),
                value: "0".to_string(),
                reason: "presence window must be positive".to_string(),
            });
        }
        if self.transaction_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "transaction_timeout".to_string(),
                value: "0".to_string(),
                reason: "cascades need time to run".to_string(),
            });
        }
        if self.cache_dir.is_some() && self.cache_max_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache_max_size_mb".to_string(),
                value: "0".to_string(),
                reason: "LMDB map size must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Presence window as a chrono duration, for timestamp arithmetic.
    pub fn online_window_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.online_window).unwrap_or(chrono::Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = StoreConfig::default();
        assert_eq!(config.online_window, Duration::from_secs(120));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders_override_defaults() {
        let config = StoreConfig::new()
            .with_online_window(Duration::from_secs(30))
            .with_cache_ttl(Duration::from_secs(5))
            .with_cache_dir("/tmp/fleet-cache");
        assert_eq!(config.online_window, Duration::from_secs(30));
        assert_eq!(config.cache_ttl, Duration::from_secs(5));
        assert!(config.cache_dir.is_some());
    }

    #[test]
    fn test_zero_window_is_rejected() {
        let err = StoreConfig::new()
            .with_online_window(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field, .. } if field == "online_window"));
    }

    #[test]
    fn test_zero_map_size_only_matters_with_lmdb() {
        let in_memory = StoreConfig::new().with_cache_max_size_mb(0);
        assert!(in_memory.validate().is_ok());
        assert!(in_memory.with_cache_dir("/tmp/x").validate().is_err());
    }
}

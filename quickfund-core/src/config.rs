//! Cache configuration
//!
//! # Environment Variables
//!
//! | variable                        | default                                   |
//! |---------------------------------|-------------------------------------------|
//! | `QUICKFUND_CACHE_DIR`           | `<platform cache dir>/QuickFund/<version>` |
//! | `QUICKFUND_CACHE_CAPACITY`      | 2000                                      |
//! | `QUICKFUND_FETCH_TIMEOUT_SECS`  | 10                                        |
//! | `QUICKFUND_CACHE_MAP_SIZE_MB`   | 64                                        |
//! | `QUICKFUND_DISABLE_CACHE`       | false                                     |

use crate::{ConfigError, QuickFundResult};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CACHE_CAPACITY: usize = 2000;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAP_SIZE_MB: usize = 64;

/// Application directory name under the platform cache dir.
pub const CACHE_APP_NAME: &str = "QuickFund";

/// Version written into the store; a mismatch on open clears the store.
pub const SCHEMA_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Configuration for the record cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Directory holding the LMDB environment. One directory per version.
    pub cache_dir: PathBuf,

    /// Maximum number of records kept after a batch (default: 2000)
    pub capacity: usize,

    /// Stored schema marker. Records written under another marker are dropped.
    pub schema_version: String,

    /// Upper bound for any single group fetch (default: 10 seconds)
    pub fetch_timeout: Duration,

    /// LMDB map size in megabytes (default: 64)
    pub map_size_mb: usize,

    /// Keep records in memory only, nothing survives the process.
    pub disable_cache: bool,
}

/// `<platform cache dir>/QuickFund/<version>`, falling back to the temp dir
/// on platforms without a cache dir.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(CACHE_APP_NAME)
        .join(SCHEMA_VERSION)
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            capacity: DEFAULT_CACHE_CAPACITY,
            schema_version: SCHEMA_VERSION.to_string(),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            map_size_mb: DEFAULT_MAP_SIZE_MB,
            disable_cache: false,
        }
    }
}

impl CacheConfig {
    /// Create CacheConfig from environment variables.
    ///
    /// Unparseable values fall back to their defaults; call
    /// [`CacheConfig::validate`] to reject out-of-range ones.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`CacheConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let cache_dir = lookup("QUICKFUND_CACHE_DIR")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);

        let capacity = lookup("QUICKFUND_CACHE_CAPACITY")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(DEFAULT_CACHE_CAPACITY);

        let fetch_timeout = Duration::from_secs(
            lookup("QUICKFUND_FETCH_TIMEOUT_SECS")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS),
        );

        let map_size_mb = lookup("QUICKFUND_CACHE_MAP_SIZE_MB")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(DEFAULT_MAP_SIZE_MB);

        let disable_cache = lookup("QUICKFUND_DISABLE_CACHE")
            .map(|s| matches!(s.trim(), "1" | "true" | "TRUE" | "yes"))
            .unwrap_or(false);

        Self {
            cache_dir,
            capacity,
            schema_version: defaults.schema_version,
            fetch_timeout,
            map_size_mb,
            disable_cache,
        }
    }

    /// Configuration for tests: small capacity, short timeout, given directory.
    pub fn development(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            capacity: 16,
            fetch_timeout: Duration::from_secs(2),
            map_size_mb: 10,
            ..Self::default()
        }
    }

    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_schema_version(mut self, version: impl Into<String>) -> Self {
        self.schema_version = version.into();
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_map_size_mb(mut self, map_size_mb: usize) -> Self {
        self.map_size_mb = map_size_mb;
        self
    }

    pub fn with_disable_cache(mut self, disable: bool) -> Self {
        self.disable_cache = disable;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> QuickFundResult<()> {
        if self.capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "capacity".to_string(),
                value: self.capacity.to_string(),
                reason: "capacity must be at least 1".to_string(),
            }
            .into());
        }

        if self.fetch_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "fetch_timeout".to_string(),
                value: format!("{:?}", self.fetch_timeout),
                reason: "fetch timeout must be positive".to_string(),
            }
            .into());
        }

        if self.map_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "map_size_mb".to_string(),
                value: self.map_size_mb.to_string(),
                reason: "map size must be positive".to_string(),
            }
            .into());
        }

        if self.schema_version.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "schema_version".to_string(),
            }
            .into());
        }

        if !self.disable_cache && self.cache_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "cache_dir".to_string(),
            }
            .into());
        }

        Ok(())
    }
}

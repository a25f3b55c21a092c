//! Configuration types

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{CacheError, CacheResult, ConfigError, SerializerKind};

/// Default size cap for stored results (500 MiB).
pub const DEFAULT_MAX_CACHE_SIZE_BYTES: u64 = 500 * 1024 * 1024;

/// Default time-to-live for entries (30 days).
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Default LMDB map size for the metadata store (256 MiB).
pub const DEFAULT_METADATA_MAP_SIZE_BYTES: usize = 256 * 1024 * 1024;

/// Immutable cache configuration, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache root directory.
    pub cache_dir: PathBuf,
    /// Maximum total size of stored results in bytes.
    pub max_cache_size_bytes: u64,
    /// Time-to-live applied when `put` is not given an explicit one.
    pub default_ttl: Duration,
    /// Result encoding used for every blob under this root.
    pub serializer: SerializerKind,
    /// Upper bound on the metadata store's memory map.
    pub metadata_map_size_bytes: usize,
}

impl CacheConfig {
    /// Build a configuration, resolving the serializer by name.
    ///
    /// Fails with `InvalidConfiguration` before any I/O if the name is not
    /// registered or the values are out of range.
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        max_cache_size_bytes: u64,
        default_ttl: Duration,
        serializer_name: &str,
    ) -> CacheResult<Self> {
        let config = Self {
            cache_dir: cache_dir.into(),
            max_cache_size_bytes,
            default_ttl,
            serializer: SerializerKind::from_name(serializer_name)?,
            metadata_map_size_bytes: DEFAULT_METADATA_MAP_SIZE_BYTES,
        };
        config.validate()?;
        Ok(config)
    }

    /// Defaults rooted at `cache_dir`: 500 MiB, 30 days, msgpack.
    pub fn default_at(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            max_cache_size_bytes: DEFAULT_MAX_CACHE_SIZE_BYTES,
            default_ttl: DEFAULT_TTL,
            serializer: SerializerKind::default(),
            metadata_map_size_bytes: DEFAULT_METADATA_MAP_SIZE_BYTES,
        }
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `MEMENTO_CACHE_DIR`: Cache root (default: `.cache`)
    /// - `MEMENTO_MAX_CACHE_SIZE_MB`: Size cap in MiB (default: 500)
    /// - `MEMENTO_DEFAULT_TTL_SECS`: Default TTL in seconds (default: 30 days)
    /// - `MEMENTO_SERIALIZER`: `msgpack`, `cbor` or `json` (default: `msgpack`)
    pub fn from_env() -> CacheResult<Self> {
        let defaults = Self::default_at(
            std::env::var("MEMENTO_CACHE_DIR").unwrap_or_else(|_| ".cache".to_string()),
        );

        let serializer = match std::env::var("MEMENTO_SERIALIZER") {
            Ok(name) => SerializerKind::from_name(&name)?,
            Err(_) => defaults.serializer,
        };

        let config = Self {
            max_cache_size_bytes: std::env::var("MEMENTO_MAX_CACHE_SIZE_MB")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(|mb| mb * 1024 * 1024)
                .unwrap_or(defaults.max_cache_size_bytes),
            default_ttl: std::env::var("MEMENTO_DEFAULT_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_ttl),
            serializer,
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    /// Set the size cap.
    pub fn with_max_size(mut self, bytes: u64) -> Self {
        self.max_cache_size_bytes = bytes;
        self
    }

    /// Set the default TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the serializer.
    pub fn with_serializer(mut self, serializer: SerializerKind) -> Self {
        self.serializer = serializer;
        self
    }

    /// Set the metadata store map size.
    pub fn with_metadata_map_size(mut self, bytes: usize) -> Self {
        self.metadata_map_size_bytes = bytes;
        self
    }

    /// Validate the configuration.
    ///
    /// A zero TTL is legal: such entries are born expired.
    pub fn validate(&self) -> CacheResult<()> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(CacheError::InvalidConfiguration(ConfigError::InvalidValue {
                field: "cache_dir".to_string(),
                value: String::new(),
                reason: "cache_dir must not be empty".to_string(),
            }));
        }

        if self.max_cache_size_bytes == 0 {
            return Err(CacheError::InvalidConfiguration(ConfigError::InvalidValue {
                field: "max_cache_size_bytes".to_string(),
                value: self.max_cache_size_bytes.to_string(),
                reason: "max_cache_size_bytes must be greater than 0".to_string(),
            }));
        }

        if self.metadata_map_size_bytes == 0 {
            return Err(CacheError::InvalidConfiguration(ConfigError::InvalidValue {
                field: "metadata_map_size_bytes".to_string(),
                value: self.metadata_map_size_bytes.to_string(),
                reason: "metadata_map_size_bytes must be greater than 0".to_string(),
            }));
        }

        Ok(())
    }

    /// Directory holding the LMDB metadata environment.
    pub fn metadata_dir(&self) -> PathBuf {
        self.cache_dir.join("metadata.store")
    }

    /// Directory holding result blobs.
    pub fn results_dir(&self) -> PathBuf {
        self.cache_dir.join("results")
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

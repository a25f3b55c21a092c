//! Error types for memento operations

use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unknown serializer: {name} (expected one of {expected})")]
    UnknownSerializer { name: String, expected: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Encoding and decoding errors raised by key generation and serializers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SerializationError {
    #[error("Failed to encode value as {format}: {reason}")]
    Encode { format: String, reason: String },

    #[error("Failed to decode {format} payload: {reason}")]
    Decode { format: String, reason: String },
}

/// The four error kinds a host application ever sees.
///
/// Everything below the cache manager is classified into one of these.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The metadata store or the filesystem could not be reached.
    #[error("Storage unavailable: {reason}")]
    StorageUnavailable { reason: String },

    /// A stored blob or metadata row could not be decoded.
    #[error("Corrupt entry {key}: {reason}")]
    CorruptEntry { key: String, reason: String },

    /// The size cap cannot be satisfied even after eviction.
    #[error("Capacity exceeded: {required} bytes required, limit is {limit} bytes")]
    CapacityExceeded { required: u64, limit: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),
}

impl From<SerializationError> for CacheError {
    fn from(e: SerializationError) -> Self {
        CacheError::CorruptEntry {
            key: String::new(),
            reason: e.to_string(),
        }
    }
}

impl CacheError {
    /// Attach the offending key to a `CorruptEntry` that was raised without one.
    pub fn with_key(self, key: impl Into<String>) -> Self {
        match self {
            CacheError::CorruptEntry { key: existing, reason } if existing.is_empty() => {
                CacheError::CorruptEntry {
                    key: key.into(),
                    reason,
                }
            }
            other => other,
        }
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, CacheError::CorruptEntry { .. })
    }
}

/// Result type alias for memento operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================

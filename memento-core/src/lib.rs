//! memento Core - Types, Keys and Encodings
//!
//! Pure building blocks shared by the storage layer: configuration, the
//! error taxonomy, entry metadata, request/result fingerprinting and the
//! pluggable result serializers. Nothing in this crate touches the disk.

pub mod config;
pub mod entry;
pub mod error;
pub mod key;
pub mod serializer;

use chrono::{DateTime, Utc};

pub use config::{
    CacheConfig, DEFAULT_MAX_CACHE_SIZE_BYTES, DEFAULT_METADATA_MAP_SIZE_BYTES, DEFAULT_TTL,
};
pub use entry::CacheEntry;
pub use error::{CacheError, CacheResult, ConfigError, SerializationError};
pub use key::{canonical_json, CacheKey, KeyGenerator, Sha256KeyGenerator, KEY_HEX_LEN};
pub use serializer::{
    CborSerializer, JsonSerializer, MsgPackSerializer, Serializer, SerializerKind,
};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

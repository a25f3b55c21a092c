//! memento Storage - Durable Request/Result Cache
//!
//! Embeds a content-addressed, reference-counted, TTL-expiring cache in the
//! host process. Layout under the cache root:
//!
//! ```text
//! <cache_dir>/
//!   metadata.store/         # LMDB: cache_entries, expiry_index, result_references
//!   results/
//!     <result_key><ext>     # one blob per distinct result
//! ```
//!
//! [`CacheManager`] is the entry point; the lower layers are public for
//! tooling and tests but carry no cross-table guarantees of their own.

pub mod cache_storage;
pub mod error;
mod fs;
pub mod manager;
pub mod memoize;
pub mod metadata;
pub mod reference_counter;
pub mod result_storage;
pub mod sweeper;

pub use cache_storage::{CacheStorage, ExpirySlot};
pub use error::StoreError;
pub use manager::{CacheManager, CacheStats, GcReport};
pub use memoize::Memoized;
pub use metadata::MetadataStore;
pub use reference_counter::ReferenceCounter;
pub use result_storage::{BlobFile, ResultStorage};
pub use sweeper::{sweep_task, SweepConfig, SweepMetrics, SweepSnapshot, DEFAULT_SWEEP_INTERVAL};

// Re-export the core crate so hosts need a single dependency.
pub use memento_core::{
    CacheConfig, CacheEntry, CacheError, CacheKey, CacheResult, ConfigError, KeyGenerator,
    SerializationError, Serializer, SerializerKind, Sha256KeyGenerator,
};

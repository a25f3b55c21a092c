//! memento Test Utilities
//!
//! Centralized test infrastructure for the memento workspace:
//! - Proptest generators for requests and results
//! - Temp-dir backed cache fixtures
//! - Custom assertions for on-disk cache state
//! - One-time tracing setup for tests

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;

// Re-export the types tests reach for most.
pub use memento_core::{
    CacheConfig, CacheEntry, CacheError, CacheKey, CacheResult, KeyGenerator, Serializer,
    SerializerKind, Sha256KeyGenerator,
};
pub use memento_storage::{CacheManager, CacheStats, GcReport};

use serde::Serialize;
use tempfile::TempDir;

/// LMDB map size for test caches; keeps sparse files small.
pub const TEST_MAP_SIZE_BYTES: usize = 10 * 1024 * 1024;

// ============================================================================
// TRACING
// ============================================================================

/// Install a test-friendly subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to `warn`.
pub fn init_test_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for cache requests and results.

    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};
    use serde_json::{Map, Value};

    use super::SerializerKind;

    /// Scalar JSON values.
    ///
    /// Floats are multiples of 1/64 so their decimal text parses back to the
    /// same bits.
    pub fn arb_json_leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            any::<u64>().prop_map(Value::from),
            (-1_000_000i32..1_000_000).prop_map(|n| Value::from(f64::from(n) / 64.0)),
            "[a-z0-9 ]{0,16}".prop_map(Value::String),
        ]
    }

    /// Arbitrary nested JSON values.
    pub fn arb_json_value() -> impl Strategy<Value = Value> {
        arb_json_leaf().prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::btree_map("[a-z_]{1,8}", inner, 0..6)
                    .prop_map(|fields| Value::Object(fields.into_iter().collect::<Map<_, _>>())),
            ]
        })
    }

    /// A request shaped like an RPC call: `{"op": ..., "args": [...]}`.
    pub fn arb_request() -> impl Strategy<Value = Value> {
        (
            "[a-z]{1,10}",
            prop::collection::vec(arb_json_leaf(), 0..5),
        )
            .prop_map(|(op, args)| serde_json::json!({ "op": op, "args": args }))
    }

    /// A typed result payload every serializer can decode.
    pub fn arb_result() -> impl Strategy<Value = (String, Vec<i64>)> {
        ("[a-z]{0,12}", prop::collection::vec(any::<i64>(), 0..8))
    }

    /// A numeric result in one of several Rust widths, written untagged.
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    #[serde(untagged)]
    pub enum Number {
        U8(u8),
        I64(i64),
        F64(f64),
    }

    /// Numbers drawn from small ranges so equal encodings turn up often,
    /// NaN and the infinities included.
    pub fn arb_number() -> impl Strategy<Value = Number> {
        prop_oneof![
            (0u8..8).prop_map(Number::U8),
            (-4i64..8).prop_map(Number::I64),
            prop_oneof![
                Just(f64::NAN),
                Just(f64::INFINITY),
                Just(f64::NEG_INFINITY),
                (-8i32..8).prop_map(|n| f64::from(n) / 2.0),
            ]
            .prop_map(Number::F64),
        ]
    }

    /// Binary strategies only: JSON cannot hold NaN or the infinities.
    pub fn arb_binary_serializer() -> impl Strategy<Value = SerializerKind> {
        prop::sample::select(vec![SerializerKind::MsgPack, SerializerKind::Cbor])
    }

    pub fn arb_serializer() -> impl Strategy<Value = SerializerKind> {
        prop::sample::select(SerializerKind::ALL.to_vec())
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Caches rooted in temporary directories.

    use super::*;

    /// A cache that owns its temporary root; the directory is removed on drop.
    pub struct TestCache {
        cache: CacheManager,
        // Declared after `cache` so the environment closes before the files go.
        dir: TempDir,
    }

    impl TestCache {
        /// Default configuration (msgpack, 500 MiB, 30 days).
        pub fn new() -> Self {
            Self::with_config(|config| config)
        }

        /// Start from the defaults and adjust.
        pub fn with_config(adjust: impl FnOnce(CacheConfig) -> CacheConfig) -> Self {
            init_test_tracing();
            let dir = TempDir::new().expect("TempDir creation should succeed");
            let config = adjust(
                CacheConfig::default_at(dir.path().join("cache"))
                    .with_metadata_map_size(TEST_MAP_SIZE_BYTES),
            );
            let cache = CacheManager::open(config).expect("test cache should open");
            Self { cache, dir }
        }

        pub fn with_serializer(serializer: SerializerKind) -> Self {
            Self::with_config(|config| config.with_serializer(serializer))
        }

        pub fn with_ttl(ttl: Duration) -> Self {
            Self::with_config(|config| config.with_ttl(ttl))
        }

        pub fn with_max_size(bytes: u64) -> Self {
            Self::with_config(|config| config.with_max_size(bytes))
        }

        pub fn root(&self) -> &Path {
            self.dir.path()
        }

        pub fn results_dir(&self) -> PathBuf {
            self.cache.config().results_dir()
        }

        /// Files currently under `results/`, temp files included.
        pub fn blob_files(&self) -> Vec<PathBuf> {
            let mut files: Vec<PathBuf> = std::fs::read_dir(self.results_dir())
                .expect("results dir should be readable")
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| path.is_file())
                .collect();
            files.sort();
            files
        }

        pub fn blob_count(&self) -> usize {
            self.blob_files().len()
        }

        /// Blob path for a result value.
        pub fn blob_path<R: Serialize + ?Sized>(&self, result: &R) -> PathBuf {
            let key = self.cache.result_key_for(result).expect("result should be encodable");
            self.cache.result_path(&key)
        }

        /// Close the cache and open it again on the same root.
        pub fn reopen(self) -> Self {
            let Self { cache, dir } = self;
            let config = cache.config().clone();
            drop(cache);
            let cache = CacheManager::open(config).expect("test cache should reopen");
            Self { cache, dir }
        }

        pub fn into_parts(self) -> (CacheManager, TempDir) {
            (self.cache, self.dir)
        }
    }

    impl Default for TestCache {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Deref for TestCache {
        type Target = CacheManager;

        fn deref(&self) -> &CacheManager {
            &self.cache
        }
    }

    /// The request from the summing example.
    pub fn sum_request(args: &[i64]) -> serde_json::Value {
        serde_json::json!({ "op": "sum", "args": args })
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over cache state as a host would observe it.

    use super::*;

    /// Assert that the blob for `result` exists on disk.
    #[track_caller]
    pub fn assert_blob_exists<R: Serialize + ?Sized>(cache: &CacheManager, result: &R) {
        let key = cache.result_key_for(result).expect("result should be encodable");
        let path = cache.result_path(&key);
        assert!(path.is_file(), "Expected blob at {}", path.display());
    }

    /// Assert that no blob for `result` exists on disk.
    #[track_caller]
    pub fn assert_blob_absent<R: Serialize + ?Sized>(cache: &CacheManager, result: &R) {
        let key = cache.result_key_for(result).expect("result should be encodable");
        let path = cache.result_path(&key);
        assert!(!path.exists(), "Expected no blob at {}", path.display());
    }

    /// Assert the reference count of `result`.
    #[track_caller]
    pub fn assert_reference_count<R: Serialize + ?Sized>(
        cache: &CacheManager,
        result: &R,
        expected: u64,
    ) {
        let key = cache.result_key_for(result).expect("result should be encodable");
        let count = cache
            .reference_count(&key)
            .expect("reference count should be readable");
        assert_eq!(count, expected, "Wrong reference count for {key}");
    }

    /// Assert that a CacheResult is a CapacityExceeded error.
    #[track_caller]
    pub fn assert_capacity_exceeded<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::CapacityExceeded { .. }) => {}
            other => panic!("Expected CapacityExceeded error, got: {:?}", other),
        }
    }

    /// Assert that a CacheResult is an InvalidConfiguration error.
    #[track_caller]
    pub fn assert_invalid_configuration<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::InvalidConfiguration(_)) => {}
            other => panic!("Expected InvalidConfiguration error, got: {:?}", other),
        }
    }

    /// Assert that a CacheResult is a CorruptEntry error.
    #[track_caller]
    pub fn assert_corrupt<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::CorruptEntry { .. }) => {}
            other => panic!("Expected CorruptEntry error, got: {:?}", other),
        }
    }

    /// Assert that garbage collection finds nothing to repair.
    #[track_caller]
    pub fn assert_converged(cache: &CacheManager) {
        let report = cache.collect_garbage().expect("garbage collection should succeed");
        assert!(report.is_clean(), "Expected converged state, gc repaired: {:?}", report);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fixture_creates_layout() {
        let cache = fixtures::TestCache::new();
        assert!(cache.results_dir().is_dir());
        assert!(cache.config().metadata_dir().join("data.mdb").exists());
        assert_eq!(cache.blob_count(), 0);
    }

    #[test]
    fn test_reopen_keeps_entries() {
        let cache = fixtures::TestCache::new();
        cache
            .put(&fixtures::sum_request(&[1, 2]), &3i64)
            .expect("put should succeed");

        let cache = cache.reopen();
        let hit: Option<i64> = cache.get(&fixtures::sum_request(&[1, 2]));
        assert_eq!(hit, Some(3));
    }

    #[test]
    fn test_assertion_capacity_exceeded() {
        let result: CacheResult<()> = Err(CacheError::CapacityExceeded {
            required: 10,
            limit: 5,
        });
        assertions::assert_capacity_exceeded(&result);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_generated_requests_are_objects(request in generators::arb_request()) {
            prop_assert!(request.get("op").is_some());
            prop_assert!(request.get("args").is_some_and(|args| args.is_array()));
        }

        #[test]
        fn prop_generated_values_have_stable_keys(value in generators::arb_json_value()) {
            let first = Sha256KeyGenerator.generate_key(&value).expect("json values are keyable");
            let second = Sha256KeyGenerator.generate_key(&value.clone()).expect("json values are keyable");
            prop_assert_eq!(first, second);
        }
    }
}

//! Cache orchestration: lookup, store, expire and reclaim.
//!
//! The metadata store's write transaction is the commit point for every
//! mutation. Blob files are written and deleted while that transaction is
//! held, so no other writer (in this process or another one) can observe a
//! reference count that disagrees with the files on disk.
//!
//! # Consistency
//!
//! - `put` writes the blob, replaces the entry, moves the expiry slot,
//!   increments the new result and releases the old one in one transaction
//! - a release that drops a count to zero deletes the blob
//! - a failed `put` aborts and removes a blob it created
//! - rows whose blob is missing or damaged are discarded on `get`; an intact
//!   blob read back as the wrong type is a miss and is left alone

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use heed::RwTxn;
use memento_core::{
    CacheConfig, CacheEntry, CacheError, CacheKey, CacheResult, KeyGenerator, SerializationError,
    Sha256KeyGenerator, Timestamp,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache_storage::{expiry_key, ExpirySlot};
use crate::error::StoreError;
use crate::metadata::MetadataStore;
use crate::result_storage::{BlobFile, ResultStorage};

/// Point-in-time view of the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Rows in `cache_entries`, expired ones included until swept.
    pub entry_count: u64,
    /// Rows in `result_references`.
    pub result_count: u64,
    /// Bytes held by result blobs.
    pub total_bytes: u64,
    /// Lookups served from the cache by this handle.
    pub hits: u64,
    /// Lookups that missed (including failed lookups).
    pub misses: u64,
    /// Entries evicted to make room under the size cap.
    pub evictions: u64,
    /// Expired entries removed by sweeps.
    pub reaped: u64,
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

/// What a garbage collection pass repaired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Undecodable entry rows deleted.
    pub entries_removed: u64,
    /// Counter rows rewritten, created or deleted to match live entries.
    pub counters_repaired: u64,
    /// Expiry index keys without a matching entry.
    pub index_keys_dropped: u64,
    /// Live entries whose expiry index key was missing.
    pub index_keys_restored: u64,
    /// Result blobs with no counter row.
    pub blobs_removed: u64,
    /// Temp files and foreign files under the results directory.
    pub strays_removed: u64,
    pub bytes_freed: u64,
}

impl GcReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    reaped: AtomicU64,
}

enum Lookup<R> {
    Hit(R),
    Miss,
    /// The blob is intact but does not decode as the requested type.
    Mismatch(StoreError),
    /// The row or its blob is unreadable. `entry` is the row when it decoded.
    Corrupt {
        entry: Option<CacheEntry>,
        error: StoreError,
    },
}

/// Content-addressed, reference-counted, TTL-expiring result cache.
///
/// Safe to share across threads (`Arc<CacheManager>`) and to open from
/// several processes on the same cache directory.
pub struct CacheManager<K: KeyGenerator = Sha256KeyGenerator> {
    config: CacheConfig,
    metadata: MetadataStore,
    results: ResultStorage,
    key_generator: K,
    /// Serializes writers inside this process; LMDB serializes across processes.
    write_lock: Mutex<()>,
    counters: Counters,
}

impl CacheManager<Sha256KeyGenerator> {
    /// Open (or create) the cache rooted at `config.cache_dir`.
    ///
    /// # Errors
    ///
    /// - `InvalidConfiguration` if the configuration fails validation; no
    ///   I/O happens in that case
    /// - `StorageUnavailable` if the directories or the metadata store
    ///   cannot be created or opened
    pub fn open(config: CacheConfig) -> CacheResult<Self> {
        Self::with_key_generator(config, Sha256KeyGenerator)
    }
}

impl<K: KeyGenerator> CacheManager<K> {
    /// Open the cache with a custom fingerprinting strategy.
    pub fn with_key_generator(config: CacheConfig, key_generator: K) -> CacheResult<Self> {
        config.validate()?;

        std::fs::create_dir_all(&config.cache_dir)
            .map_err(|e| StoreError::io(&config.cache_dir, e))?;
        let metadata = MetadataStore::open(config.metadata_dir(), config.metadata_map_size_bytes)?;
        let results = ResultStorage::new(config.results_dir(), config.serializer)?;

        tracing::info!(
            cache_dir = %config.cache_dir.display(),
            max_cache_size_bytes = config.max_cache_size_bytes,
            default_ttl_secs = config.default_ttl.as_secs(),
            serializer = %config.serializer,
            "Cache opened"
        );

        Ok(Self {
            config,
            metadata,
            results,
            key_generator,
            write_lock: Mutex::new(()),
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Fingerprint any serializable value with this cache's key generator.
    pub fn key_for<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<CacheKey> {
        Ok(self.key_generator.generate_key(value)?)
    }

    /// Key a result is stored under: the SHA-256 of its encoded bytes.
    ///
    /// Results only share a blob when this cache's serializer writes them
    /// byte-for-byte identically.
    pub fn result_key_for<R: Serialize + ?Sized>(&self, result: &R) -> CacheResult<CacheKey> {
        let bytes = self.results.encode(result)?;
        Ok(ResultStorage::key_for_bytes(&bytes))
    }

    /// Where the blob for `result_key` lives (whether or not it exists).
    pub fn result_path(&self, result_key: &CacheKey) -> PathBuf {
        self.results.path_for(result_key)
    }

    // ========================================================================
    // LOOKUP
    // ========================================================================

    /// Look up the cached result for `request`.
    ///
    /// Never fails: storage errors and corrupt rows are logged and reported
    /// as a miss. Corrupt rows are removed so they do not recur.
    pub fn get<Q, R>(&self, request: &Q) -> Option<R>
    where
        Q: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        match self.try_get(request) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, "Cache lookup failed, treating as miss");
                None
            }
        }
    }

    /// Like [`CacheManager::get`] but reports why a lookup failed.
    ///
    /// A corrupt row is still discarded before the error is returned.
    pub fn try_get<Q, R>(&self, request: &Q) -> CacheResult<Option<R>>
    where
        Q: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let request_key = match self.key_for(request) {
            Ok(key) => key,
            Err(e) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let outcome = self.lookup(&request_key);
        match outcome {
            Ok(Lookup::Hit(result)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(request_key = %request_key, "Cache hit");
                Ok(Some(result))
            }
            Ok(Lookup::Miss) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(request_key = %request_key, "Cache miss");
                Ok(None)
            }
            Ok(Lookup::Mismatch(error)) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    request_key = %request_key,
                    error = %error,
                    "Cached result does not match the requested type, treating as miss"
                );
                Ok(None)
            }
            Ok(Lookup::Corrupt { entry, error }) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    request_key = %request_key,
                    error = %error,
                    "Discarding corrupt cache entry"
                );
                self.discard_corrupt(&request_key, entry.as_ref());
                Err(CacheError::from(error).with_key(request_key.as_str()))
            }
            Err(e) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    fn lookup<R: DeserializeOwned>(&self, request_key: &CacheKey) -> Result<Lookup<R>, StoreError> {
        let row = {
            let rtxn = self.metadata.read_txn()?;
            self.metadata.entries().get_in(&rtxn, request_key)
        };
        let entry = match row {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(Lookup::Miss),
            Err(error) if error.is_corrupt() => return Ok(Lookup::Corrupt { entry: None, error }),
            Err(e) => return Err(e),
        };

        // Expired rows stay until a sweep; they are simply invisible.
        if entry.is_expired(Utc::now()) {
            return Ok(Lookup::Miss);
        }

        let Some(bytes) = self.results.get_bytes(&entry.result_key)? else {
            let error = StoreError::Malformed {
                key: request_key.to_string(),
                reason: format!("result blob {} is missing", entry.result_key),
            };
            return Ok(Lookup::Corrupt {
                entry: Some(entry),
                error,
            });
        };

        match self.results.decode::<R>(&bytes) {
            Ok(result) => Ok(Lookup::Hit(result)),
            Err(error) if self.results.is_well_formed(&bytes) => Ok(Lookup::Mismatch(error)),
            Err(error) => Ok(Lookup::Corrupt {
                entry: Some(entry),
                error,
            }),
        }
    }

    /// Stored row for `request`, expired or not.
    pub fn entry<Q: Serialize + ?Sized>(&self, request: &Q) -> CacheResult<Option<CacheEntry>> {
        let request_key = self.key_for(request)?;
        Ok(self.metadata.entries().get(&request_key)?)
    }

    /// Number of live entries referencing `result_key` (0 when none).
    pub fn reference_count(&self, result_key: &CacheKey) -> CacheResult<u64> {
        Ok(self.metadata.references().count(result_key)?)
    }

    // ========================================================================
    // STORE
    // ========================================================================

    /// Cache `result` for `request` with the configured default TTL.
    pub fn put<Q, R>(&self, request: &Q, result: &R) -> CacheResult<()>
    where
        Q: Serialize + ?Sized,
        R: Serialize + ?Sized,
    {
        self.put_with_ttl(request, result, self.config.default_ttl)
    }

    /// Cache `result` for `request`, expiring `ttl` from now.
    ///
    /// # Errors
    ///
    /// - `CapacityExceeded` if the result cannot fit under the size cap even
    ///   after sweeping and evicting; nothing is written
    /// - `StorageUnavailable` if the metadata store or filesystem fails; the
    ///   transaction is rolled back and a newly created blob is removed
    /// - `CorruptEntry` if the request or result cannot be encoded (this
    ///   includes NaN or infinite floats in the request)
    pub fn put_with_ttl<Q, R>(&self, request: &Q, result: &R, ttl: Duration) -> CacheResult<()>
    where
        Q: Serialize + ?Sized,
        R: Serialize + ?Sized,
    {
        let request_key = self.key_for(request)?;
        let request_value = serde_json::to_value(request).map_err(|e| {
            CacheError::from(SerializationError::Encode {
                format: "json".to_string(),
                reason: e.to_string(),
            })
            .with_key(request_key.as_str())
        })?;
        let bytes = self
            .results
            .encode(result)
            .map_err(|e| CacheError::from(e).with_key(request_key.as_str()))?;
        let result_key = ResultStorage::key_for_bytes(&bytes);

        let _guard = self.lock();

        // A blob that is already on disk adds no bytes.
        if !self.results.contains(&result_key) {
            self.ensure_capacity(bytes.len() as u64)?;
        }

        let entry = CacheEntry::new(request_key, request_value, result_key, Utc::now(), ttl);
        self.commit_put(&entry, &bytes)?;

        tracing::debug!(
            request_key = %entry.request_key,
            result_key = %entry.result_key,
            size_bytes = bytes.len(),
            expires_at = %entry.expires_at,
            "Cached result"
        );
        Ok(())
    }

    fn commit_put(&self, entry: &CacheEntry, bytes: &[u8]) -> Result<(), StoreError> {
        let mut wtxn = self.metadata.write_txn()?;
        let created_blob = !self.results.contains(&entry.result_key);

        if let Err(e) = self.put_in(&mut wtxn, entry, bytes) {
            wtxn.abort();
            self.rollback_blob(created_blob, &entry.result_key);
            return Err(e);
        }
        if let Err(e) = wtxn.commit() {
            self.rollback_blob(created_blob, &entry.result_key);
            return Err(e.into());
        }
        Ok(())
    }

    /// Blob write, replace-then-release, all inside `wtxn`.
    fn put_in(&self, wtxn: &mut RwTxn, entry: &CacheEntry, bytes: &[u8]) -> Result<(), StoreError> {
        self.results.ensure_bytes(&entry.result_key, bytes)?;

        let references = self.metadata.references();
        match self.metadata.entries().put_in(wtxn, entry)? {
            Some(previous) if previous.result_key == entry.result_key => {
                if references.count_in(wtxn, &entry.result_key)? == 0 {
                    tracing::warn!(
                        result_key = %entry.result_key,
                        "Reference count missing for a live entry, restoring"
                    );
                    references.increment_in(wtxn, &entry.result_key)?;
                }
            }
            Some(previous) => {
                references.increment_in(wtxn, &entry.result_key)?;
                self.release_in(wtxn, &previous.result_key)?;
            }
            None => {
                references.increment_in(wtxn, &entry.result_key)?;
            }
        }
        Ok(())
    }

    fn rollback_blob(&self, created_blob: bool, result_key: &CacheKey) {
        if created_blob {
            if let Err(e) = self.results.delete(result_key) {
                tracing::warn!(
                    result_key = %result_key,
                    error = %e,
                    "Failed to remove blob after aborted put"
                );
            }
        }
    }

    /// Compute on miss, store, and return.
    pub fn get_or_compute<Q, R, F>(&self, request: &Q, compute: F) -> CacheResult<R>
    where
        Q: Serialize + ?Sized,
        R: Serialize + DeserializeOwned,
        F: FnOnce(&Q) -> R,
    {
        if let Some(cached) = self.get(request) {
            return Ok(cached);
        }
        let result = compute(request);
        self.put(request, &result)?;
        Ok(result)
    }

    // ========================================================================
    // REMOVAL
    // ========================================================================

    /// Remove the entry for `request`, releasing its result.
    ///
    /// Returns whether an entry was removed.
    pub fn invalidate<Q: Serialize + ?Sized>(&self, request: &Q) -> CacheResult<bool> {
        let request_key = self.key_for(request)?;
        let _guard = self.lock();

        let mut wtxn = self.metadata.write_txn()?;
        let removed = match self.reap_in(&mut wtxn, &request_key) {
            Ok(reaped) => reaped.is_some(),
            Err(e) if e.is_corrupt() => {
                tracing::warn!(request_key = %request_key, error = %e, "Invalidating corrupt cache entry");
                self.metadata
                    .entries()
                    .delete_raw_in(&mut wtxn, request_key.as_str())?
            }
            Err(e) => return Err(e.into()),
        };
        wtxn.commit().map_err(StoreError::from)?;

        tracing::debug!(request_key = %request_key, removed, "Invalidated cache entry");
        Ok(removed)
    }

    /// Remove every entry whose expiry has passed. Returns the number reaped.
    pub fn sweep_expired(&self) -> CacheResult<u64> {
        let _guard = self.lock();
        Ok(self.sweep_locked(Utc::now())?)
    }

    fn sweep_locked(&self, now: Timestamp) -> Result<u64, StoreError> {
        let mut wtxn = self.metadata.write_txn()?;
        let slots = self.metadata.entries().expired_in(&wtxn, now)?;

        let mut reaped = 0u64;
        for slot in &slots {
            if self.reap_slot_in(&mut wtxn, slot)?.is_some() {
                reaped += 1;
            }
        }
        wtxn.commit()?;

        self.counters.reaped.fetch_add(reaped, Ordering::Relaxed);
        if reaped > 0 {
            tracing::info!(reaped, "Expired cache entries swept");
        } else {
            tracing::debug!("Sweep completed with no expired entries");
        }
        Ok(reaped)
    }

    /// Remove every entry, counter and blob. Returns the number of entries removed.
    pub fn clear(&self) -> CacheResult<u64> {
        let _guard = self.lock();

        let mut wtxn = self.metadata.write_txn()?;
        let removed = self.metadata.entries().len_in(&wtxn)?;
        self.metadata.entries().clear_in(&mut wtxn)?;
        self.metadata.references().clear_in(&mut wtxn)?;
        for file in self.results.list()? {
            match file {
                BlobFile::Result { key, .. } => {
                    self.results.remove(&key)?;
                }
                BlobFile::Stray { path, .. } => {
                    self.results.remove_stray(&path);
                }
            }
        }
        wtxn.commit().map_err(StoreError::from)?;

        tracing::info!(removed, "Cache cleared");
        Ok(removed)
    }

    // ========================================================================
    // CAPACITY
    // ========================================================================

    /// Make room for `incoming` new blob bytes. Caller holds the write lock.
    fn ensure_capacity(&self, incoming: u64) -> CacheResult<()> {
        let limit = self.config.max_cache_size_bytes;
        if incoming > limit {
            return Err(CacheError::CapacityExceeded {
                required: incoming,
                limit,
            });
        }

        let mut total = self.results.total_size()?;
        if total.saturating_add(incoming) <= limit {
            return Ok(());
        }

        self.sweep_locked(Utc::now())?;
        // Blobs nothing references can never be freed by eviction.
        self.reclaim_orphans()?;
        total = self.results.total_size()?;

        let mut evicted = 0u64;
        while total.saturating_add(incoming) > limit {
            match self.evict_next()? {
                Some(freed) => {
                    total = total.saturating_sub(freed);
                    evicted += 1;
                }
                None => {
                    return Err(CacheError::CapacityExceeded {
                        required: total.saturating_add(incoming),
                        limit,
                    });
                }
            }
        }

        if evicted > 0 {
            tracing::info!(evicted, total_bytes = total, limit, "Evicted entries to fit size cap");
        }
        Ok(())
    }

    /// Delete every blob without a counter row. Returns the bytes freed.
    fn reclaim_orphans(&self) -> Result<u64, StoreError> {
        let wtxn = self.metadata.write_txn()?;
        let (removed, freed) = self.remove_orphans_in(&wtxn)?;
        wtxn.abort();

        if removed > 0 {
            tracing::info!(removed, bytes_freed = freed, "Removed unreferenced result blobs");
        }
        Ok(freed)
    }

    /// Evict the earliest-expiring entry in its own transaction.
    ///
    /// Returns the bytes freed, or `None` when the index is empty.
    fn evict_next(&self) -> Result<Option<u64>, StoreError> {
        let mut wtxn = self.metadata.write_txn()?;
        let Some(slot) = self.metadata.entries().first_slot_in(&wtxn)? else {
            return Ok(None);
        };
        let freed = self.reap_slot_in(&mut wtxn, &slot)?;
        wtxn.commit()?;

        if freed.is_some() {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Some(freed.unwrap_or(0)))
    }

    // ========================================================================
    // TRANSACTION-SCOPED HELPERS
    // ========================================================================

    /// Reap the entry an expiry slot points at.
    ///
    /// Returns the bytes freed, or `None` when the slot was stale and only
    /// the slot itself was dropped.
    fn reap_slot_in(&self, wtxn: &mut RwTxn, slot: &ExpirySlot) -> Result<Option<u64>, StoreError> {
        let entries = self.metadata.entries();
        let Some(request_key) = &slot.request_key else {
            entries.delete_slot_in(wtxn, &slot.index_key)?;
            return Ok(None);
        };

        match entries.get_in(wtxn, request_key) {
            Ok(Some(entry)) if expiry_key(entry.expires_at, &entry.request_key) == slot.index_key => {
                Ok(self.reap_in(wtxn, request_key)?.map(|(_, freed)| freed))
            }
            Ok(_) => {
                entries.delete_slot_in(wtxn, &slot.index_key)?;
                Ok(None)
            }
            Err(e) if e.is_corrupt() => {
                tracing::warn!(request_key = %request_key, error = %e, "Reaping corrupt cache entry");
                entries.delete_raw_in(wtxn, request_key.as_str())?;
                entries.delete_slot_in(wtxn, &slot.index_key)?;
                Ok(Some(0))
            }
            Err(e) => Err(e),
        }
    }

    /// Delete the entry and release its result. Returns the removed entry
    /// and the bytes freed.
    fn reap_in(
        &self,
        wtxn: &mut RwTxn,
        request_key: &CacheKey,
    ) -> Result<Option<(CacheEntry, u64)>, StoreError> {
        let Some(entry) = self.metadata.entries().delete_in(wtxn, request_key)? else {
            return Ok(None);
        };
        let freed = self.release_in(wtxn, &entry.result_key)?;
        Ok(Some((entry, freed)))
    }

    /// Decrement `result_key`; at zero delete its blob. Returns the bytes freed.
    fn release_in(&self, wtxn: &mut RwTxn, result_key: &CacheKey) -> Result<u64, StoreError> {
        if self.metadata.references().decrement_in(wtxn, result_key)? > 0 {
            return Ok(0);
        }
        match self.results.remove(result_key) {
            Ok(freed) => Ok(freed),
            Err(e) => {
                // The orphan is picked up by garbage collection.
                tracing::warn!(result_key = %result_key, error = %e, "Failed to delete unreferenced blob");
                Ok(0)
            }
        }
    }

    /// Delete blobs whose counter row is absent. Holding `wtxn` keeps other
    /// writers from referencing a blob while it is removed.
    ///
    /// Returns the number of blobs removed and the bytes freed.
    fn remove_orphans_in(&self, wtxn: &RwTxn) -> Result<(u64, u64), StoreError> {
        let references = self.metadata.references();
        let (mut removed, mut freed) = (0u64, 0u64);
        for file in self.results.list()? {
            let BlobFile::Result { key, .. } = file else {
                continue;
            };
            if references.count_in(wtxn, &key)? == 0 {
                freed += self.results.remove(&key)?;
                removed += 1;
            }
        }
        Ok((removed, freed))
    }

    /// Best-effort removal of a row that failed to read.
    ///
    /// Only deletes when the row is still the one that was observed, so a
    /// concurrent `put` that already replaced it is left alone.
    fn discard_corrupt(&self, request_key: &CacheKey, observed: Option<&CacheEntry>) {
        let _guard = self.lock();
        match self.discard_corrupt_locked(request_key, observed) {
            Ok(true) => tracing::debug!(request_key = %request_key, "Corrupt cache entry removed"),
            Ok(false) => {}
            Err(e) => tracing::warn!(
                request_key = %request_key,
                error = %e,
                "Failed to remove corrupt cache entry"
            ),
        }
    }

    fn discard_corrupt_locked(
        &self,
        request_key: &CacheKey,
        observed: Option<&CacheEntry>,
    ) -> Result<bool, StoreError> {
        let mut wtxn = self.metadata.write_txn()?;
        let removed = match (self.metadata.entries().get_in(&wtxn, request_key), observed) {
            (Ok(Some(current)), Some(observed)) if current == *observed => {
                self.reap_in(&mut wtxn, request_key)?.is_some()
            }
            (Err(e), None) if e.is_corrupt() => self
                .metadata
                .entries()
                .delete_raw_in(&mut wtxn, request_key.as_str())?,
            (Err(e), _) if !e.is_corrupt() => return Err(e),
            _ => false,
        };
        wtxn.commit()?;
        Ok(removed)
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    /// Current sizes plus this handle's hit/miss/eviction counters.
    pub fn stats(&self) -> CacheResult<CacheStats> {
        let (entry_count, result_count) = {
            let rtxn = self.metadata.read_txn()?;
            (
                self.metadata.entries().len_in(&rtxn)?,
                self.metadata.references().len_in(&rtxn)?,
            )
        };
        Ok(CacheStats {
            entry_count,
            result_count,
            total_bytes: self.results.total_size()?,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            reaped: self.counters.reaped.load(Ordering::Relaxed),
        })
    }

    /// Rebuild reference counts and the expiry index from the entry rows,
    /// then delete blobs nothing references.
    ///
    /// Converges state left behind by crashes between a commit and its
    /// file operations.
    pub fn collect_garbage(&self) -> CacheResult<GcReport> {
        let _guard = self.lock();
        let entries = self.metadata.entries();
        let references = self.metadata.references();
        let mut report = GcReport::default();

        let mut wtxn = self.metadata.write_txn()?;

        let mut live: HashMap<String, CacheEntry> = HashMap::new();
        let mut expected: BTreeMap<String, u64> = BTreeMap::new();
        for (request_key, bytes) in entries.raw_rows_in(&wtxn)? {
            match serde_json::from_slice::<CacheEntry>(&bytes) {
                Ok(entry) if entry.request_key.as_str() == request_key => {
                    *expected.entry(entry.result_key.to_string()).or_default() += 1;
                    live.insert(request_key, entry);
                }
                _ => {
                    entries.delete_raw_in(&mut wtxn, &request_key)?;
                    report.entries_removed += 1;
                }
            }
        }

        for (result_key, count) in references.rows_in(&wtxn)? {
            let wanted = expected.remove(&result_key).unwrap_or(0);
            if count != Some(wanted) {
                references.set_in(&mut wtxn, &result_key, wanted)?;
                report.counters_repaired += 1;
            }
        }
        for (result_key, wanted) in expected {
            references.set_in(&mut wtxn, &result_key, wanted)?;
            report.counters_repaired += 1;
        }

        let mut indexed = HashSet::new();
        for slot in entries.slots_in(&wtxn)? {
            let valid = slot
                .request_key
                .as_ref()
                .and_then(|key| live.get(key.as_str()))
                .is_some_and(|entry| expiry_key(entry.expires_at, &entry.request_key) == slot.index_key);
            if valid {
                indexed.insert(slot.index_key);
            } else {
                entries.delete_slot_in(&mut wtxn, &slot.index_key)?;
                report.index_keys_dropped += 1;
            }
        }
        for entry in live.values() {
            if !indexed.contains(&expiry_key(entry.expires_at, &entry.request_key)) {
                entries.put_slot_in(&mut wtxn, entry)?;
                report.index_keys_restored += 1;
            }
        }

        let (blobs_removed, blob_bytes) = self.remove_orphans_in(&wtxn)?;
        report.blobs_removed = blobs_removed;
        report.bytes_freed += blob_bytes;
        for file in self.results.list()? {
            if let BlobFile::Stray { path, size_bytes } = file {
                if self.results.remove_stray(&path) {
                    report.strays_removed += 1;
                    report.bytes_freed += size_bytes;
                }
            }
        }

        wtxn.commit().map_err(StoreError::from)?;

        if report.is_clean() {
            tracing::debug!("Garbage collection found nothing to repair");
        } else {
            tracing::info!(
                entries_removed = report.entries_removed,
                counters_repaired = report.counters_repaired,
                index_keys_dropped = report.index_keys_dropped,
                index_keys_restored = report.index_keys_restored,
                blobs_removed = report.blobs_removed,
                strays_removed = report.strays_removed,
                bytes_freed = report.bytes_freed,
                "Garbage collection repaired cache state"
            );
        }
        Ok(report)
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

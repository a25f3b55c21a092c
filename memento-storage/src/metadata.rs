//! LMDB-backed metadata store.
//!
//! Uses the heed crate (Rust bindings for LMDB) for the transactional index
//! of cache entries and result reference counts.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions and allows a single writer at a time
//! across every process that opens the same environment:
//! - Read transactions for lookups never observe a half-written row
//! - A write transaction is the commit point for any change spanning the
//!   entry table, the expiry index and the reference counts

use std::path::Path;

use heed::{Env, EnvOpenOptions, RoTxn, RwTxn};

use crate::cache_storage::CacheStorage;
use crate::error::StoreError;
use crate::reference_counter::ReferenceCounter;

/// Named databases inside the environment.
pub(crate) const ENTRIES_DB: &str = "cache_entries";
pub(crate) const EXPIRY_DB: &str = "expiry_index";
pub(crate) const REFERENCES_DB: &str = "result_references";

/// The `metadata.store` environment and its tables.
pub struct MetadataStore {
    env: Env,
    entries: CacheStorage,
    references: ReferenceCounter,
}

impl MetadataStore {
    /// Open or create the metadata store.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `map_size_bytes` - Maximum size of the memory map
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the LMDB
    /// environment or its databases cannot be opened.
    pub fn open(path: impl AsRef<Path>, map_size_bytes: usize) -> Result<Self, StoreError> {
        let path = path.as_ref();
        std::fs::create_dir_all(path).map_err(|e| StoreError::io(path, e))?;

        // SAFETY: the environment directory is owned by this cache root and
        // only ever opened through this constructor.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size_bytes)
                .max_dbs(3)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let entries = env.create_database(&mut wtxn, Some(ENTRIES_DB))?;
        let expiry = env.create_database(&mut wtxn, Some(EXPIRY_DB))?;
        let counts = env.create_database(&mut wtxn, Some(REFERENCES_DB))?;
        wtxn.commit()?;

        Ok(Self {
            entries: CacheStorage::new(env.clone(), entries, expiry),
            references: ReferenceCounter::new(env.clone(), counts),
            env,
        })
    }

    pub fn read_txn(&self) -> Result<RoTxn<'_>, StoreError> {
        Ok(self.env.read_txn()?)
    }

    /// Begin the single cross-process write transaction.
    ///
    /// Blocks while another writer holds it.
    pub fn write_txn(&self) -> Result<RwTxn<'_>, StoreError> {
        Ok(self.env.write_txn()?)
    }

    pub fn entries(&self) -> &CacheStorage {
        &self.entries
    }

    pub fn references(&self) -> &ReferenceCounter {
        &self.references
    }

    /// Flush the environment to disk.
    pub fn force_sync(&self) -> Result<(), StoreError> {
        Ok(self.env.force_sync()?)
    }
}

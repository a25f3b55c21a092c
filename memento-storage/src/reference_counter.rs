//! Durable reference counts per result key.
//!
//! The counter row's existence is the single source of truth for "is anyone
//! still referencing this blob". A decrement that reaches zero deletes the
//! row and hands blob deletion back to the caller.

use heed::types::{Bytes, SerdeBincode, Str};
use heed::{Database, Env, RoTxn, RwTxn};
use memento_core::CacheKey;

use crate::error::StoreError;

/// The `result_references` table.
#[derive(Clone)]
pub struct ReferenceCounter {
    env: Env,
    counts: Database<Str, SerdeBincode<u64>>,
}

impl ReferenceCounter {
    pub(crate) fn new(env: Env, counts: Database<Str, SerdeBincode<u64>>) -> Self {
        Self { env, counts }
    }

    /// Create the counter at 1 or add 1, in one committed transaction.
    pub fn increment(&self, result_key: &CacheKey) -> Result<u64, StoreError> {
        let mut wtxn = self.env.write_txn()?;
        let count = self.increment_in(&mut wtxn, result_key)?;
        wtxn.commit()?;
        Ok(count)
    }

    /// Subtract 1 in one committed transaction; returns the new count.
    ///
    /// At zero the row is deleted and 0 is returned. The caller then owns
    /// deleting the blob.
    pub fn decrement(&self, result_key: &CacheKey) -> Result<u64, StoreError> {
        let mut wtxn = self.env.write_txn()?;
        let count = self.decrement_in(&mut wtxn, result_key)?;
        wtxn.commit()?;
        Ok(count)
    }

    /// Current count, 0 when no row exists.
    pub fn count(&self, result_key: &CacheKey) -> Result<u64, StoreError> {
        let rtxn = self.env.read_txn()?;
        self.count_in(&rtxn, result_key)
    }

    pub fn increment_in(&self, wtxn: &mut RwTxn, result_key: &CacheKey) -> Result<u64, StoreError> {
        let count = self.count_in(wtxn, result_key)?.saturating_add(1);
        self.counts.put(wtxn, result_key.as_str(), &count)?;
        Ok(count)
    }

    pub fn decrement_in(&self, wtxn: &mut RwTxn, result_key: &CacheKey) -> Result<u64, StoreError> {
        let count = self.count_in(wtxn, result_key)?.saturating_sub(1);
        if count == 0 {
            self.counts.delete(wtxn, result_key.as_str())?;
        } else {
            self.counts.put(wtxn, result_key.as_str(), &count)?;
        }
        Ok(count)
    }

    pub fn count_in(&self, txn: &RoTxn, result_key: &CacheKey) -> Result<u64, StoreError> {
        match self.counts.get(txn, result_key.as_str()) {
            Ok(count) => Ok(count.unwrap_or(0)),
            Err(heed::Error::Decoding(reason)) => Err(StoreError::Malformed {
                key: result_key.to_string(),
                reason: reason.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Overwrite a counter; zero deletes the row.
    pub fn set_in(&self, wtxn: &mut RwTxn, result_key: &str, count: u64) -> Result<(), StoreError> {
        if count == 0 {
            self.counts
                .remap_data_type::<Bytes>()
                .delete(wtxn, result_key)?;
        } else {
            self.counts.put(wtxn, result_key, &count)?;
        }
        Ok(())
    }

    /// Every counter row. Rows that fail to decode are reported as `None`.
    pub fn rows_in(&self, txn: &RoTxn) -> Result<Vec<(String, Option<u64>)>, StoreError> {
        let keys = {
            let mut keys = Vec::new();
            for item in self.counts.remap_data_type::<Bytes>().iter(txn)? {
                let (key, _) = item?;
                keys.push(key.to_string());
            }
            keys
        };
        Ok(keys
            .into_iter()
            .map(|key| {
                let count = self.counts.get(txn, &key).ok().flatten();
                (key, count)
            })
            .collect())
    }

    pub fn len_in(&self, txn: &RoTxn) -> Result<u64, StoreError> {
        Ok(self.counts.len(txn)?)
    }

    pub fn clear_in(&self, wtxn: &mut RwTxn) -> Result<(), StoreError> {
        Ok(self.counts.clear(wtxn)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_test_store() -> (MetadataStore, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let store = MetadataStore::open(temp_dir.path().join("metadata.store"), 10 * 1024 * 1024)
            .expect("store creation should succeed");
        (store, temp_dir)
    }

    #[test]
    fn test_increment_creates_at_one() {
        let (store, _temp_dir) = create_test_store();
        let key = CacheKey::from_bytes(b"result");
        assert_eq!(store.references().count(&key).expect("count"), 0);
        assert_eq!(store.references().increment(&key).expect("increment"), 1);
        assert_eq!(store.references().increment(&key).expect("increment"), 2);
        assert_eq!(store.references().count(&key).expect("count"), 2);
    }

    #[test]
    fn test_decrement_to_zero_deletes_row() {
        let (store, _temp_dir) = create_test_store();
        let key = CacheKey::from_bytes(b"result");
        store.references().increment(&key).expect("increment");
        store.references().increment(&key).expect("increment");

        assert_eq!(store.references().decrement(&key).expect("decrement"), 1);
        assert_eq!(store.references().decrement(&key).expect("decrement"), 0);

        let rtxn = store.read_txn().expect("read txn");
        assert_eq!(store.references().len_in(&rtxn).expect("len"), 0);
    }

    #[test]
    fn test_decrement_absent_returns_zero() {
        let (store, _temp_dir) = create_test_store();
        let key = CacheKey::from_bytes(b"never-counted");
        assert_eq!(store.references().decrement(&key).expect("decrement"), 0);
        assert_eq!(store.references().count(&key).expect("count"), 0);
    }

    #[test]
    fn test_set_and_rows() {
        let (store, _temp_dir) = create_test_store();
        let a = CacheKey::from_bytes(b"a");
        let b = CacheKey::from_bytes(b"b");

        let mut wtxn = store.write_txn().expect("write txn");
        store.references().set_in(&mut wtxn, a.as_str(), 3).expect("set a");
        store.references().set_in(&mut wtxn, b.as_str(), 1).expect("set b");
        store.references().set_in(&mut wtxn, b.as_str(), 0).expect("clear b");
        wtxn.commit().expect("commit");

        let rtxn = store.read_txn().expect("read txn");
        let rows = store.references().rows_in(&rtxn).expect("rows");
        assert_eq!(rows, vec![(a.to_string(), Some(3))]);
    }

    #[test]
    fn test_concurrent_increments_do_not_lose_updates() {
        let (store, _temp_dir) = create_test_store();
        let store = Arc::new(store);
        let key = CacheKey::from_bytes(b"shared");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let key = key.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        store.references().increment(&key).expect("increment");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread should not panic");
        }

        assert_eq!(store.references().count(&key).expect("count"), 200);
    }
}

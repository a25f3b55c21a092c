//! Durable index of cache entries.
//!
//! Two tables move together inside every write transaction:
//! - `cache_entries`: `request_key` -> JSON-encoded [`CacheEntry`]
//! - `expiry_index`: `expires_at ++ request_key` -> `()`
//!
//! # Expiry Key Format
//!
//! - Bytes 0-7: `expires_at` in microseconds since the epoch, sign bit
//!   flipped, big-endian (so byte order equals time order)
//! - Bytes 8..: the request key's hex characters
//!
//! Ascending iteration of the index therefore yields entries in expiry
//! order and a sweep can stop at the first key that lies in the future.

use chrono::{DateTime, Utc};
use heed::types::{Bytes, SerdeJson, Str, Unit};
use heed::{Database, Env, RoTxn, RwTxn};
use memento_core::{CacheEntry, CacheKey, Timestamp};

use crate::error::StoreError;

const SIGN_FLIP: u64 = 1 << 63;

/// Encode the index key for an entry.
pub(crate) fn expiry_key(expires_at: Timestamp, request_key: &CacheKey) -> Vec<u8> {
    let micros = expires_at.timestamp_micros();
    let mut key = Vec::with_capacity(8 + request_key.as_bytes().len());
    key.extend_from_slice(&((micros as u64) ^ SIGN_FLIP).to_be_bytes());
    key.extend_from_slice(request_key.as_bytes());
    key
}

/// Decode an index key. Returns `None` for keys this module did not write.
pub(crate) fn decode_expiry_key(bytes: &[u8]) -> Option<(i64, CacheKey)> {
    if bytes.len() < 8 {
        return None;
    }
    let prefix: [u8; 8] = bytes[0..8].try_into().ok()?;
    let micros = (u64::from_be_bytes(prefix) ^ SIGN_FLIP) as i64;
    let request_key = std::str::from_utf8(&bytes[8..])
        .ok()
        .and_then(CacheKey::parse)?;
    Some((micros, request_key))
}

/// One expiry index slot, as found by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpirySlot {
    pub index_key: Vec<u8>,
    pub expires_at_micros: i64,
    /// `None` when the index key itself is malformed.
    pub request_key: Option<CacheKey>,
}

/// The `cache_entries` table with its expiry index.
#[derive(Clone)]
pub struct CacheStorage {
    env: Env,
    entries: Database<Str, SerdeJson<CacheEntry>>,
    expiry: Database<Bytes, Unit>,
}

impl CacheStorage {
    pub(crate) fn new(
        env: Env,
        entries: Database<Str, SerdeJson<CacheEntry>>,
        expiry: Database<Bytes, Unit>,
    ) -> Self {
        Self {
            env,
            entries,
            expiry,
        }
    }

    // ------------------------------------------------------------------
    // Standalone operations (one transaction each)
    // ------------------------------------------------------------------

    pub fn get(&self, request_key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        let rtxn = self.env.read_txn()?;
        self.get_in(&rtxn, request_key)
    }

    /// Insert or replace the entry keyed by its `request_key`.
    pub fn put(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn()?;
        self.put_in(&mut wtxn, entry)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn delete(&self, request_key: &CacheKey) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn()?;
        self.delete_in(&mut wtxn, request_key)?;
        wtxn.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transaction-scoped operations
    // ------------------------------------------------------------------

    pub fn get_in(
        &self,
        txn: &RoTxn,
        request_key: &CacheKey,
    ) -> Result<Option<CacheEntry>, StoreError> {
        self.entries
            .get(txn, request_key.as_str())
            .map_err(|e| match e {
                heed::Error::Decoding(reason) => StoreError::Malformed {
                    key: request_key.to_string(),
                    reason: reason.to_string(),
                },
                other => StoreError::Lmdb(other),
            })
    }

    /// Write `entry`, replacing any previous row for the same request.
    ///
    /// Returns the replaced entry. A previous row that cannot be decoded is
    /// overwritten and reported as `None`; its expiry slot is left for the
    /// next sweep or garbage collection to drop.
    pub fn put_in(
        &self,
        wtxn: &mut RwTxn,
        entry: &CacheEntry,
    ) -> Result<Option<CacheEntry>, StoreError> {
        let previous = match self.get_in(wtxn, &entry.request_key) {
            Ok(previous) => previous,
            Err(StoreError::Malformed { key, reason }) => {
                tracing::warn!(request_key = %key, reason = %reason, "overwriting malformed cache entry");
                None
            }
            Err(e) => return Err(e),
        };

        if let Some(prev) = &previous {
            self.expiry
                .delete(wtxn, &expiry_key(prev.expires_at, &prev.request_key))?;
        }
        self.entries.put(wtxn, entry.request_key.as_str(), entry)?;
        self.expiry.put(
            wtxn,
            &expiry_key(entry.expires_at, &entry.request_key),
            &(),
        )?;
        Ok(previous)
    }

    /// Delete the row and its expiry slot. Returns the removed entry.
    pub fn delete_in(
        &self,
        wtxn: &mut RwTxn,
        request_key: &CacheKey,
    ) -> Result<Option<CacheEntry>, StoreError> {
        let Some(entry) = self.get_in(wtxn, request_key)? else {
            return Ok(None);
        };
        self.entries.delete(wtxn, request_key.as_str())?;
        self.expiry
            .delete(wtxn, &expiry_key(entry.expires_at, &entry.request_key))?;
        Ok(Some(entry))
    }

    /// Delete a row without decoding it. Used for malformed rows.
    pub fn delete_raw_in(&self, wtxn: &mut RwTxn, request_key: &str) -> Result<bool, StoreError> {
        Ok(self
            .entries
            .remap_data_type::<Bytes>()
            .delete(wtxn, request_key)?)
    }

    pub fn delete_slot_in(&self, wtxn: &mut RwTxn, index_key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.expiry.delete(wtxn, index_key)?)
    }

    pub fn put_slot_in(&self, wtxn: &mut RwTxn, entry: &CacheEntry) -> Result<(), StoreError> {
        Ok(self.expiry.put(
            wtxn,
            &expiry_key(entry.expires_at, &entry.request_key),
            &(),
        )?)
    }

    /// Expiry slots due at or before `now`, in ascending expiry order.
    ///
    /// Stops at the first slot in the future, so cost is proportional to
    /// the number of expired entries rather than the table size.
    pub fn expired_in(&self, txn: &RoTxn, now: DateTime<Utc>) -> Result<Vec<ExpirySlot>, StoreError> {
        let cutoff = now.timestamp_micros();
        let mut slots = Vec::new();
        for item in self.expiry.iter(txn)? {
            let (index_key, ()) = item?;
            let slot = Self::slot(index_key);
            if slot.request_key.is_some() && slot.expires_at_micros > cutoff {
                break;
            }
            slots.push(slot);
        }
        Ok(slots)
    }

    /// The earliest-expiring slot, if any.
    pub fn first_slot_in(&self, txn: &RoTxn) -> Result<Option<ExpirySlot>, StoreError> {
        match self.expiry.first(txn)? {
            Some((index_key, ())) => Ok(Some(Self::slot(index_key))),
            None => Ok(None),
        }
    }

    /// Every expiry slot in ascending order.
    pub fn slots_in(&self, txn: &RoTxn) -> Result<Vec<ExpirySlot>, StoreError> {
        let mut slots = Vec::new();
        for item in self.expiry.iter(txn)? {
            let (index_key, ()) = item?;
            slots.push(Self::slot(index_key));
        }
        Ok(slots)
    }

    /// Every row as raw `(request_key, bytes)` pairs, undecoded.
    pub fn raw_rows_in(&self, txn: &RoTxn) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut rows = Vec::new();
        for item in self.entries.remap_data_type::<Bytes>().iter(txn)? {
            let (key, bytes) = item?;
            rows.push((key.to_string(), bytes.to_vec()));
        }
        Ok(rows)
    }

    pub fn len_in(&self, txn: &RoTxn) -> Result<u64, StoreError> {
        Ok(self.entries.len(txn)?)
    }

    /// Remove every row and slot.
    pub fn clear_in(&self, wtxn: &mut RwTxn) -> Result<(), StoreError> {
        self.entries.clear(wtxn)?;
        self.expiry.clear(wtxn)?;
        Ok(())
    }

    fn slot(index_key: &[u8]) -> ExpirySlot {
        match decode_expiry_key(index_key) {
            Some((expires_at_micros, request_key)) => ExpirySlot {
                index_key: index_key.to_vec(),
                expires_at_micros,
                request_key: Some(request_key),
            },
            None => ExpirySlot {
                index_key: index_key.to_vec(),
                expires_at_micros: i64::MIN,
                request_key: None,
            },
        }
    }
}

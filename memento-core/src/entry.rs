//! Cache entry metadata rows.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CacheKey, Timestamp};

/// One row of the metadata index: request fingerprint to stored result.
///
/// Entries are never mutated in place; a second `put` for the same request
/// replaces the row wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Fingerprint of the request (primary identity).
    pub request_key: CacheKey,
    /// The original request, kept for introspection.
    pub request: serde_json::Value,
    /// Fingerprint of the stored result.
    pub result_key: CacheKey,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
}

impl CacheEntry {
    /// Build an entry expiring `ttl` after `created_at`.
    ///
    /// A TTL too large to represent saturates at the maximum timestamp.
    pub fn new(
        request_key: CacheKey,
        request: serde_json::Value,
        result_key: CacheKey,
        created_at: Timestamp,
        ttl: Duration,
    ) -> Self {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            request_key,
            request,
            result_key,
            created_at,
            expires_at,
        }
    }

    /// Check if the entry has expired based on current time.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// Calculate remaining duration until expiry.
    pub fn remaining_duration(&self, now: Timestamp) -> Option<Duration> {
        if self.is_expired(now) {
            None
        } else {
            (self.expires_at - now).to_std().ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(byte: u8) -> CacheKey {
        CacheKey::from_bytes([byte])
    }

    #[test]
    fn test_expiry_window() {
        let now = Utc::now();
        let entry = CacheEntry::new(key(1), json!({"op": "sum"}), key(2), now, Duration::from_secs(60));
        assert!(entry.expires_at > entry.created_at);
        assert!(!entry.is_expired(now));
        assert!(entry.is_expired(now + chrono::Duration::seconds(60)));
        let remaining = entry.remaining_duration(now).expect("not expired");
        assert_eq!(remaining, Duration::from_secs(60));
    }

    #[test]
    fn test_zero_ttl_is_born_expired() {
        let now = Utc::now();
        let entry = CacheEntry::new(key(1), json!(null), key(2), now, Duration::ZERO);
        assert_eq!(entry.expires_at, entry.created_at);
        assert!(entry.is_expired(now));
        assert!(entry.remaining_duration(now).is_none());
    }

    #[test]
    fn test_huge_ttl_saturates() {
        let now = Utc::now();
        let entry = CacheEntry::new(key(1), json!(1), key(2), now, Duration::MAX);
        assert_eq!(entry.expires_at, DateTime::<Utc>::MAX_UTC);
        assert!(!entry.is_expired(now));
    }

    #[test]
    fn test_serde_round_trip() {
        let entry = CacheEntry::new(
            key(1),
            json!({"op": "sum", "args": [1, 2, 3]}),
            key(2),
            Utc::now(),
            Duration::from_secs(5),
        );
        let bytes = serde_json::to_vec(&entry).expect("serialize");
        let back: CacheEntry = serde_json::from_slice(&bytes).expect("deserialize");
        assert_eq!(back, entry);
    }
}

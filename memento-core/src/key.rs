//! Deterministic fingerprints for requests and results.
//!
//! Values are lowered to a JSON tree and written in canonical form (object
//! keys sorted at every level, no whitespace) before hashing, so two
//! logically-equal mappings fingerprint identically regardless of the order
//! their keys were inserted in.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::serializer::ensure_finite;
use crate::SerializationError;

/// Length of a key in hex characters (SHA-256).
pub const KEY_HEX_LEN: usize = 64;

/// A fixed-length lowercase hex SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Hash raw bytes into a key.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes.as_ref());
        Self(hex::encode(hasher.finalize()))
    }

    /// Parse a key previously produced by [`CacheKey::as_str`].
    ///
    /// Returns `None` unless the input is exactly 64 lowercase hex characters.
    pub fn parse(s: &str) -> Option<Self> {
        let well_formed = s.len() == KEY_HEX_LEN
            && s
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        well_formed.then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Strategy for fingerprinting structured values.
pub trait KeyGenerator: Send + Sync {
    /// Produce the key for `value`.
    ///
    /// Must be deterministic: logically-equal inputs yield identical keys.
    fn generate_key<T: Serialize + ?Sized>(&self, value: &T) -> Result<CacheKey, SerializationError>;
}

/// SHA-256 over the canonical JSON form of a value.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256KeyGenerator;

impl KeyGenerator for Sha256KeyGenerator {
    fn generate_key<T: Serialize + ?Sized>(&self, value: &T) -> Result<CacheKey, SerializationError> {
        let canonical = canonical_json(value)?;
        Ok(CacheKey::from_bytes(canonical.as_bytes()))
    }
}

/// Render `value` as canonical JSON text.
///
/// NaN and the infinities are rejected: JSON would render all three as
/// `null` and unrelated requests would share a key.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String, SerializationError> {
    ensure_finite(value, "canonical-json")?;
    let tree = serde_json::to_value(value).map_err(|e| SerializationError::Encode {
        format: "canonical-json".to_string(),
        reason: e.to_string(),
    })?;
    let mut out = String::new();
    write_canonical(&tree, &mut out);
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<(&String, &Value)> = map.iter().collect();
            fields.sort_unstable_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, field)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::from(name.as_str()).to_string());
                out.push(':');
                write_canonical(field, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

//! Result encodings.
//!
//! A cache root is written with exactly one strategy. Blobs carry the
//! strategy's extension, so switching strategies on an existing root makes
//! previously written results invisible rather than misread.
//!
//! Every strategy is self-describing: a blob can be checked for
//! well-formedness without knowing the type it was written from.

use std::fmt;
use std::str::FromStr;

use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ConfigError, SerializationError};

/// Strategy interface for converting results to and from bytes.
pub trait Serializer: Send + Sync {
    /// Registry name of this strategy.
    fn name(&self) -> &'static str;

    /// File extension (including the leading dot) for blobs written by this strategy.
    fn extension(&self) -> &'static str;

    /// Whether cyclic object graphs survive a round trip.
    ///
    /// serde's data model is a tree, so none of the built-in strategies do.
    fn supports_cycles(&self) -> bool {
        false
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, SerializationError>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError>;

    /// Whether `bytes` is a complete document in this format, whatever its shape.
    ///
    /// Separates a damaged blob from one that merely holds a different type
    /// than the caller asked for.
    fn is_well_formed(&self, bytes: &[u8]) -> bool {
        self.decode::<IgnoredAny>(bytes).is_ok()
    }
}

/// Compact binary encoding (MessagePack, struct fields written by name).
///
/// Integers take the smallest width that holds them, so `6u8` and `6i64`
/// encode to the same bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackSerializer;

impl Serializer for MsgPackSerializer {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn extension(&self) -> &'static str {
        ".msgpack"
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        rmp_serde::to_vec_named(value).map_err(|e| encode_error(self.name(), e))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError> {
        rmp_serde::from_slice(bytes).map_err(|e| decode_error(self.name(), e))
    }
}

/// Portable binary document encoding (CBOR).
#[derive(Debug, Clone, Copy, Default)]
pub struct CborSerializer;

impl Serializer for CborSerializer {
    fn name(&self) -> &'static str {
        "cbor"
    }

    fn extension(&self) -> &'static str {
        ".cbor"
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(value, &mut buf).map_err(|e| encode_error(self.name(), e))?;
        Ok(buf)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError> {
        ciborium::de::from_reader(bytes).map_err(|e| decode_error(self.name(), e))
    }
}

/// Human-readable encoding: two-space indented JSON with sorted keys.
///
/// JSON has no spelling for NaN or the infinities, so such results are
/// rejected instead of being written as `null`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn extension(&self) -> &'static str {
        ".json"
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        ensure_finite(value, self.name())?;
        let tree = serde_json::to_value(value).map_err(|e| encode_error(self.name(), e))?;
        serde_json::to_vec_pretty(&sort_keys(tree)).map_err(|e| encode_error(self.name(), e))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError> {
        serde_json::from_slice(bytes).map_err(|e| decode_error(self.name(), e))
    }
}

/// Rebuild every object with its keys in sorted order.
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<(String, Value)> = map.into_iter().collect();
            fields.sort_unstable_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, sort_keys(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        scalar => scalar,
    }
}

/// Fail with `Encode` if `value` holds a NaN or infinite float anywhere.
pub(crate) fn ensure_finite<T: Serialize + ?Sized>(
    value: &T,
    format: &str,
) -> Result<(), SerializationError> {
    let tree = ciborium::Value::serialized(value).map_err(|e| encode_error(format, e))?;
    if has_non_finite(&tree) {
        return Err(encode_error(format, "NaN and infinite floats are not representable"));
    }
    Ok(())
}

fn has_non_finite(value: &ciborium::Value) -> bool {
    match value {
        ciborium::Value::Float(f) => !f.is_finite(),
        ciborium::Value::Array(items) => items.iter().any(has_non_finite),
        ciborium::Value::Map(fields) => fields
            .iter()
            .any(|(k, v)| has_non_finite(k) || has_non_finite(v)),
        ciborium::Value::Tag(_, inner) => has_non_finite(inner),
        _ => false,
    }
}

fn encode_error(format: &str, e: impl fmt::Display) -> SerializationError {
    SerializationError::Encode {
        format: format.to_string(),
        reason: e.to_string(),
    }
}

fn decode_error(format: &str, e: impl fmt::Display) -> SerializationError {
    SerializationError::Decode {
        format: format.to_string(),
        reason: e.to_string(),
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// The registered serialization strategies, selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializerKind {
    #[default]
    MsgPack,
    Cbor,
    Json,
}

impl SerializerKind {
    pub const ALL: [SerializerKind; 3] = [
        SerializerKind::MsgPack,
        SerializerKind::Cbor,
        SerializerKind::Json,
    ];

    /// Look up a strategy by its registry name.
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == name.trim().to_ascii_lowercase())
            .ok_or_else(|| ConfigError::UnknownSerializer {
                name: name.to_string(),
                expected: Self::ALL
                    .iter()
                    .map(|kind| kind.name())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}

impl Serializer for SerializerKind {
    fn name(&self) -> &'static str {
        match self {
            SerializerKind::MsgPack => MsgPackSerializer.name(),
            SerializerKind::Cbor => CborSerializer.name(),
            SerializerKind::Json => JsonSerializer.name(),
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            SerializerKind::MsgPack => MsgPackSerializer.extension(),
            SerializerKind::Cbor => CborSerializer.extension(),
            SerializerKind::Json => JsonSerializer.extension(),
        }
    }

    fn supports_cycles(&self) -> bool {
        match self {
            SerializerKind::MsgPack => MsgPackSerializer.supports_cycles(),
            SerializerKind::Cbor => CborSerializer.supports_cycles(),
            SerializerKind::Json => JsonSerializer.supports_cycles(),
        }
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        match self {
            SerializerKind::MsgPack => MsgPackSerializer.encode(value),
            SerializerKind::Cbor => CborSerializer.encode(value),
            SerializerKind::Json => JsonSerializer.encode(value),
        }
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError> {
        match self {
            SerializerKind::MsgPack => MsgPackSerializer.decode(bytes),
            SerializerKind::Cbor => CborSerializer.decode(bytes),
            SerializerKind::Json => JsonSerializer.decode(bytes),
        }
    }
}

impl fmt::Display for SerializerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SerializerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

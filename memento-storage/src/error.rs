//! Internal storage errors and their classification into host-facing kinds.

use std::path::{Path, PathBuf};

use memento_core::{CacheError, SerializationError};

/// Error type for metadata store and blob store operations.
///
/// Never escapes the crate's public API unclassified: [`CacheError`] is the
/// only error a host sees, via the `From` impl below.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// LMDB environment, transaction or codec failure.
    #[error("LMDB error: {0}")]
    Lmdb(#[from] heed::Error),

    /// Filesystem failure on a specific path.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Result payload could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] SerializationError),

    /// A metadata row exists but is not a valid entry.
    #[error("Malformed metadata row {key}: {reason}")]
    Malformed { key: String, reason: String },
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether the failure means stored data is unreadable (as opposed to unreachable).
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            StoreError::Lmdb(heed::Error::Decoding(_))
                | StoreError::Lmdb(heed::Error::Encoding(_))
                | StoreError::Codec(_)
                | StoreError::Malformed { .. }
        )
    }
}

/// Convert StoreError to CacheError.
impl From<StoreError> for CacheError {
    fn from(e: StoreError) -> Self {
        if e.is_corrupt() {
            let key = match &e {
                StoreError::Malformed { key, .. } => key.clone(),
                _ => String::new(),
            };
            CacheError::CorruptEntry {
                key,
                reason: e.to_string(),
            }
        } else {
            CacheError::StorageUnavailable {
                reason: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_is_storage_unavailable() {
        let err = StoreError::io(
            Path::new("/nope/results"),
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(!err.is_corrupt());
        let classified = CacheError::from(err);
        assert!(matches!(classified, CacheError::StorageUnavailable { ref reason } if reason.contains("/nope/results")));
    }

    #[test]
    fn test_codec_error_is_corrupt_entry() {
        let err = StoreError::from(SerializationError::Decode {
            format: "cbor".to_string(),
            reason: "eof".to_string(),
        });
        assert!(err.is_corrupt());
        assert!(CacheError::from(err).is_corrupt());
    }

    #[test]
    fn test_malformed_row_keeps_key() {
        let err = StoreError::Malformed {
            key: "abc".to_string(),
            reason: "truncated".to_string(),
        };
        assert!(matches!(
            CacheError::from(err),
            CacheError::CorruptEntry { ref key, .. } if key == "abc"
        ));
    }

    #[test]
    fn test_lmdb_decoding_is_corrupt() {
        let inner: Box<dyn std::error::Error + Send + Sync> = "bad row".into();
        let err = StoreError::Lmdb(heed::Error::Decoding(inner));
        assert!(err.is_corrupt());
    }
}

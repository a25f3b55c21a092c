//! Content-addressed blob store.
//!
//! One file per result key at `<results_dir>/<result_key><extension>`.
//! The store never deletes anything on its own initiative; deletion rights
//! belong to whoever observes the reference count reach zero.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use memento_core::{CacheKey, Serializer, SerializerKind};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;
use crate::fs::{atomic_write, remove_file_best_effort, TMP_MARKER};

/// A file found under the results directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobFile {
    /// A well-formed blob for this store's serializer.
    Result { key: CacheKey, size_bytes: u64 },
    /// A leftover temp file, a blob of another serializer, or anything else.
    Stray { path: PathBuf, size_bytes: u64 },
}

/// Filesystem-backed result blobs.
#[derive(Debug, Clone)]
pub struct ResultStorage {
    dir: PathBuf,
    serializer: SerializerKind,
}

impl ResultStorage {
    /// Open the store, creating `dir` if needed.
    pub fn new(dir: impl Into<PathBuf>, serializer: SerializerKind) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(Self { dir, serializer })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn serializer(&self) -> SerializerKind {
        self.serializer
    }

    /// Deterministic location of the blob for `key`.
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir
            .join(format!("{}{}", key.as_str(), self.serializer.extension()))
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.path_for(key).is_file()
    }

    /// Encode `value` with this store's serializer.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, StoreError> {
        Ok(self.serializer.encode(value)?)
    }

    /// Decode blob bytes with this store's serializer.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, StoreError> {
        Ok(self.serializer.decode(bytes)?)
    }

    /// Whether `bytes` is an intact document for this store's serializer.
    pub fn is_well_formed(&self, bytes: &[u8]) -> bool {
        self.serializer.is_well_formed(bytes)
    }

    /// Key under which `bytes` is stored: the SHA-256 of the payload itself.
    pub fn key_for_bytes(bytes: &[u8]) -> CacheKey {
        CacheKey::from_bytes(bytes)
    }

    /// Raw blob bytes, or `None` if no blob exists for `key`.
    pub fn get_bytes(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// Decoded blob, or `None` if no blob exists for `key`.
    pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>, StoreError> {
        match self.get_bytes(key)? {
            Some(bytes) => Ok(Some(self.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Durably write pre-encoded bytes, replacing any existing blob.
    pub fn put_bytes(&self, key: &CacheKey, bytes: &[u8]) -> Result<(), StoreError> {
        atomic_write(&self.path_for(key), bytes)
    }

    /// Write `bytes` under `key` unless an intact copy is already there.
    ///
    /// Keys are payload hashes, so an existing file of the same length holds
    /// the same bytes. Returns whether a write happened.
    pub fn ensure_bytes(&self, key: &CacheKey, bytes: &[u8]) -> Result<bool, StoreError> {
        let path = self.path_for(key);
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() && meta.len() == bytes.len() as u64 => return Ok(false),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&path, e)),
        }
        self.put_bytes(key, bytes)?;
        Ok(true)
    }

    /// Encode and durably write `value`. Returns the number of bytes written.
    pub fn put<T: Serialize + ?Sized>(&self, key: &CacheKey, value: &T) -> Result<u64, StoreError> {
        let bytes = self.encode(value)?;
        self.put_bytes(key, &bytes)?;
        Ok(bytes.len() as u64)
    }

    /// Delete the blob for `key`. Deleting an absent blob is a no-op.
    pub fn delete(&self, key: &CacheKey) -> Result<(), StoreError> {
        self.remove(key).map(|_| ())
    }

    /// Delete the blob for `key`, returning the bytes freed (0 if absent).
    pub fn remove(&self, key: &CacheKey) -> Result<u64, StoreError> {
        let path = self.path_for(key);
        let size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        match fs::remove_file(&path) {
            Ok(()) => Ok(size),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// Every file under the results directory, classified.
    pub fn list(&self) -> Result<Vec<BlobFile>, StoreError> {
        let read_dir = fs::read_dir(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        let extension = self.serializer.extension();

        let mut files = Vec::new();
        for dir_entry in read_dir {
            let dir_entry = dir_entry.map_err(|e| StoreError::io(&self.dir, e))?;
            let meta = match dir_entry.metadata() {
                Ok(meta) => meta,
                // Raced with a concurrent delete.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::io(&dir_entry.path(), e)),
            };
            if !meta.is_file() {
                continue;
            }

            let name = dir_entry.file_name();
            let name = name.to_string_lossy();
            let key = name
                .strip_suffix(extension)
                .filter(|_| !name.contains(TMP_MARKER))
                .and_then(CacheKey::parse);
            files.push(match key {
                Some(key) => BlobFile::Result {
                    key,
                    size_bytes: meta.len(),
                },
                None => BlobFile::Stray {
                    path: dir_entry.path(),
                    size_bytes: meta.len(),
                },
            });
        }
        Ok(files)
    }

    /// Total bytes held by result blobs (temp and stray files excluded).
    pub fn total_size(&self) -> Result<u64, StoreError> {
        Ok(self
            .list()?
            .into_iter()
            .map(|file| match file {
                BlobFile::Result { size_bytes, .. } => size_bytes,
                BlobFile::Stray { .. } => 0,
            })
            .sum())
    }

    /// Remove a stray file found by [`ResultStorage::list`].
    pub fn remove_stray(&self, path: &Path) -> bool {
        remove_file_best_effort(path, "result_storage.stray")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_store(serializer: SerializerKind) -> (ResultStorage, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let store = ResultStorage::new(temp_dir.path().join("results"), serializer)
            .expect("store creation should succeed");
        (store, temp_dir)
    }

    #[test]
    fn test_put_and_get() {
        let (store, _temp_dir) = create_test_store(SerializerKind::Cbor);
        let key = CacheKey::from_bytes(b"result");

        let written = store
            .put(&key, &json!({"total": 6}))
            .expect("put should succeed");
        assert!(written > 0);
        assert!(store.contains(&key));
        assert!(store
            .path_for(&key)
            .to_string_lossy()
            .ends_with(&format!("{key}.cbor")));

        let value: Option<serde_json::Value> = store.get(&key).expect("get should succeed");
        assert_eq!(value, Some(json!({"total": 6})));
    }

    #[test]
    fn test_get_missing() {
        let (store, _temp_dir) = create_test_store(SerializerKind::Json);
        let value: Option<i64> = store
            .get(&CacheKey::from_bytes(b"missing"))
            .expect("get should succeed");
        assert!(value.is_none());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (store, _temp_dir) = create_test_store(SerializerKind::MsgPack);
        let key = CacheKey::from_bytes(b"result");
        store.put(&key, &42i64).expect("put should succeed");

        store.delete(&key).expect("delete should succeed");
        assert!(!store.contains(&key));
        store.delete(&key).expect("second delete should be a no-op");
        assert_eq!(store.remove(&key).expect("remove"), 0);
    }

    #[test]
    fn test_put_overwrites() {
        let (store, _temp_dir) = create_test_store(SerializerKind::Json);
        let key = CacheKey::from_bytes(b"result");
        store.put(&key, &1).expect("put should succeed");
        store.put(&key, &2).expect("overwrite should succeed");
        assert_eq!(store.get::<i64>(&key).expect("get"), Some(2));
    }

    #[test]
    fn test_ensure_bytes_skips_intact_blob() {
        let (store, _temp_dir) = create_test_store(SerializerKind::MsgPack);
        let bytes = store.encode(&vec![1u64, 2, 3]).expect("encode");
        let key = ResultStorage::key_for_bytes(&bytes);

        assert!(store.ensure_bytes(&key, &bytes).expect("first write"));
        assert!(!store.ensure_bytes(&key, &bytes).expect("second write"));

        // A truncated copy is replaced.
        fs::write(store.path_for(&key), &bytes[..1]).expect("truncate");
        assert!(store.ensure_bytes(&key, &bytes).expect("repair write"));
        assert_eq!(store.get::<Vec<u64>>(&key).expect("get"), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_key_follows_encoded_bytes() {
        let (store, _temp_dir) = create_test_store(SerializerKind::MsgPack);
        let nan = store.encode(&f64::NAN).expect("nan");
        let inf = store.encode(&f64::INFINITY).expect("inf");
        assert_ne!(ResultStorage::key_for_bytes(&nan), ResultStorage::key_for_bytes(&inf));
    }

    #[test]
    fn test_corrupt_blob_is_codec_error() {
        let (store, _temp_dir) = create_test_store(SerializerKind::Json);
        let key = CacheKey::from_bytes(b"result");
        store.put_bytes(&key, b"{not json").expect("raw write");
        let err = store.get::<serde_json::Value>(&key).expect_err("corrupt");
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_list_and_total_size() {
        let (store, _temp_dir) = create_test_store(SerializerKind::Json);
        let a = CacheKey::from_bytes(b"a");
        let b = CacheKey::from_bytes(b"b");
        let size_a = store.put(&a, &"alpha").expect("put a");
        let size_b = store.put(&b, &[1, 2, 3]).expect("put b");
        fs::write(store.dir().join("notes.txt"), b"stray").expect("stray write");

        let files = store.list().expect("list");
        assert_eq!(files.len(), 3);
        assert_eq!(
            files
                .iter()
                .filter(|f| matches!(f, BlobFile::Stray { .. }))
                .count(),
            1
        );
        assert_eq!(store.total_size().expect("size"), size_a + size_b);
    }
}

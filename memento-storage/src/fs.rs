//! Durable file primitives for the blob store.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::StoreError;

/// Marker embedded in temporary file names.
pub(crate) const TMP_MARKER: &str = ".tmp.";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write `bytes` to `path` so that readers observe either the old file or
/// the complete new one, and the data is on stable storage before return.
///
/// Writes a uniquely named sibling temp file, `sync_all`s it, renames it over
/// `path`, then syncs the parent directory (best effort).
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;

    let (tmp_path, mut file) = open_unique_tmp_file(path, parent)?;
    let write_result = file.write_all(bytes).and_then(|()| file.sync_all());
    drop(file);
    if let Err(e) = write_result {
        remove_file_best_effort(&tmp_path, "atomic_write.write_failed");
        return Err(StoreError::io(&tmp_path, e));
    }

    if let Err(e) = rename_over(&tmp_path, path) {
        remove_file_best_effort(&tmp_path, "atomic_write.rename_failed");
        return Err(StoreError::io(path, e));
    }

    sync_dir_best_effort(parent);
    Ok(())
}

fn rename_over(from: &Path, to: &Path) -> io::Result<()> {
    const MAX_RENAME_ATTEMPTS: usize = 64;
    let mut attempts = 0usize;
    loop {
        match fs::rename(from, to) {
            Ok(()) => return Ok(()),
            // Windows `rename` refuses to replace an existing file.
            Err(err) if cfg!(windows) && to.exists() => {
                match fs::remove_file(to) {
                    Ok(()) => {}
                    Err(remove_err) if remove_err.kind() == io::ErrorKind::NotFound => {}
                    Err(remove_err) => return Err(remove_err),
                }
                attempts += 1;
                if attempts >= MAX_RENAME_ATTEMPTS {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

fn open_unique_tmp_file(dest: &Path, parent: &Path) -> Result<(PathBuf, fs::File), StoreError> {
    let file_name = dest.file_name().ok_or_else(|| {
        StoreError::io(
            dest,
            io::Error::new(io::ErrorKind::InvalidInput, "destination has no file name"),
        )
    })?;
    let pid = std::process::id();

    loop {
        let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(format!("{TMP_MARKER}{pid}.{counter}"));
        let tmp_path = parent.join(tmp_name);

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
        {
            Ok(file) => return Ok((tmp_path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(StoreError::io(&tmp_path, err)),
        }
    }
}

/// Remove `path`, treating "already gone" as success.
///
/// Returns whether the file is gone afterwards.
pub(crate) fn remove_file_best_effort(path: &Path, reason: &'static str) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            tracing::debug!(
                path = %path.display(),
                reason,
                error = %err,
                "failed to remove cache file"
            );
            false
        }
    }
}

fn sync_dir_best_effort(dir: &Path) {
    #[cfg(unix)]
    {
        static SYNC_DIR_ERROR_LOGGED: std::sync::OnceLock<()> = std::sync::OnceLock::new();
        match fs::File::open(dir).and_then(|dir| dir.sync_all()) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                if SYNC_DIR_ERROR_LOGGED.set(()).is_ok() {
                    tracing::debug!(
                        dir = %dir.display(),
                        error = %err,
                        "failed to sync directory (best effort)"
                    );
                }
            }
        }
    }

    #[cfg(not(unix))]
    let _ = dir;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_creates_and_replaces() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let path = temp_dir.path().join("nested").join("blob.bin");

        atomic_write(&path, b"first").expect("first write should succeed");
        assert_eq!(fs::read(&path).expect("read"), b"first");

        atomic_write(&path, b"second").expect("overwrite should succeed");
        assert_eq!(fs::read(&path).expect("read"), b"second");

        let leftovers: Vec<_> = fs::read_dir(path.parent().expect("parent"))
            .expect("read_dir")
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(TMP_MARKER))
            .collect();
        assert!(leftovers.is_empty(), "temp files must not be left behind");
    }

    #[test]
    fn test_remove_missing_file_is_ok() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        assert!(remove_file_best_effort(
            &temp_dir.path().join("missing"),
            "test"
        ));
    }
}

//! Key/value persistence for the local cache
//!
//! Each cached collection is one blob stored under one key. Implementations
//! must make single-key writes atomic; nothing spans more than one key.
//!
//! Storage location for [`FilePersistence`]: `~/.local/share/comanda/cache/`
//! (configurable via `Config`), one `<key>.json` file per key.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use super::error::{StorageError, StorageResult};

const BLOB_EXTENSION: &str = "json";
const BACKUP_SUFFIX: &str = "corrupt.backup";

/// Atomic single-key blob storage
pub trait Persistence: Send + Sync {
    /// Read the blob stored under `key`, `None` if absent
    fn read(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Replace the blob stored under `key`
    fn write(&self, key: &str, data: &[u8]) -> StorageResult<()>;

    /// Delete the blob stored under `key`; absent keys are not an error
    fn remove(&self, key: &str) -> StorageResult<()>;

    /// All keys currently stored
    fn keys(&self) -> StorageResult<Vec<String>>;

    /// Move an unreadable blob out of the way
    ///
    /// Returns where the blob went, if it was kept anywhere.
    fn quarantine(&self, key: &str) -> StorageResult<Option<PathBuf>> {
        self.remove(key)?;
        Ok(None)
    }

    /// Total size of all stored blobs in bytes
    fn stored_bytes(&self) -> u64;
}

/// File-backed persistence, one file per key
pub struct FilePersistence {
    dir: PathBuf,
}

impl FilePersistence {
    /// Create a persistence handler rooted at `dir`
    ///
    /// The directory is created lazily on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// File path holding the blob for `key`
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", encode_key(key), BLOB_EXTENSION))
    }
}

impl Persistence for FilePersistence {
    fn read(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.path_for(key);

        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                Err(StorageError::PermissionDenied { path, source: e })
            }
            Err(e) => Err(StorageError::ReadError { path, source: e }),
        }
    }

    fn write(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        atomic_write(&self.path_for(key), data)
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::from_io(e, path)),
        }
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StorageError::ReadError {
                    path: self.dir.clone(),
                    source: e,
                })
            }
        };

        let mut keys = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(BLOB_EXTENSION) {
                continue;
            }
            if let Some(key) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(decode_key)
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn quarantine(&self, key: &str) -> StorageResult<Option<PathBuf>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }

        let backup = path.with_extension(format!("{}.{}", BLOB_EXTENSION, BACKUP_SUFFIX));
        fs::rename(&path, &backup).map_err(|source| StorageError::AtomicWriteFailed {
            from: path.clone(),
            to: backup.clone(),
            source,
        })?;
        Ok(Some(backup))
    }

    fn stored_bytes(&self) -> u64 {
        let Ok(keys) = self.keys() else {
            return 0;
        };
        keys.iter()
            .filter_map(|key| fs::metadata(self.path_for(key)).ok())
            .map(|meta| meta.len())
            .sum()
    }
}

/// In-memory persistence
///
/// Nothing survives the process. Writes can be made to fail to exercise the
/// quota-exceeded path.
#[derive(Default)]
pub struct MemoryPersistence {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail as if the quota were exhausted
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl Persistence for MemoryPersistence {
    fn read(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(blobs.get(key).cloned())
    }

    fn write(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::DiskFull {
                path: PathBuf::from(key),
                source: io::Error::new(io::ErrorKind::Other, "quota exceeded"),
            });
        }
        let mut blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        blobs.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let mut blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        blobs.remove(key);
        Ok(())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        let blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = blobs.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn stored_bytes(&self) -> u64 {
        let blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        blobs.values().map(|blob| blob.len() as u64).sum()
    }
}

/// Write data to a file atomically
///
/// 1. Write to a temporary file in the same directory
/// 2. Sync the file to disk
/// 3. Rename the temp file to the target path
///
/// The target file is never left in a partially-written state.
fn atomic_write(path: &Path, data: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| StorageError::CreateDirectory {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    // Same directory, so the rename stays atomic
    let temp_path = path.with_extension("tmp");

    let mut file =
        File::create(&temp_path).map_err(|e| StorageError::from_io(e, temp_path.clone()))?;

    file.write_all(data)
        .map_err(|e| StorageError::from_io(e, temp_path.clone()))?;

    file.sync_all()
        .map_err(|e| StorageError::from_io(e, temp_path.clone()))?;

    fs::rename(&temp_path, path).map_err(|source| StorageError::AtomicWriteFailed {
        from: temp_path.clone(),
        to: path.to_path_buf(),
        source,
    })?;

    Ok(())
}

/// Encode a key into a file-name-safe stem
///
/// ASCII alphanumerics, `_` and `-` pass through; every other byte becomes `%XX`.
fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

fn decode_key(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(decoded).ok()
}

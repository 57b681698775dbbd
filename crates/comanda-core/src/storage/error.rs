//! Storage error handling
//!
//! Provides typed errors for local cache persistence with descriptive
//! messages and recovery suggestions.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while persisting the local cache
#[derive(Error, Debug)]
pub enum StorageError {
    /// Failed to create the cache directory
    #[error("Failed to create cache directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Permission denied accessing path
    #[error("Permission denied: cannot access '{path}'. Check file permissions.")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Disk is full or quota exceeded
    #[error(
        "Disk full or quota exceeded while writing to '{path}'. Free up disk space and try again."
    )]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to read file
    #[error("Failed to read '{path}': {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to write file
    #[error("Failed to write '{path}': {source}")]
    WriteError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A cached blob could not be parsed
    #[error("Cached collection under key '{key}' is corrupted: {details}")]
    CorruptBlob {
        key: String,
        backup_path: Option<PathBuf>,
        details: String,
    },

    /// Key is empty or otherwise unusable
    #[error("Invalid cache key: '{0}'")]
    InvalidKey(String),

    /// Failed to encode a collection
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File not found (when expected to exist)
    #[error("File not found: '{path}'")]
    NotFound { path: PathBuf },

    /// Atomic write failed during rename
    #[error("Atomic write failed: could not rename '{from}' to '{to}': {source}")]
    AtomicWriteFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Create an error from an I/O error with path context
    ///
    /// Classifies the error based on its kind (permission, disk full, etc.)
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied {
                path,
                source: error,
            },
            io::ErrorKind::NotFound => StorageError::NotFound { path },
            _ if is_disk_full_error(&error) => StorageError::DiskFull {
                path,
                source: error,
            },
            _ => StorageError::WriteError {
                path,
                source: error,
            },
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StorageError::DiskFull { .. }
                | StorageError::PermissionDenied { .. }
                | StorageError::CorruptBlob { .. }
        )
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StorageError::DiskFull { .. } => Some("Free up disk space and try again."),
            StorageError::PermissionDenied { .. } => {
                Some("Check file and directory permissions of the data directory.")
            }
            StorageError::CorruptBlob { .. } => {
                Some("The corrupted blob was moved aside. The collection is refilled by the next write or remote snapshot.")
            }
            StorageError::CreateDirectory { .. } => {
                Some("Check that the parent directory exists and you have write permissions.")
            }
            _ => None,
        }
    }
}

/// Check if an I/O error indicates disk full condition
fn is_disk_full_error(error: &io::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("no space left")
        || msg.contains("disk full")
        || msg.contains("quota exceeded")
        || msg.contains("not enough space")
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_classification() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = StorageError::from_io(io_err, PathBuf::from("/test/path"));

        assert!(matches!(err, StorageError::PermissionDenied { .. }));
        assert!(err.is_recoverable());
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_not_found_classification() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = StorageError::from_io(io_err, PathBuf::from("/missing/file"));

        assert!(matches!(err, StorageError::NotFound { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_quota_exceeded_detection() {
        let io_err = io::Error::new(io::ErrorKind::Other, "Quota exceeded for user");
        let err = StorageError::from_io(io_err, PathBuf::from("/full/disk"));

        assert!(matches!(err, StorageError::DiskFull { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_other_io_is_write_error() {
        let io_err = io::Error::new(io::ErrorKind::Other, "device busy");
        let err = StorageError::from_io(io_err, PathBuf::from("/busy"));

        assert!(matches!(err, StorageError::WriteError { .. }));
        assert!(err.recovery_suggestion().is_none());
    }

    #[test]
    fn test_corrupt_blob_display() {
        let err = StorageError::CorruptBlob {
            key: "comanda_orders".to_string(),
            backup_path: Some(PathBuf::from("/data/cache/comanda_orders.json.corrupt.backup")),
            details: "expected value at line 1".to_string(),
        };

        let msg = err.to_string();
        assert!(msg.contains("corrupted"));
        assert!(msg.contains("comanda_orders"));
        assert!(err.is_recoverable());
    }
}

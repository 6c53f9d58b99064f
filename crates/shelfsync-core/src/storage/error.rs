//! Storage errors
//!
//! Typed failures of the local journal store and the identity file, with a
//! classification the journal uses to decide between retrying an append,
//! compacting, or degrading to memory.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Cannot create data directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Permission denied for '{path}'")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The file system reported no space or an exceeded quota
    #[error("No space left while writing '{path}'")]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The backend's record limit for a namespace was reached
    #[error("Namespace '{namespace}' is full ({limit} records)")]
    CapacityExceeded { namespace: String, limit: usize },

    #[error("Cannot read '{path}': {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot write '{path}': {source}")]
    WriteError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A stored journal entry did not decode
    #[error("Unreadable record in '{namespace}': {details}")]
    CorruptRecord { namespace: String, details: String },

    #[error("SQLite: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Record encoding: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Missing file '{path}'")]
    NotFound { path: PathBuf },

    /// The temp file was written but could not replace the target
    #[error("Cannot move '{from}' into place at '{to}': {source}")]
    AtomicWriteFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StorageError {
    /// Classify an I/O failure on `path`
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

    /// The backend ran out of room
    ///
    /// The journal answers exhaustion with a compaction instead of retrying
    /// the append.
    pub fn is_exhaustion(&self) -> bool {
        match self {
            StorageError::DiskFull { .. } | StorageError::CapacityExceeded { .. } => true,
            StorageError::Database(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == rusqlite::ErrorCode::DiskFull
            }
            _ => false,
        }
    }

    /// The condition can clear without a code change (space freed, permissions fixed)
    pub fn is_recoverable(&self) -> bool {
        self.is_exhaustion()
            || matches!(
                self,
                StorageError::PermissionDenied { .. } | StorageError::CorruptRecord { .. }
            )
    }

    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        if self.is_exhaustion() {
            return Some("Free up disk space; changes are held in memory until then.");
        }
        match self {
            StorageError::PermissionDenied { .. } => {
                Some("Check ownership and permissions of the data directory.")
            }
            StorageError::CorruptRecord { .. } => {
                Some("The record was skipped. A full sync restores server state.")
            }
            StorageError::CreateDirectory { .. } => {
                Some("Check that data_dir points to a writable location.")
            }
            _ => None,
        }
    }

    /// Message for a `QueueOverflow` notice, with the suggestion appended
    pub fn overflow_message(&self) -> String {
        match self.recovery_suggestion() {
            Some(hint) => format!("{}. {}", self, hint),
            None => self.to_string(),
        }
    }
}

fn is_disk_full_error(error: &io::Error) -> bool {
    // ENOSPC / EDQUOT
    if matches!(error.raw_os_error(), Some(28) | Some(122)) {
        return true;
    }
    let msg = error.to_string().to_lowercase();
    msg.contains("no space left") || msg.contains("quota exceeded") || msg.contains("disk full")
}

pub type StorageResult<T> = Result<T, StorageError>;

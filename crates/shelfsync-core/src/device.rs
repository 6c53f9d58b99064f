//! Per-install device identity
//!
//! Stamped on every mutation envelope and on positions and history entries,
//! so reconciliation can tell this device's echoes from other devices'
//! edits.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::storage::{atomic_write, StorageError, StorageResult};

/// Stable identifier of this installation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identity
    pub fn generate() -> Self {
        Self(format!("device-{}", Uuid::new_v4()))
    }

    /// Read the identity file, creating it on first run
    pub fn load_or_create(path: &Path) -> StorageResult<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let id = contents.trim();
                if !id.is_empty() {
                    return Ok(Self(id.to_string()));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StorageError::ReadError {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        }

        let id = Self::generate();
        atomic_write(path, id.0.as_bytes())?;
        info!("Created device identity {}", id);
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

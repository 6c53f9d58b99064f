//! In-memory record storage
//!
//! Shared between "process restarts" in tests by cloning the `Arc` that
//! owns it. Can simulate exhaustion with a per-namespace record limit.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;

use super::error::{StorageError, StorageResult};
use super::Storage;

#[derive(Debug, Default)]
struct Inner {
    namespaces: HashMap<String, Vec<Value>>,
    capacity: Option<usize>,
    failing_writes: usize,
}

/// Volatile storage backend
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit every namespace to `limit` records
    pub fn with_capacity(limit: usize) -> Self {
        let storage = Self::default();
        storage.set_capacity(Some(limit));
        storage
    }

    pub fn set_capacity(&self, limit: Option<usize>) {
        self.inner.lock().capacity = limit;
    }

    /// Make the next `count` writes fail as if the disk were full
    pub fn fail_next_writes(&self, count: usize) {
        self.inner.lock().failing_writes = count;
    }

    /// Number of raw records in a namespace (journal length)
    pub fn len(&self, namespace: &str) -> usize {
        self.inner
            .lock()
            .namespaces
            .get(namespace)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self, namespace: &str) -> bool {
        self.len(namespace) == 0
    }

    fn check_write(inner: &mut Inner, namespace: &str, resulting_len: usize) -> StorageResult<()> {
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(StorageError::CapacityExceeded {
                namespace: namespace.to_string(),
                limit: inner.capacity.unwrap_or(0),
            });
        }
        if let Some(limit) = inner.capacity {
            if resulting_len > limit {
                return Err(StorageError::CapacityExceeded {
                    namespace: namespace.to_string(),
                    limit,
                });
            }
        }
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn read_all(&self, namespace: &str) -> StorageResult<Vec<Value>> {
        Ok(self
            .inner
            .lock()
            .namespaces
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }

    fn write_all(&self, namespace: &str, records: &[Value]) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        Self::check_write(&mut inner, namespace, records.len())?;
        inner
            .namespaces
            .insert(namespace.to_string(), records.to_vec());
        Ok(())
    }

    fn append(&self, namespace: &str, record: &Value) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let len = inner.namespaces.get(namespace).map(Vec::len).unwrap_or(0);
        Self::check_write(&mut inner, namespace, len + 1)?;
        inner
            .namespaces
            .entry(namespace.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }
}

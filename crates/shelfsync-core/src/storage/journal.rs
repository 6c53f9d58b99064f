//! Append-then-compact journal over a storage namespace
//!
//! Owners keep their live state in memory and record every change as one
//! appended `JournalEntry`. Replaying the entries in order rebuilds the live
//! state. When the journal grows well past the live set, or when an append
//! fails because storage is exhausted, the live set is rewritten with a single
//! atomic `write_all`, dropping tombstones and superseded entries.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::error::{StorageError, StorageResult};
use super::Storage;

/// Attempts per append before falling back to compaction
const APPEND_ATTEMPTS: usize = 3;

/// Journal length below which compaction is never considered
const MIN_COMPACT_ENTRIES: usize = 64;

/// One durable change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum JournalEntry<V> {
    Put { key: String, value: V },
    Remove { key: String },
}

/// Outcome of a journal write that did land durably
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Appended,
    /// The entry only landed through a compaction
    Compacted,
    /// Storage accepted a write again after being degraded
    Recovered,
}

/// Durable change log for one namespace
pub struct Journal {
    storage: Arc<dyn Storage>,
    namespace: String,
    entries: usize,
    degraded: bool,
}

impl Journal {
    /// Open a namespace and replay it into `(key, value)` pairs
    ///
    /// Pairs come back in the order their key was first put. Entries that
    /// fail to decode are skipped with a warning rather than failing the
    /// whole replay.
    pub fn open<V: DeserializeOwned>(
        storage: Arc<dyn Storage>,
        namespace: &str,
    ) -> StorageResult<(Self, Vec<(String, V)>)> {
        let raw = storage.read_all(namespace)?;
        let entries = raw.len();

        let mut slots: Vec<Option<(String, V)>> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for value in raw {
            match serde_json::from_value::<JournalEntry<V>>(value) {
                Ok(JournalEntry::Put { key, value }) => match index.get(&key) {
                    Some(&slot) => slots[slot] = Some((key, value)),
                    None => {
                        index.insert(key.clone(), slots.len());
                        slots.push(Some((key, value)));
                    }
                },
                Ok(JournalEntry::Remove { key }) => {
                    if let Some(slot) = index.remove(&key) {
                        slots[slot] = None;
                    }
                }
                Err(e) => {
                    let err = StorageError::CorruptRecord {
                        namespace: namespace.to_string(),
                        details: e.to_string(),
                    };
                    warn!("Skipping journal entry: {}", err);
                }
            }
        }

        let live: Vec<(String, V)> = slots.into_iter().flatten().collect();
        debug!(
            "Replayed journal '{}': {} entries, {} live",
            namespace,
            entries,
            live.len()
        );

        Ok((
            Self {
                storage,
                namespace: namespace.to_string(),
                entries,
                degraded: false,
            },
            live,
        ))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Whether the last write failed and state lives only in memory
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Force the next write to rewrite the full live set
    pub fn mark_degraded(&mut self) {
        self.degraded = true;
    }

    /// Number of entries currently stored
    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Durably record one change
    ///
    /// `live` must return the full live state *including* this change; it
    /// is only called when a compaction is needed. On error the change is
    /// kept by the owner in memory and the journal is marked degraded.
    pub fn write<V: Serialize>(
        &mut self,
        entry: &JournalEntry<V>,
        live: impl Fn() -> Vec<(String, V)>,
    ) -> StorageResult<WriteOutcome> {
        if self.degraded {
            self.compact(&live())?;
            self.degraded = false;
            return Ok(WriteOutcome::Recovered);
        }

        let record = serde_json::to_value(entry)?;
        let mut last_error = None;
        for attempt in 1..=APPEND_ATTEMPTS {
            match self.storage.append(&self.namespace, &record) {
                Ok(()) => {
                    self.entries += 1;
                    self.maybe_compact(&live);
                    return Ok(WriteOutcome::Appended);
                }
                Err(e) if e.is_exhaustion() => {
                    last_error = Some(e);
                    break;
                }
                Err(e) => {
                    debug!(
                        "Append to '{}' failed (attempt {}/{}): {}",
                        self.namespace, attempt, APPEND_ATTEMPTS, e
                    );
                    last_error = Some(e);
                }
            }
        }

        // Compaction frees the space taken by acknowledged and superseded
        // entries; the live set itself is never trimmed.
        match self.compact(&live()) {
            Ok(()) => Ok(WriteOutcome::Compacted),
            Err(compact_error) => {
                self.degraded = true;
                if compact_error.is_recoverable() {
                    warn!(
                        "Storage for '{}' degraded to memory only: {}",
                        self.namespace, compact_error
                    );
                } else {
                    error!(
                        "Storage for '{}' failed, keeping changes in memory: {}",
                        self.namespace, compact_error
                    );
                }
                Err(last_error.unwrap_or(compact_error))
            }
        }
    }

    /// Rewrite the namespace with exactly the live set
    pub fn compact<V: Serialize>(&mut self, live: &[(String, V)]) -> StorageResult<()> {
        let records = live
            .iter()
            .map(|(key, value)| {
                serde_json::to_value(JournalEntry::Put {
                    key: key.clone(),
                    value,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.storage.write_all(&self.namespace, &records)?;
        debug!(
            "Compacted journal '{}': {} -> {} entries",
            self.namespace,
            self.entries,
            records.len()
        );
        self.entries = records.len();
        Ok(())
    }

    fn maybe_compact<V: Serialize>(&mut self, live: &impl Fn() -> Vec<(String, V)>) {
        if self.entries < MIN_COMPACT_ENTRIES {
            return;
        }
        let live = live();
        if self.entries > live.len() * 2 + MIN_COMPACT_ENTRIES / 2 {
            if let Err(e) = self.compact(&live) {
                // The append itself landed; a later write retries compaction
                debug!("Deferred compaction of '{}': {}", self.namespace, e);
            }
        }
    }
}

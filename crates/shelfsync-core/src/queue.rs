//! Durable mutation queue
//!
//! Ordered log of local changes the server has not confirmed yet. Records
//! for the same entity key always leave the queue in creation order: a key
//! whose head is in flight, backing off or parked hides every record behind
//! it.
//!
//! ## Persistence
//!
//! Every change is one journal entry in the `mutation_queue` namespace.
//! `enqueue` never fails: if storage is exhausted the journal is compacted,
//! and if that fails too the queue keeps working in memory and reports a
//! `QueueOverflow` event until storage accepts writes again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::models::{EntityKind, MutationId, MutationRecord};
use crate::retry::RetryPolicy;
use crate::storage::journal::WriteOutcome;
use crate::storage::{Journal, JournalEntry, Storage, StorageResult};
use crate::sync::{EventSink, SyncEvent};

/// Storage namespace of the queue journal
pub const QUEUE_NAMESPACE: &str = "mutation_queue";

/// What `fail` decided for a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Eligible again at `next_attempt_at` (epoch ms)
    Retry { attempts: u32, next_attempt_at: u64 },
    /// Retry budget exhausted; the record is parked
    Parked { attempts: u32 },
}

/// Durable FIFO-per-key queue of `MutationRecord`s
pub struct MutationQueue {
    records: Vec<MutationRecord>,
    in_flight: HashSet<MutationId>,
    journal: Journal,
    policy: RetryPolicy,
    events: EventSink,
}

impl MutationQueue {
    /// Open the queue, replaying any records persisted by a previous run
    ///
    /// Nothing is in flight after a restart: a record that was being sent
    /// when the process died is simply sent again under the same id.
    pub fn open(
        storage: Arc<dyn Storage>,
        policy: RetryPolicy,
        events: EventSink,
    ) -> StorageResult<Self> {
        let (journal, live) = Journal::open::<MutationRecord>(storage, QUEUE_NAMESPACE)?;
        let records: Vec<MutationRecord> = live.into_iter().map(|(_, record)| record).collect();
        if !records.is_empty() {
            info!("Restored {} queued mutations", records.len());
        }

        Ok(Self {
            records,
            in_flight: HashSet::new(),
            journal,
            policy,
            events,
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Append a record; never blocks on the network and never fails
    pub fn enqueue(&mut self, record: MutationRecord) -> MutationId {
        let id = record.id;
        debug!(
            "Enqueue {} {} '{}' ({})",
            record.op, record.entity_kind, record.entity_key, id
        );
        self.records.push(record.clone());
        self.persist(JournalEntry::Put {
            key: id.to_string(),
            value: record,
        });
        id
    }

    /// Up to `max` sendable records of one family, in queue order
    ///
    /// A key is skipped from its first record that is in flight, parked or
    /// not yet due, so nothing is ever returned ahead of an earlier record of
    /// the same key. A parked head holds its key until it is re-armed or
    /// discarded.
    pub fn peek_batch(&self, kind: EntityKind, max: usize, now: u64) -> Vec<MutationRecord> {
        let mut blocked: HashSet<&str> = HashSet::new();
        let mut batch = Vec::new();

        for record in &self.records {
            if batch.len() >= max {
                break;
            }
            if record.entity_kind != kind {
                continue;
            }
            if blocked.contains(record.entity_key.as_str()) {
                continue;
            }
            if record.parked
                || self.in_flight.contains(&record.id)
                || record.next_attempt_at > now
            {
                blocked.insert(record.entity_key.as_str());
                continue;
            }
            batch.push(record.clone());
        }

        batch
    }

    /// Mark a record in flight and return its current contents
    ///
    /// Returns `None` if the record was acked, dropped or parked since it was
    /// peeked, or if an earlier record of its key (parked included) is still
    /// queued.
    pub fn begin_send(&mut self, id: MutationId) -> Option<MutationRecord> {
        let position = self.position(id)?;
        let record = &self.records[position];
        if record.parked || self.in_flight.contains(&id) {
            return None;
        }
        let earlier_unresolved = self.records[..position]
            .iter()
            .any(|r| r.entity_kind == record.entity_kind && r.entity_key == record.entity_key);
        if earlier_unresolved {
            return None;
        }

        self.in_flight.insert(id);
        Some(record.clone())
    }

    /// Clear the in-flight mark without counting an attempt
    pub fn release(&mut self, id: MutationId) {
        self.in_flight.remove(&id);
    }

    /// Remove a record the server confirmed
    pub fn ack(&mut self, id: MutationId) -> Option<MutationRecord> {
        self.in_flight.remove(&id);
        let position = self.position(id)?;
        let record = self.records.remove(position);
        self.persist(JournalEntry::<MutationRecord>::Remove {
            key: id.to_string(),
        });
        Some(record)
    }

    /// Record a transient failure and schedule the next attempt
    ///
    /// The record keeps its place at the head of its key.
    pub fn fail(&mut self, id: MutationId, error: &str, now: u64) -> Option<RetryDecision> {
        self.in_flight.remove(&id);
        let position = self.position(id)?;

        let record = &mut self.records[position];
        record.attempts += 1;
        record.last_error = Some(error.to_string());

        let decision = if self.policy.is_exhausted(record.attempts) {
            record.parked = true;
            warn!(
                "Mutation {} parked after {} attempts: {}",
                id, record.attempts, error
            );
            self.events.emit(SyncEvent::RetryExhausted {
                mutation_id: id,
                attempts: record.attempts,
            });
            RetryDecision::Parked {
                attempts: record.attempts,
            }
        } else {
            let delay = self.policy.delay_for(record.attempts);
            let delay_ms = delay.as_millis() as u64;
            record.next_attempt_at = now + delay_ms;
            debug!(
                "Mutation {} retry {} in {}ms: {}",
                id, record.attempts, delay_ms, error
            );
            self.events.emit(SyncEvent::RetryScheduled {
                mutation_id: id,
                attempts: record.attempts,
                delay_ms,
            });
            RetryDecision::Retry {
                attempts: record.attempts,
                next_attempt_at: record.next_attempt_at,
            }
        };

        let updated = record.clone();
        self.persist(JournalEntry::Put {
            key: id.to_string(),
            value: updated,
        });
        Some(decision)
    }

    /// Remove a record without server confirmation (rejected or superseded)
    pub fn drop_record(&mut self, id: MutationId) -> Option<MutationRecord> {
        self.ack(id)
    }

    /// Drop every queued record of a key that is not currently in flight
    pub fn drop_pending_for_key(&mut self, kind: EntityKind, key: &str) -> Vec<MutationId> {
        let ids: Vec<MutationId> = self
            .records
            .iter()
            .filter(|r| r.entity_kind == kind && r.entity_key == key)
            .filter(|r| !self.in_flight.contains(&r.id))
            .map(|r| r.id)
            .collect();

        for id in &ids {
            self.drop_record(*id);
        }
        ids
    }

    /// Rewrite every queued reference to a temporary id
    ///
    /// Entity keys and any string in a payload equal to `old` become `new`.
    /// The rewrite is persisted with one atomic compaction, so either all
    /// records reference the new id on disk or none do.
    pub fn remap_temporary_id(&mut self, old: &str, new: &str) -> usize {
        if old == new {
            return 0;
        }

        let mut rewritten = 0;
        for record in &mut self.records {
            let mut touched = false;
            if record.entity_key == old {
                record.entity_key = new.to_string();
                touched = true;
            }
            if replace_string(&mut record.payload, old, new) {
                touched = true;
            }
            if touched {
                rewritten += 1;
            }
        }

        if rewritten > 0 {
            let live = self.live();
            let was_degraded = self.journal.is_degraded();
            match self.journal.compact(&live) {
                Ok(()) if was_degraded => self.report_recovered(),
                Ok(()) => {}
                Err(e) if was_degraded => debug!("Remap kept in memory: {}", e),
                Err(e) => {
                    self.journal.mark_degraded();
                    self.report_overflow(&e.overflow_message());
                }
            }
            info!("Remapped '{}' -> '{}' in {} queued mutations", old, new, rewritten);
        }
        rewritten
    }

    /// Re-arm parked records for another full retry budget
    pub fn retry_parked(&mut self) -> Vec<MutationId> {
        let mut ids = Vec::new();
        for record in self.records.iter_mut().filter(|r| r.parked) {
            record.parked = false;
            record.attempts = 0;
            record.next_attempt_at = 0;
            ids.push(record.id);
        }
        for id in &ids {
            if let Some(record) = self.get(*id).cloned() {
                self.persist(JournalEntry::Put {
                    key: id.to_string(),
                    value: record,
                });
            }
        }
        ids
    }

    /// Remove every parked record, returning them
    pub fn discard_parked(&mut self) -> Vec<MutationRecord> {
        let ids: Vec<MutationId> = self.parked().iter().map(|r| r.id).collect();
        ids.into_iter().filter_map(|id| self.drop_record(id)).collect()
    }

    pub fn get(&self, id: MutationId) -> Option<&MutationRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn contains(&self, id: MutationId) -> bool {
        self.position(id).is_some()
    }

    pub fn is_in_flight(&self, id: MutationId) -> bool {
        self.in_flight.contains(&id)
    }

    /// Whether any record of a key is in flight
    pub fn key_in_flight(&self, kind: EntityKind, key: &str) -> bool {
        self.records
            .iter()
            .any(|r| r.entity_kind == kind && r.entity_key == key && self.in_flight.contains(&r.id))
    }

    /// Ids of pending (not parked) records of a family, in queue order
    pub fn pending_ids(&self, kind: EntityKind) -> Vec<MutationId> {
        self.records
            .iter()
            .filter(|r| r.entity_kind == kind && !r.parked)
            .map(|r| r.id)
            .collect()
    }

    /// Pending (not parked) records, all families, in queue order
    pub fn pending(&self) -> Vec<&MutationRecord> {
        self.records.iter().filter(|r| !r.parked).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.records.iter().filter(|r| !r.parked).count()
    }

    /// Pending counts per family
    pub fn pending_by_kind(&self) -> HashMap<EntityKind, usize> {
        let mut counts = HashMap::new();
        for record in self.records.iter().filter(|r| !r.parked) {
            *counts.entry(record.entity_kind).or_insert(0) += 1;
        }
        counts
    }

    pub fn parked(&self) -> Vec<&MutationRecord> {
        self.records.iter().filter(|r| r.parked).collect()
    }

    pub fn parked_count(&self) -> usize {
        self.records.iter().filter(|r| r.parked).count()
    }

    /// Counts the status derivation works from: `(moving, stuck)`
    ///
    /// Records held behind a parked head of their key cannot move until
    /// the user re-arms or discards it, so they count as stuck.
    pub fn status_counts(&self) -> (usize, usize) {
        let mut parked_keys: HashSet<(EntityKind, &str)> = HashSet::new();
        let (mut moving, mut stuck) = (0, 0);
        for record in &self.records {
            let key = (record.entity_kind, record.entity_key.as_str());
            if record.parked {
                parked_keys.insert(key);
                stuck += 1;
            } else if parked_keys.contains(&key) {
                stuck += 1;
            } else {
                moving += 1;
            }
        }
        (moving, stuck)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Earliest future retry deadline among waiting records
    pub fn next_due(&self, now: u64) -> Option<u64> {
        self.records
            .iter()
            .filter(|r| !r.parked && !self.in_flight.contains(&r.id))
            .map(|r| r.next_attempt_at)
            .filter(|&at| at > now)
            .min()
    }

    /// Newest local timestamp of any queued record
    pub fn newest_timestamp(&self) -> u64 {
        self.records
            .iter()
            .map(|r| r.local_timestamp)
            .max()
            .unwrap_or(0)
    }

    /// Whether the queue is running without durable storage
    pub fn is_degraded(&self) -> bool {
        self.journal.is_degraded()
    }

    fn position(&self, id: MutationId) -> Option<usize> {
        self.records.iter().position(|r| r.id == id)
    }

    fn live(&self) -> Vec<(String, MutationRecord)> {
        self.records
            .iter()
            .map(|r| (r.id.to_string(), r.clone()))
            .collect()
    }

    fn persist(&mut self, entry: JournalEntry<MutationRecord>) {
        let records = &self.records;
        let live = || {
            records
                .iter()
                .map(|r| (r.id.to_string(), r.clone()))
                .collect()
        };
        let was_degraded = self.journal.is_degraded();
        match self.journal.write(&entry, live) {
            Ok(WriteOutcome::Recovered) => self.report_recovered(),
            Ok(_) => {}
            Err(e) if was_degraded => debug!("Mutation queue still memory-only: {}", e),
            Err(e) => self.report_overflow(&e.overflow_message()),
        }
    }

    fn report_overflow(&self, message: &str) {
        warn!("Mutation queue is memory-only: {}", message);
        self.events.emit(SyncEvent::QueueOverflow {
            namespace: QUEUE_NAMESPACE.to_string(),
            message: message.to_string(),
        });
    }

    fn report_recovered(&self) {
        info!("Mutation queue storage recovered");
        self.events.emit(SyncEvent::StorageRecovered {
            namespace: QUEUE_NAMESPACE.to_string(),
        });
    }
}

/// Replace every JSON string equal to `old` with `new`
fn replace_string(value: &mut Value, old: &str, new: &str) -> bool {
    match value {
        Value::String(s) if s == old => {
            *s = new.to_string();
            true
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |acc, item| replace_string(item, old, new) || acc),
        Value::Object(map) => map
            .values_mut()
            .fold(false, |acc, item| replace_string(item, old, new) || acc),
        _ => false,
    }
}

//! Entity stores
//!
//! One `EntityStore` per synchronized family. Each key holds a two-phase
//! value: the last server-confirmed entity plus the local patches still in
//! the mutation queue. Reads fold the patches over the confirmed value, so
//! local edits are visible immediately and survive a restart through the
//! store's own journal.

mod bookmark;
mod history;
mod progress;
mod shelf;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::models::{is_temporary_id, EntityKind, MutationId, MutationOp, MutationRecord};
use crate::queue::MutationQueue;
use crate::storage::journal::WriteOutcome;
use crate::storage::{Journal, JournalEntry, Storage, StorageResult};
use crate::sync::{EventSink, SyncEvent};

/// Inputs a patch needs besides the current value
#[derive(Debug, Clone, Copy)]
pub struct ApplyContext<'a> {
    /// Local timestamp of the mutation (epoch ms)
    pub timestamp: u64,
    pub device_id: &'a str,
}

/// Ordering of a server value against the newest pending local change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dominance {
    ServerNewer,
    LocalNewer,
    /// Within the ambiguity window
    Concurrent,
}

impl Dominance {
    /// Compare two epoch-ms timestamps; "newer" means beyond `window_ms`
    pub fn compare(server_ms: u64, local_ms: u64, window_ms: u64) -> Self {
        if server_ms > local_ms.saturating_add(window_ms) {
            Dominance::ServerNewer
        } else if local_ms > server_ms.saturating_add(window_ms) {
            Dominance::LocalNewer
        } else {
            Dominance::Concurrent
        }
    }
}

/// Conflict decision for a key with pending local work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Drop pending mutations and take the server value
    AcceptServer,
    /// Keep the local value queued
    KeepLocal,
}

/// A synchronized entity family
pub trait SyncEntity:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    type Patch: Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static;

    const KIND: EntityKind;

    /// Deleting a missing entity counts as success, including a server 404
    const IDEMPOTENT_DELETE: bool = false;

    /// Reconciliation never moves `updated_at` backward
    const MONOTONIC: bool = false;

    fn key(&self) -> &str;

    /// Rewrite the entity's own key (temporary id remap)
    fn set_key(&mut self, key: &str);

    fn updated_at_ms(&self) -> u64;

    /// Device that produced this value, when the family records it
    fn source_device(&self) -> Option<&str> {
        None
    }

    /// Apply one local change; `None` means the entity does not exist
    fn apply(
        current: Option<&Self>,
        key: &str,
        op: MutationOp,
        patch: Option<&Self::Patch>,
        ctx: &ApplyContext<'_>,
    ) -> Option<Self>;

    /// Decide a conflict between pending local work and a server value
    ///
    /// The server wins only when it is strictly newer and not an echo of
    /// this device's own write.
    fn resolve(local: Option<&Self>, server: &Self, dominance: Dominance, echo: bool) -> Verdict {
        let _ = (local, server);
        if dominance == Dominance::ServerNewer && !echo {
            Verdict::AcceptServer
        } else {
            Verdict::KeepLocal
        }
    }
}

/// A local change not yet confirmed by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "P: DeserializeOwned"))]
pub struct PendingPatch<P> {
    pub mutation_id: MutationId,
    pub op: MutationOp,
    #[serde(default)]
    pub patch: Option<P>,
    pub local_timestamp: u64,
}

/// Two-phase value of one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "E: DeserializeOwned, P: DeserializeOwned"))]
pub struct Slot<E, P> {
    pub confirmed: Option<E>,
    #[serde(default)]
    pub pending: Vec<PendingPatch<P>>,
}

impl<E, P> Default for Slot<E, P> {
    fn default() -> Self {
        Self {
            confirmed: None,
            pending: Vec::new(),
        }
    }
}

impl<E: SyncEntity> Slot<E, E::Patch> {
    fn fold(&self, key: &str, device_id: &str) -> Option<E> {
        self.pending.iter().fold(self.confirmed.clone(), |current, p| {
            let ctx = ApplyContext {
                timestamp: p.local_timestamp,
                device_id,
            };
            E::apply(current.as_ref(), key, p.op, p.patch.as_ref(), &ctx)
        })
    }

    fn newest_pending(&self) -> Option<u64> {
        self.pending.iter().map(|p| p.local_timestamp).max()
    }

    fn is_empty(&self) -> bool {
        self.confirmed.is_none() && self.pending.is_empty()
    }

    /// Replace the confirmed value unless a monotonic family would regress
    fn admit(&mut self, server: Option<E>) -> bool {
        if E::MONOTONIC {
            if let (Some(current), Some(incoming)) = (&self.confirmed, &server) {
                if incoming.updated_at_ms() < current.updated_at_ms() {
                    return false;
                }
            }
        }
        self.confirmed = server;
        true
    }
}

/// What `reconcile` did with a server value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing pending; the server value is now local state
    Applied,
    /// The value would have moved `updated_at` back; local state is untouched
    RejectedStale,
    /// Pending local work wins; it stays queued
    KeptLocal,
    /// Pending local work was superseded and dropped
    LostUpdate { dropped: Vec<MutationId> },
}

/// In-memory plus journaled state of one entity family
pub struct EntityStore<E: SyncEntity> {
    entries: BTreeMap<String, Slot<E, E::Patch>>,
    journal: Journal,
    device_id: String,
    ambiguity_window_ms: u64,
    events: EventSink,
}

impl<E: SyncEntity> EntityStore<E> {
    /// Storage namespace of this family's journal
    pub fn namespace() -> String {
        format!("store_{}", E::KIND)
    }

    pub fn open(
        storage: Arc<dyn Storage>,
        device_id: impl Into<String>,
        ambiguity_window_ms: u64,
        events: EventSink,
    ) -> StorageResult<Self> {
        let (journal, live) =
            Journal::open::<Slot<E, E::Patch>>(storage, &Self::namespace())?;
        let entries: BTreeMap<_, _> = live.into_iter().collect();
        debug!("Loaded {} {} entries", entries.len(), E::KIND);

        Ok(Self {
            entries,
            journal,
            device_id: device_id.into(),
            ambiguity_window_ms,
            events,
        })
    }

    /// Current local value: confirmed state with pending patches applied
    pub fn get_local(&self, key: &str) -> Option<E> {
        self.entries
            .get(key)
            .and_then(|slot| slot.fold(key, &self.device_id))
    }

    /// Last value the server confirmed
    pub fn get_confirmed(&self, key: &str) -> Option<E> {
        self.entries.get(key).and_then(|slot| slot.confirmed.clone())
    }

    /// Every existing local value, in key order
    pub fn list_local(&self) -> Vec<E> {
        self.entries
            .iter()
            .filter_map(|(key, slot)| slot.fold(key, &self.device_id))
            .collect()
    }

    pub fn has_pending(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|slot| !slot.pending.is_empty())
            .unwrap_or(false)
    }

    /// Ids of every pending patch, across keys
    pub fn pending_ids(&self) -> Vec<MutationId> {
        self.entries
            .values()
            .flat_map(|slot| slot.pending.iter().map(|p| p.mutation_id))
            .collect()
    }

    /// Apply a change locally and queue it for the server
    ///
    /// Returns `None` when nothing had to be sent: a delete of a key that is
    /// already gone, a repeated delete while the first is still queued, or a
    /// delete of a temporary entity the server never saw.
    pub fn mutate_local(
        &mut self,
        queue: &mut MutationQueue,
        key: &str,
        op: MutationOp,
        patch: Option<E::Patch>,
        timestamp: u64,
    ) -> Option<MutationId> {
        if op == MutationOp::Delete {
            if let Some(existing) = self.coalesce_delete(queue, key) {
                return existing;
            }
        }

        let payload = match &patch {
            Some(patch) => serde_json::to_value(patch).unwrap_or(Value::Null),
            None => Value::Null,
        };
        let record = MutationRecord::new(E::KIND, key, op, payload, timestamp);
        let mutation_id = record.id;

        let slot = self.entries.entry(key.to_string()).or_default();
        slot.pending.push(PendingPatch {
            mutation_id,
            op,
            patch,
            local_timestamp: timestamp,
        });
        queue.enqueue(record);
        self.persist(key);

        Some(mutation_id)
    }

    /// Merge a server value for a key under the conflict policy
    pub fn reconcile(
        &mut self,
        queue: &mut MutationQueue,
        key: &str,
        server: Option<E>,
    ) -> ReconcileOutcome {
        let device_id = self.device_id.clone();
        let window = self.ambiguity_window_ms;
        let slot = self.entries.entry(key.to_string()).or_default();

        let Some(newest_local) = slot.newest_pending() else {
            let outcome = if slot.admit(server) {
                ReconcileOutcome::Applied
            } else {
                debug!("Rejected stale {} for '{}'", E::KIND, key);
                ReconcileOutcome::RejectedStale
            };
            self.persist(key);
            return outcome;
        };

        let verdict = match &server {
            Some(server) => {
                let dominance = Dominance::compare(server.updated_at_ms(), newest_local, window);
                let echo = server.source_device() == Some(device_id.as_str());
                let local = slot.fold(key, &device_id);
                E::resolve(local.as_ref(), server, dominance, echo)
            }
            None => Verdict::KeepLocal,
        };

        let outcome = match verdict {
            Verdict::KeepLocal => {
                slot.admit(server);
                ReconcileOutcome::KeptLocal
            }
            Verdict::AcceptServer => {
                if !slot.admit(server) {
                    debug!("Rejected stale {} for '{}', local work kept", E::KIND, key);
                    return ReconcileOutcome::RejectedStale;
                }
                let dropped = queue.drop_pending_for_key(E::KIND, key);
                slot.pending.retain(|p| !dropped.contains(&p.mutation_id));
                if dropped.is_empty() {
                    ReconcileOutcome::KeptLocal
                } else {
                    info!(
                        "Remote {} for '{}' superseded {} local mutations",
                        E::KIND,
                        key,
                        dropped.len()
                    );
                    self.events.emit(SyncEvent::LostUpdate {
                        kind: E::KIND,
                        key: key.to_string(),
                        dropped: dropped.clone(),
                    });
                    ReconcileOutcome::LostUpdate { dropped }
                }
            }
        };

        self.persist(key);
        outcome
    }

    /// Settle this device's own mutation with the server's post-write value
    ///
    /// No conflict rule applies: the response is the outcome of our write.
    pub fn confirm(&mut self, key: &str, mutation_id: MutationId, server: Option<E>) {
        let slot = self.entries.entry(key.to_string()).or_default();
        slot.pending.retain(|p| p.mutation_id != mutation_id);
        slot.admit(server);
        self.persist(key);
    }

    /// Settle a mutation whose response carried no entity
    ///
    /// The patch itself is folded into the confirmed value.
    pub fn confirm_local(&mut self, key: &str, mutation_id: MutationId) {
        let device_id = self.device_id.clone();
        let Some(slot) = self.entries.get_mut(key) else {
            return;
        };
        let Some(index) = slot.pending.iter().position(|p| p.mutation_id == mutation_id) else {
            return;
        };

        let patch = slot.pending.remove(index);
        let ctx = ApplyContext {
            timestamp: patch.local_timestamp,
            device_id: &device_id,
        };
        slot.confirmed = E::apply(
            slot.confirmed.as_ref(),
            key,
            patch.op,
            patch.patch.as_ref(),
            &ctx,
        );
        self.persist(key);
    }

    /// Forget a pending patch whose mutation was rejected or discarded
    pub fn drop_pending(&mut self, key: &str, mutation_id: MutationId) -> bool {
        let Some(slot) = self.entries.get_mut(key) else {
            return false;
        };
        let before = slot.pending.len();
        slot.pending.retain(|p| p.mutation_id != mutation_id);
        let removed = slot.pending.len() != before;
        if removed {
            self.persist(key);
        }
        removed
    }

    /// Move a key's state to the server-assigned key
    pub fn rekey(&mut self, old: &str, new: &str) {
        if old == new {
            return;
        }
        let Some(mut slot) = self.entries.remove(old) else {
            return;
        };
        if let Some(confirmed) = slot.confirmed.as_mut() {
            confirmed.set_key(new);
        }
        if let Some(existing) = self.entries.remove(new) {
            // Keep anything already recorded under the new key in front
            let mut pending = existing.pending;
            pending.append(&mut slot.pending);
            slot.pending = pending;
            if slot.confirmed.is_none() {
                slot.confirmed = existing.confirmed;
            }
        }
        self.entries.insert(new.to_string(), slot);
        self.persist(old);
        self.persist(new);
    }

    /// Remove confirmed entities the server no longer lists
    ///
    /// Keys with pending local work are left alone.
    pub fn remove_missing(&mut self, present: &HashSet<String>) -> Vec<String> {
        let gone: Vec<String> = self
            .entries
            .iter()
            .filter(|(key, slot)| slot.pending.is_empty() && !present.contains(key.as_str()))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &gone {
            if let Some(slot) = self.entries.get_mut(key) {
                slot.confirmed = None;
            }
            self.persist(key);
        }
        gone
    }

    /// Drop pending patches whose mutation is no longer queued
    ///
    /// Covers a crash between the queue ack and the store update.
    pub fn prune(&mut self, is_queued: impl Fn(MutationId) -> bool) -> usize {
        let mut touched = Vec::new();
        let mut pruned = 0;
        for (key, slot) in self.entries.iter_mut() {
            let before = slot.pending.len();
            slot.pending.retain(|p| is_queued(p.mutation_id));
            if slot.pending.len() != before {
                pruned += before - slot.pending.len();
                touched.push(key.clone());
            }
        }
        for key in &touched {
            self.persist(key);
        }
        if pruned > 0 {
            warn!("Pruned {} orphaned {} patches", pruned, E::KIND);
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.list_local().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn coalesce_delete(
        &mut self,
        queue: &mut MutationQueue,
        key: &str,
    ) -> Option<Option<MutationId>> {
        if E::IDEMPOTENT_DELETE && self.get_local(key).is_none() {
            let queued_delete = self.entries.get(key).and_then(|slot| {
                slot.pending
                    .iter()
                    .rev()
                    .find(|p| p.op == MutationOp::Delete)
                    .map(|p| p.mutation_id)
            });
            debug!("Delete of absent {} '{}' coalesced", E::KIND, key);
            return Some(queued_delete);
        }

        if is_temporary_id(key) && !queue.key_in_flight(E::KIND, key) {
            let dropped = queue.drop_pending_for_key(E::KIND, key);
            self.entries.remove(key);
            self.persist(key);
            debug!(
                "Deleted unsynced {} '{}', dropped {} queued mutations",
                E::KIND,
                key,
                dropped.len()
            );
            return Some(None);
        }

        None
    }

    fn persist(&mut self, key: &str) {
        let entry = match self.entries.get(key) {
            Some(slot) if !slot.is_empty() => JournalEntry::Put {
                key: key.to_string(),
                value: slot.clone(),
            },
            _ => {
                self.entries.remove(key);
                JournalEntry::Remove {
                    key: key.to_string(),
                }
            }
        };

        let entries = &self.entries;
        let live = || {
            entries
                .iter()
                .map(|(k, slot)| (k.clone(), slot.clone()))
                .collect()
        };
        let was_degraded = self.journal.is_degraded();
        match self.journal.write(&entry, live) {
            Ok(WriteOutcome::Recovered) => {
                info!("{} store storage recovered", E::KIND);
                self.events.emit(SyncEvent::StorageRecovered {
                    namespace: Self::namespace(),
                });
            }
            Ok(_) => {}
            Err(e) if was_degraded => debug!("{} store still memory-only: {}", E::KIND, e),
            Err(e) => {
                warn!("{} store is memory-only: {}", E::KIND, e);
                self.events.emit(SyncEvent::QueueOverflow {
                    namespace: Self::namespace(),
                    message: e.overflow_message(),
                });
            }
        }
    }
}

//! Sync session
//!
//! `SyncSession` is the context object every component works through. It
//! owns the mutation queue and the four entity stores behind one short
//! lock that is never held across an `.await`, plus the connectivity
//! monitor, the status machine and the diagnostics channel.
//!
//! ## Usage
//!
//! ```ignore
//! let session = Arc::new(SyncSession::open_with_config(&config)?);
//! session.update_position("book-1", "ch-3", 120, 0.42);
//! let orchestrator = Arc::new(Orchestrator::new(session.clone(), transport));
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info};

use crate::clock::{Clock, Stamper, SystemClock};
use crate::config::{Config, SyncTuning};
use crate::device::DeviceId;
use crate::models::{
    Bookmark, BookmarkPatch, BookshelfEntry, EntityKind, HistoryEntry, HistoryPatch, MutationId,
    MutationOp, MutationRecord, PositionPatch, ReadingPosition, ShelfPatch, ShelfStatus,
};
use crate::queue::MutationQueue;
use crate::retry::RetryPolicy;
use crate::storage::{SqliteStorage, Storage, StorageResult};
use crate::store::{EntityStore, SyncEntity};
use crate::sync::{Connectivity, ConnectivityMonitor, EventSink, StatusMachine, SyncEvent, SyncStatus};

/// Everything guarded by the session lock
pub(crate) struct LocalState {
    pub(crate) queue: MutationQueue,
    pub(crate) progress: EntityStore<ReadingPosition>,
    pub(crate) shelf: EntityStore<BookshelfEntry>,
    pub(crate) bookmarks: EntityStore<Bookmark>,
    pub(crate) history: EntityStore<HistoryEntry>,
    pub(crate) reconciling: HashSet<EntityKind>,
    /// Status of the auth failure that stopped draining
    pub(crate) auth_blocked: Option<u16>,
    stamper: Stamper,
}

impl LocalState {
    fn pending_ids(&self, kind: EntityKind) -> Vec<MutationId> {
        self.queue.pending_ids(kind)
    }

    fn entity_count(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Progress => self.progress.len(),
            EntityKind::Bookshelf => self.shelf.len(),
            EntityKind::Bookmark => self.bookmarks.len(),
            EntityKind::History => self.history.len(),
        }
    }

    /// Forget the store side of a mutation that left the queue unconfirmed
    pub(crate) fn drop_store_patch(&mut self, record: &MutationRecord) {
        let key = record.entity_key.as_str();
        match record.entity_kind {
            EntityKind::Progress => self.progress.drop_pending(key, record.id),
            EntityKind::Bookshelf => self.shelf.drop_pending(key, record.id),
            EntityKind::Bookmark => self.bookmarks.drop_pending(key, record.id),
            EntityKind::History => self.history.drop_pending(key, record.id),
        };
    }
}

/// Typed access to a family's store inside `LocalState`
pub(crate) trait Family: SyncEntity {
    fn parts(state: &mut LocalState) -> (&mut EntityStore<Self>, &mut MutationQueue);
    fn store(state: &LocalState) -> &EntityStore<Self>;
}

macro_rules! family {
    ($entity:ty, $field:ident) => {
        impl Family for $entity {
            fn parts(state: &mut LocalState) -> (&mut EntityStore<Self>, &mut MutationQueue) {
                (&mut state.$field, &mut state.queue)
            }

            fn store(state: &LocalState) -> &EntityStore<Self> {
                &state.$field
            }
        }
    };
}

family!(ReadingPosition, progress);
family!(BookshelfEntry, shelf);
family!(Bookmark, bookmarks);
family!(HistoryEntry, history);

/// Sync state of one entity family
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "pending", rename_all = "snake_case")]
pub enum FamilyState {
    Clean,
    Dirty(Vec<MutationId>),
    Reconciling,
}

/// Point-in-time summary for status displays
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub device_id: String,
    pub status: SyncStatus,
    pub connectivity: Connectivity,
    pub pending: usize,
    pub parked: usize,
    pub pending_by_kind: BTreeMap<EntityKind, usize>,
    pub entities: BTreeMap<EntityKind, usize>,
    pub auth_required: Option<u16>,
    /// Local storage is exhausted and changes are held in memory
    pub storage_degraded: bool,
}

/// Explicit context of one user's sync session
pub struct SyncSession {
    device_id: DeviceId,
    clock: Arc<dyn Clock>,
    tuning: SyncTuning,
    state: Mutex<LocalState>,
    monitor: Arc<ConnectivityMonitor>,
    status: StatusMachine,
    events: EventSink,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncEvent>>>,
    wake: Notify,
}

impl SyncSession {
    /// Restore a session from storage
    ///
    /// Queued mutations and two-phase entity values are replayed; pending
    /// patches whose mutation is no longer queued are pruned.
    pub fn open(
        storage: Arc<dyn Storage>,
        device_id: DeviceId,
        clock: Arc<dyn Clock>,
        tuning: SyncTuning,
    ) -> StorageResult<Self> {
        let (events, event_rx) = EventSink::channel();
        let device = device_id.as_str();
        let window = tuning.ambiguity_window_ms;

        let queue = MutationQueue::open(
            storage.clone(),
            RetryPolicy::from_tuning(&tuning),
            events.clone(),
        )?;
        let mut progress = EntityStore::open(storage.clone(), device, window, events.clone())?;
        let mut shelf = EntityStore::open(storage.clone(), device, window, events.clone())?;
        let mut bookmarks = EntityStore::open(storage.clone(), device, window, events.clone())?;
        let mut history = EntityStore::open(storage, device, window, events.clone())?;

        let is_queued = |id: MutationId| queue.contains(id);
        progress.prune(is_queued);
        shelf.prune(is_queued);
        bookmarks.prune(is_queued);
        history.prune(is_queued);

        let stamper = Stamper::starting_after(queue.newest_timestamp());
        let monitor = Arc::new(ConnectivityMonitor::new(&tuning, events.clone()));
        let status = StatusMachine::new(events.clone());
        let (moving, stuck) = queue.status_counts();
        status.update(monitor.current(), moving, stuck);

        info!(
            "Session opened for {} ({} pending, {} parked)",
            device_id,
            queue.pending_count(),
            queue.parked_count()
        );

        Ok(Self {
            device_id,
            clock,
            tuning,
            state: Mutex::new(LocalState {
                queue,
                progress,
                shelf,
                bookmarks,
                history,
                reconciling: HashSet::new(),
                auth_blocked: None,
                stamper,
            }),
            monitor,
            status,
            events,
            event_rx: Mutex::new(Some(event_rx)),
            wake: Notify::new(),
        })
    }

    /// Open the on-disk session described by a configuration
    pub fn open_with_config(config: &Config) -> Result<Self> {
        let storage = SqliteStorage::open(&config.sqlite_path())
            .with_context(|| format!("Failed to open {}", config.sqlite_path().display()))?;
        let device_id = DeviceId::load_or_create(&config.device_id_path())
            .context("Failed to load device identity")?;

        Self::open(
            Arc::new(storage),
            device_id,
            Arc::new(SystemClock),
            config.sync.clone(),
        )
        .context("Failed to restore sync state")
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn tuning(&self) -> &SyncTuning {
        &self.tuning
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn status(&self) -> SyncStatus {
        self.status.current()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Take the diagnostics receiver (can only be taken once)
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.lock().take()
    }

    pub fn connectivity(&self) -> Connectivity {
        self.monitor.current()
    }

    /// Force the connectivity state and re-derive the status
    pub fn set_connectivity(&self, connectivity: Connectivity) {
        self.monitor.force(connectivity);
        self.refresh_status();
        if connectivity == Connectivity::Online {
            self.wake.notify_one();
        }
    }

    // ----- Reading positions -----

    pub fn update_position(
        &self,
        book_id: &str,
        chapter_id: &str,
        offset: u32,
        percentage: f32,
    ) -> MutationId {
        let patch = PositionPatch::new(chapter_id, offset, percentage);
        self.mutate::<ReadingPosition>(book_id, MutationOp::Update, Some(patch))
            .unwrap_or_default()
    }

    pub fn position(&self, book_id: &str) -> Option<ReadingPosition> {
        self.get_local::<ReadingPosition>(book_id)
    }

    // ----- Bookshelf -----

    pub fn add_to_shelf(&self, book_id: &str, status: ShelfStatus) -> MutationId {
        self.mutate::<BookshelfEntry>(book_id, MutationOp::Create, Some(ShelfPatch { status }))
            .unwrap_or_default()
    }

    pub fn set_shelf_status(&self, book_id: &str, status: ShelfStatus) -> MutationId {
        let op = if self.shelf_entry(book_id).is_some() {
            MutationOp::Update
        } else {
            MutationOp::Create
        };
        self.mutate::<BookshelfEntry>(book_id, op, Some(ShelfPatch { status }))
            .unwrap_or_default()
    }

    /// Remove a book from the shelf; `None` if it was not on it
    pub fn remove_from_shelf(&self, book_id: &str) -> Option<MutationId> {
        self.mutate::<BookshelfEntry>(book_id, MutationOp::Delete, None)
    }

    pub fn shelf_entry(&self, book_id: &str) -> Option<BookshelfEntry> {
        self.get_local::<BookshelfEntry>(book_id)
    }

    pub fn bookshelf(&self) -> Vec<BookshelfEntry> {
        self.list_local::<BookshelfEntry>()
    }

    // ----- Bookmarks -----

    /// Create a bookmark and return its temporary id
    pub fn add_bookmark(
        &self,
        book_id: &str,
        chapter_id: &str,
        position: u32,
        note: Option<String>,
        highlight_text: Option<String>,
    ) -> String {
        let id = Bookmark::temporary_id();
        let patch = BookmarkPatch {
            book_id: Some(book_id.to_string()),
            chapter_id: Some(chapter_id.to_string()),
            position: Some(position),
            note,
            highlight_text,
        };
        self.mutate::<Bookmark>(&id, MutationOp::Create, Some(patch));
        id
    }

    /// Edit a bookmark; `None` if it does not exist locally
    pub fn edit_bookmark(&self, id: &str, patch: BookmarkPatch) -> Option<MutationId> {
        self.bookmark(id)?;
        self.mutate::<Bookmark>(id, MutationOp::Update, Some(patch))
    }

    /// Delete a bookmark
    ///
    /// A bookmark the server has never seen is removed locally along with
    /// its queued mutations, and nothing is sent.
    pub fn delete_bookmark(&self, id: &str) -> Option<MutationId> {
        self.mutate::<Bookmark>(id, MutationOp::Delete, None)
    }

    pub fn bookmark(&self, id: &str) -> Option<Bookmark> {
        self.get_local::<Bookmark>(id)
    }

    pub fn bookmarks_for(&self, book_id: &str) -> Vec<Bookmark> {
        self.list_local::<Bookmark>()
            .into_iter()
            .filter(|b| b.book_id == book_id)
            .collect()
    }

    // ----- Reading history -----

    pub fn record_reading(&self, book_id: &str, chapter_id: &str) -> MutationId {
        let patch = HistoryPatch {
            chapter_id: chapter_id.to_string(),
        };
        self.mutate::<HistoryEntry>(book_id, MutationOp::Update, Some(patch))
            .unwrap_or_default()
    }

    pub fn remove_history(&self, book_id: &str) -> Option<MutationId> {
        self.mutate::<HistoryEntry>(book_id, MutationOp::Delete, None)
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        let mut entries = self.list_local::<HistoryEntry>();
        entries.sort_by(|a, b| b.last_read_at.cmp(&a.last_read_at));
        entries
    }

    // ----- Queue inspection -----

    /// Pending (not parked) mutations in queue order
    pub fn pending(&self) -> Vec<MutationRecord> {
        self.state
            .lock()
            .queue
            .pending()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn parked(&self) -> Vec<MutationRecord> {
        self.state
            .lock()
            .queue
            .parked()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Give parked mutations a fresh retry budget
    pub fn retry_parked(&self) -> usize {
        let count = self.with_state(|state| state.queue.retry_parked().len());
        if count > 0 {
            info!("Re-armed {} parked mutations", count);
            self.wake.notify_one();
        }
        count
    }

    /// Drop parked mutations and roll back their local effect
    pub fn discard_parked(&self) -> usize {
        let discarded = self.with_state(|state| {
            let records = state.queue.discard_parked();
            for record in &records {
                state.drop_store_patch(record);
            }
            records
        });

        for record in &discarded {
            self.events.emit(SyncEvent::SyncConflict {
                kind: record.entity_kind,
                key: record.entity_key.clone(),
                mutation_id: record.id,
                status: None,
                message: format!(
                    "discarded after {} attempts: {}",
                    record.attempts,
                    record.last_error.as_deref().unwrap_or("unknown error")
                ),
            });
        }
        discarded.len()
    }

    pub fn family_state(&self, kind: EntityKind) -> FamilyState {
        let state = self.state.lock();
        if state.reconciling.contains(&kind) {
            return FamilyState::Reconciling;
        }
        let pending = state.pending_ids(kind);
        if pending.is_empty() {
            FamilyState::Clean
        } else {
            FamilyState::Dirty(pending)
        }
    }

    /// Clear an auth stop after the user re-authenticated
    pub fn resume_after_auth(&self) {
        let was_blocked = self.with_state(|state| state.auth_blocked.take());
        if was_blocked.is_some() {
            info!("Draining resumed after re-authentication");
            self.wake.notify_one();
        }
    }

    pub fn auth_required(&self) -> Option<u16> {
        self.state.lock().auth_blocked
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        let pending_by_kind = state.queue.pending_by_kind().into_iter().collect();
        let entities = EntityKind::ALL
            .iter()
            .map(|kind| (*kind, state.entity_count(*kind)))
            .collect();

        SessionSnapshot {
            device_id: self.device_id.to_string(),
            status: self.status.current(),
            connectivity: self.monitor.current(),
            pending: state.queue.pending_count(),
            parked: state.queue.parked_count(),
            pending_by_kind,
            entities,
            auth_required: state.auth_blocked,
            storage_degraded: state.queue.is_degraded(),
        }
    }

    /// Re-derive and publish the status
    pub fn refresh_status(&self) -> SyncStatus {
        let (moving, stuck) = self.state.lock().queue.status_counts();
        self.status.update(self.monitor.current(), moving, stuck)
    }

    /// Run `f` under the session lock, then re-derive the status
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut LocalState) -> R) -> R {
        let (result, (moving, stuck)) = {
            let mut state = self.state.lock();
            let result = f(&mut state);
            (result, state.queue.status_counts())
        };
        self.status.update(self.monitor.current(), moving, stuck);
        result
    }

    /// Resolves when a local mutation or re-arm wants a drain
    pub(crate) async fn work_available(&self) {
        self.wake.notified().await
    }

    pub(crate) fn get_local<E: Family>(&self, key: &str) -> Option<E> {
        E::store(&self.state.lock()).get_local(key)
    }

    pub(crate) fn list_local<E: Family>(&self) -> Vec<E> {
        E::store(&self.state.lock()).list_local()
    }

    fn mutate<E: Family>(
        &self,
        key: &str,
        op: MutationOp,
        patch: Option<E::Patch>,
    ) -> Option<MutationId> {
        let clock = self.clock.as_ref();
        let id = self.with_state(|state| {
            let timestamp = state.stamper.next(clock);
            let (store, queue) = E::parts(state);
            store.mutate_local(queue, key, op, patch, timestamp)
        });
        if id.is_some() {
            debug!("Local {} {} '{}'", op, E::KIND, key);
            self.wake.notify_one();
        }
        id
    }
}

//! Sync orchestrator
//!
//! Drains the mutation queue against the server and feeds responses back
//! into the entity stores.
//!
//! ## Drain pass
//!
//! 1. For each family, peek a batch of due records (per-key order kept)
//! 2. Send each record; cancellation is only checked between sends
//! 3. Ack and reconcile on success, schedule a retry on transient failure,
//!    drop with a `SyncConflict` on permanent failure, stop on auth failure
//! 4. Repeat rounds until a round makes no progress
//!
//! A network error or timeout ends the pass: the server is unreachable, so
//! the remaining records would fail the same way.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connectivity::Connectivity;
use super::endpoint;
use super::{EventSink, SyncEvent};
use crate::error::SyncError;
use crate::models::{
    is_temporary_id, Bookmark, BookshelfEntry, EntityKind, HistoryEntry, MutationOp,
    MutationRecord, ReadingPosition,
};
use crate::queue::RetryDecision;
use crate::session::{Family, SyncSession};
use crate::transport::{Method, Response, Transport, TransportError};

/// What the orchestrator is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Idle,
    Draining,
    /// Waiting for a retry deadline
    BackingOff,
    Offline,
}

/// Why a drain pass ended early
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Cancelled,
    Offline,
    /// A send failed at the network level
    Unreachable,
    AuthRequired,
}

/// Counters of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub sent: usize,
    pub acked: usize,
    pub retried: usize,
    pub parked: usize,
    pub rejected: usize,
    pub stopped: Option<StopReason>,
}

impl DrainReport {
    fn progressed(&self, before: &DrainReport) -> bool {
        self.acked + self.rejected + self.parked > before.acked + before.rejected + before.parked
    }
}

enum SendOutcome {
    Acked,
    Retried,
    Parked,
    Rejected,
    Stop(StopReason),
}

/// Drives the queue against a transport
pub struct Orchestrator {
    session: Arc<SyncSession>,
    transport: Arc<dyn Transport>,
    events: EventSink,
    state: watch::Sender<OrchestratorState>,
    /// Serializes drain and refresh passes
    pass: Mutex<()>,
}

impl Orchestrator {
    pub fn new(session: Arc<SyncSession>, transport: Arc<dyn Transport>) -> Self {
        let (state, _) = watch::channel(OrchestratorState::Idle);
        let events = session.events().clone();
        Self {
            session,
            transport,
            events,
            state,
            pass: Mutex::new(()),
        }
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<OrchestratorState> {
        self.state.subscribe()
    }

    /// Send everything currently due
    pub async fn drain(&self, cancel: &CancellationToken) -> DrainReport {
        let _pass = self.pass.lock().await;
        let mut report = DrainReport::default();

        if let Some(reason) = self.blocked() {
            report.stopped = Some(reason);
            self.settle();
            return report;
        }

        self.set_state(OrchestratorState::Draining);
        loop {
            let before = report.clone();
            for kind in EntityKind::ALL {
                let stop = match kind {
                    EntityKind::Progress => {
                        self.drain_round::<ReadingPosition>(cancel, &mut report).await
                    }
                    EntityKind::Bookshelf => {
                        self.drain_round::<BookshelfEntry>(cancel, &mut report).await
                    }
                    EntityKind::Bookmark => self.drain_round::<Bookmark>(cancel, &mut report).await,
                    EntityKind::History => {
                        self.drain_round::<HistoryEntry>(cancel, &mut report).await
                    }
                };
                if stop.is_some() {
                    report.stopped = stop;
                    break;
                }
            }
            if report.stopped.is_some() || !report.progressed(&before) {
                break;
            }
        }

        if report.sent > 0 {
            info!(
                "Drain: {} sent, {} acked, {} retrying, {} parked, {} rejected",
                report.sent, report.acked, report.retried, report.parked, report.rejected
            );
        }
        self.settle();
        report
    }

    /// Fetch one family's list and reconcile every entity
    ///
    /// Confirmed entities the server no longer lists are removed unless
    /// they have pending local work.
    pub async fn refresh(&self, kind: EntityKind) -> Result<usize, SyncError> {
        let _pass = self.pass.lock().await;
        match kind {
            EntityKind::Progress => self.refresh_family::<ReadingPosition>().await,
            EntityKind::Bookshelf => self.refresh_family::<BookshelfEntry>().await,
            EntityKind::Bookmark => self.refresh_family::<Bookmark>().await,
            EntityKind::History => self.refresh_family::<HistoryEntry>().await,
        }
    }

    /// Refresh every family; stops at the first auth failure
    pub async fn refresh_all(&self) -> Result<usize, SyncError> {
        let mut total = 0;
        let mut last_error = None;
        for kind in EntityKind::ALL {
            match self.refresh(kind).await {
                Ok(count) => total += count,
                Err(e @ SyncError::Auth { .. }) => return Err(e),
                Err(e) => {
                    warn!("Refresh of {} failed: {}", kind, e);
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if total == 0 => Err(e),
            _ => Ok(total),
        }
    }

    /// Drain and reconcile until cancelled
    ///
    /// Wakes on connectivity changes, local mutations, the safety-sync
    /// timer, and the earliest retry deadline.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut connectivity = self.session.monitor().subscribe();
        let period = self
            .session
            .tuning()
            .safety_sync_interval()
            .max(Duration::from_secs(1));
        let mut safety = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        safety.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Sync orchestrator started");
        loop {
            let backoff = self.next_retry_delay();
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let now = *connectivity.borrow_and_update();
                    self.session.refresh_status();
                    match now {
                        Connectivity::Online => self.full_pass(&cancel).await,
                        Connectivity::Offline => self.set_state(OrchestratorState::Offline),
                        Connectivity::Unknown => {}
                    }
                }
                _ = self.session.work_available() => {
                    if self.session.connectivity() == Connectivity::Online {
                        self.drain(&cancel).await;
                    }
                }
                _ = safety.tick() => {
                    if self.session.connectivity() == Connectivity::Online {
                        self.full_pass(&cancel).await;
                    }
                }
                _ = sleep_or_forever(backoff) => {
                    self.drain(&cancel).await;
                }
            }
        }
        info!("Sync orchestrator stopped");
    }

    async fn full_pass(&self, cancel: &CancellationToken) {
        let report = self.drain(cancel).await;
        if report.stopped.is_some() {
            return;
        }
        if let Err(e) = self.refresh_all().await {
            warn!("Reconciliation pass failed: {}", e);
        }
    }

    async fn drain_round<E: Family>(
        &self,
        cancel: &CancellationToken,
        report: &mut DrainReport,
    ) -> Option<StopReason> {
        let now = self.session.now_ms();
        let batch_size = self.session.tuning().batch_size.max(1);
        let batch = self
            .session
            .with_state(|state| state.queue.peek_batch(E::KIND, batch_size, now));

        for peeked in batch {
            if let Some(reason) = self.blocked() {
                return Some(reason);
            }
            if cancel.is_cancelled() {
                return Some(StopReason::Cancelled);
            }

            // Skipped when an earlier record of the key failed in this pass
            let Some(record) = self
                .session
                .with_state(|state| state.queue.begin_send(peeked.id))
            else {
                continue;
            };

            report.sent += 1;
            match self.send::<E>(record).await {
                SendOutcome::Acked => report.acked += 1,
                SendOutcome::Retried => report.retried += 1,
                SendOutcome::Parked => report.parked += 1,
                SendOutcome::Rejected => report.rejected += 1,
                SendOutcome::Stop(reason) => return Some(reason),
            }
        }
        None
    }

    /// Send one in-flight record and settle it
    async fn send<E: Family>(&self, record: MutationRecord) -> SendOutcome {
        let request = endpoint::mutation_request(&record, self.session.device_id().as_str());
        debug!("{} {} ({})", request.method, request.path, record.id);

        let timeout = self.session.tuning().request_timeout();
        let result = match tokio::time::timeout(
            timeout,
            self.transport
                .send(request.method, &request.path, request.body),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        match result {
            Ok(response) => {
                self.settle_success::<E>(&record, Some(&response));
                SendOutcome::Acked
            }
            Err(TransportError::Http { status: 404, .. })
                if record.op == MutationOp::Delete && E::IDEMPOTENT_DELETE =>
            {
                debug!("{} '{}' already deleted on server", E::KIND, record.entity_key);
                self.settle_success::<E>(&record, None);
                SendOutcome::Acked
            }
            Err(error) => self.settle_failure::<E>(&record, error),
        }
    }

    fn settle_success<E: Family>(&self, record: &MutationRecord, response: Option<&Response>) {
        let body = response.and_then(|r| r.body.as_ref());
        let server = match record.op {
            MutationOp::Delete => None,
            _ => endpoint::parse_entity::<E>(body),
        };

        let remapped = self.session.with_state(|state| {
            state.queue.ack(record.id);
            let (store, queue) = E::parts(state);

            let mut key = record.entity_key.clone();
            let mut remapped = None;
            if record.op == MutationOp::Create && is_temporary_id(&key) {
                if let Some(server) = &server {
                    let new_key = server.key().to_string();
                    if new_key != key {
                        let rewritten = queue.remap_temporary_id(&key, &new_key);
                        store.rekey(&key, &new_key);
                        remapped = Some((key.clone(), new_key.clone(), rewritten));
                        key = new_key;
                    }
                }
            }

            match (record.op, server) {
                (MutationOp::Delete, _) => store.confirm(&key, record.id, None),
                (_, Some(server)) => store.confirm(&key, record.id, Some(server)),
                (_, None) => store.confirm_local(&key, record.id),
            }
            remapped
        });

        if let Some((old, new, rewritten)) = remapped {
            info!("{} '{}' is now '{}'", E::KIND, old, new);
            self.events.emit(SyncEvent::IdRemapped { old, new, rewritten });
        }
    }

    fn settle_failure<E: Family>(
        &self,
        record: &MutationRecord,
        error: TransportError,
    ) -> SendOutcome {
        let unreachable = error.is_connectivity();
        match SyncError::from(error) {
            SyncError::Auth { status } => {
                warn!("Server requires authentication (HTTP {})", status);
                self.session.with_state(|state| {
                    state.queue.release(record.id);
                    state.auth_blocked = Some(status);
                });
                self.events.emit(SyncEvent::AuthRequired { status });
                SendOutcome::Stop(StopReason::AuthRequired)
            }
            SyncError::PermanentSend { status, message } => {
                warn!(
                    "Server rejected {} {} '{}': {}",
                    record.op, E::KIND, record.entity_key, message
                );
                self.session.with_state(|state| {
                    state.queue.drop_record(record.id);
                    state.drop_store_patch(record);
                });
                self.events.emit(SyncEvent::SyncConflict {
                    kind: E::KIND,
                    key: record.entity_key.clone(),
                    mutation_id: record.id,
                    status: Some(status),
                    message,
                });
                SendOutcome::Rejected
            }
            error => {
                let now = self.session.now_ms();
                let message = error.to_string();
                let decision = self
                    .session
                    .with_state(|state| state.queue.fail(record.id, &message, now));

                if unreachable {
                    self.session.monitor().record_probe(false);
                    return SendOutcome::Stop(StopReason::Unreachable);
                }
                match decision {
                    Some(RetryDecision::Parked { .. }) => SendOutcome::Parked,
                    _ => SendOutcome::Retried,
                }
            }
        }
    }

    async fn refresh_family<E: Family>(&self) -> Result<usize, SyncError> {
        let path = endpoint::list_path(E::KIND);
        self.session.with_state(|state| state.reconciling.insert(E::KIND));

        let timeout = self.session.tuning().request_timeout();
        let request = self.transport.send(Method::Get, path, None);
        let result = match tokio::time::timeout(timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        let response = match result {
            Ok(response) => response,
            Err(error) => {
                self.session.with_state(|state| state.reconciling.remove(&E::KIND));
                let error = SyncError::from(error);
                if let SyncError::Auth { status } = error {
                    self.session
                        .with_state(|state| state.auth_blocked = Some(status));
                    self.events.emit(SyncEvent::AuthRequired { status });
                }
                return Err(error);
            }
        };

        let entities: Vec<E> = endpoint::parse_list(response.body.as_ref());
        let count = entities.len();
        let removed = self.session.with_state(|state| {
            let (store, queue) = E::parts(state);
            let mut present = HashSet::new();
            for entity in entities {
                let key = entity.key().to_string();
                store.reconcile(queue, &key, Some(entity));
                present.insert(key);
            }
            let removed = store.remove_missing(&present);
            state.reconciling.remove(&E::KIND);
            removed.len()
        });

        debug!("Refreshed {}: {} listed, {} removed", E::KIND, count, removed);
        Ok(count)
    }

    fn blocked(&self) -> Option<StopReason> {
        if self.session.auth_required().is_some() {
            Some(StopReason::AuthRequired)
        } else if self.session.connectivity() == Connectivity::Offline {
            Some(StopReason::Offline)
        } else {
            None
        }
    }

    /// Pick the resting state after a pass
    fn settle(&self) {
        let next = if self.session.connectivity() == Connectivity::Offline {
            OrchestratorState::Offline
        } else if self.next_retry_delay().is_some() {
            OrchestratorState::BackingOff
        } else {
            OrchestratorState::Idle
        };
        self.set_state(next);
    }

    fn next_retry_delay(&self) -> Option<Duration> {
        let now = self.session.now_ms();
        self.session
            .with_state(|state| state.queue.next_due(now))
            .map(|due| Duration::from_millis(due.saturating_sub(now)))
    }

    fn set_state(&self, next: OrchestratorState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Orchestrator: {:?} -> {:?}", previous, next);
        }
    }
}

async fn sleep_or_forever(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SyncTuning;
    use crate::device::DeviceId;
    use crate::models::{BookmarkPatch, ShelfStatus};
    use crate::storage::MemoryStorage;
    use crate::sync::SyncStatus;
    use crate::testing::FakeServer;
    use serde_json::json;

    const DEVICE: &str = "device-a";

    struct Harness {
        storage: Arc<MemoryStorage>,
        clock: Arc<ManualClock>,
        server: Arc<FakeServer>,
        session: Arc<SyncSession>,
        orchestrator: Arc<Orchestrator>,
    }

    impl Harness {
        fn new() -> Self {
            let storage = Arc::new(MemoryStorage::new());
            let server = Arc::new(FakeServer::new());
            Self::with(storage, server)
        }

        fn with(storage: Arc<MemoryStorage>, server: Arc<FakeServer>) -> Self {
            let clock = Arc::new(ManualClock::new(1_700_000_000_000));
            let tuning = SyncTuning {
                max_attempts: 3,
                retry_jitter: 0.0,
                ..SyncTuning::default()
            };
            let session = Arc::new(
                SyncSession::open(
                    storage.clone(),
                    DeviceId::new(DEVICE),
                    clock.clone(),
                    tuning,
                )
                .unwrap(),
            );
            session.set_connectivity(Connectivity::Online);
            let orchestrator = Arc::new(Orchestrator::new(session.clone(), server.clone()));
            Self {
                storage,
                clock,
                server,
                session,
                orchestrator,
            }
        }

        async fn drain(&self) -> DrainReport {
            self.orchestrator.drain(&CancellationToken::new()).await
        }
    }

    #[tokio::test]
    async fn test_drain_acks_and_confirms() {
        let h = Harness::new();
        h.session.update_position("b1", "c1", 10, 0.3);
        h.session.add_to_shelf("b1", ShelfStatus::Reading);

        let report = h.drain().await;
        assert_eq!(report.acked, 2);
        assert!(report.stopped.is_none());
        assert!(h.session.pending().is_empty());
        assert_eq!(h.session.status(), SyncStatus::Idle);
        assert_eq!(h.orchestrator.state(), OrchestratorState::Idle);

        let confirmed = h
            .session
            .with_state(|s| s.progress.get_confirmed("b1"))
            .unwrap();
        assert_eq!(confirmed.percentage, 0.3);
        assert!(h.server.entity(EntityKind::Bookshelf, "b1").is_some());
    }

    #[tokio::test]
    async fn test_per_key_order_is_preserved() {
        let h = Harness::new();
        for i in 1..=3 {
            h.session.update_position("b1", "c1", i, i as f32 / 10.0);
            h.session.update_position("b2", "c1", i, i as f32 / 10.0);
        }

        h.drain().await;
        let offsets: Vec<u64> = h
            .server
            .mutation_bodies()
            .iter()
            .filter(|body| body["data"]["bookId"] == "b1")
            .filter_map(|body| body["data"]["offset"].as_u64())
            .collect();
        assert_eq!(offsets, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_transient_failure_blocks_rest_of_key() {
        let h = Harness::new();
        let first = h.session.update_position("b1", "c1", 1, 0.1);
        h.session.update_position("b1", "c1", 2, 0.2);
        h.session.update_position("b2", "c1", 1, 0.1);
        h.server.fail_next(TransportError::http(503));

        let report = h.drain().await;
        assert_eq!(report.retried, 1);
        assert_eq!(report.acked, 1);
        assert_eq!(h.orchestrator.state(), OrchestratorState::BackingOff);

        let pending = h.session.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first);
        assert_eq!(pending[0].attempts, 1);

        // Once the backoff deadline passes, both go out in order
        h.clock.advance(60_000);
        let report = h.drain().await;
        assert_eq!(report.acked, 2);
        assert!(h.session.pending().is_empty());
    }

    #[tokio::test]
    async fn test_network_error_stops_pass() {
        let h = Harness::new();
        h.session.update_position("b1", "c1", 1, 0.1);
        h.session.update_position("b2", "c1", 1, 0.1);
        h.server.set_online(false);

        let report = h.drain().await;
        assert_eq!(report.sent, 1);
        assert_eq!(report.stopped, Some(StopReason::Unreachable));
        assert_eq!(h.session.pending().len(), 2);
    }

    #[tokio::test]
    async fn test_retry_budget_parks_and_sets_error() {
        let h = Harness::new();
        let id = h.session.record_reading("b1", "c1");
        let mut events = h.session.take_events().unwrap();

        for _ in 0..3 {
            h.server.fail_next(TransportError::http(500));
            h.drain().await;
            h.clock.advance(600_000);
        }

        assert_eq!(h.session.parked().len(), 1);
        assert_eq!(h.session.status(), SyncStatus::Error);
        let exhausted = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, SyncEvent::RetryExhausted { mutation_id, .. } if *mutation_id == id))
            .count();
        assert_eq!(exhausted, 1);

        assert_eq!(h.session.retry_parked(), 1);
        let report = h.drain().await;
        assert_eq!(report.acked, 1);
        assert_eq!(h.session.status(), SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_parked_head_holds_later_edits_of_its_key() {
        let h = Harness::new();
        h.session.update_position("b1", "c1", 50, 0.5);
        for _ in 0..3 {
            h.server.fail_next(TransportError::http(500));
            h.drain().await;
            h.clock.advance(600_000);
        }
        assert_eq!(h.session.parked().len(), 1);

        // A later edit waits behind the parked one
        h.session.update_position("b1", "c1", 60, 0.6);
        let report = h.drain().await;
        assert_eq!(report.sent, 0);
        assert_eq!(h.session.status(), SyncStatus::Error);

        assert_eq!(h.session.retry_parked(), 1);
        let report = h.drain().await;
        assert_eq!(report.acked, 2);

        let offsets: Vec<u64> = h
            .server
            .mutation_bodies()
            .iter()
            .filter_map(|body| body["data"]["offset"].as_u64())
            .collect();
        assert_eq!(offsets, vec![50, 50, 50, 50, 60]);
        assert_eq!(
            h.server.entity(EntityKind::Progress, "b1").unwrap()["offset"],
            60
        );
        assert_eq!(h.session.position("b1").unwrap().offset, 60);
        assert_eq!(h.session.status(), SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_dropped_with_conflict() {
        let h = Harness::new();
        let id = h.session.add_to_shelf("b1", ShelfStatus::Reading);
        let mut events = h.session.take_events().unwrap();
        h.server.fail_next(TransportError::Http {
            status: 422,
            body: Some(json!({"message": "unknown book"})),
        });

        let report = h.drain().await;
        assert_eq!(report.rejected, 1);
        assert!(h.session.pending().is_empty());
        assert!(h.session.shelf_entry("b1").is_none());

        let conflict = std::iter::from_fn(|| events.try_recv().ok())
            .find(|e| matches!(e, SyncEvent::SyncConflict { .. }))
            .unwrap();
        assert_eq!(
            conflict,
            SyncEvent::SyncConflict {
                kind: EntityKind::Bookshelf,
                key: "b1".to_string(),
                mutation_id: id,
                status: Some(422),
                message: "unknown book".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_auth_failure_stops_until_resumed() {
        let h = Harness::new();
        h.session.update_position("b1", "c1", 1, 0.1);
        h.server.fail_next(TransportError::http(401));

        let report = h.drain().await;
        assert_eq!(report.stopped, Some(StopReason::AuthRequired));
        assert_eq!(h.session.auth_required(), Some(401));
        assert_eq!(h.session.pending()[0].attempts, 0);

        let report = h.drain().await;
        assert_eq!(report.sent, 0);

        h.session.resume_after_auth();
        let report = h.drain().await;
        assert_eq!(report.acked, 1);
    }

    #[tokio::test]
    async fn test_delete_404_is_success() {
        let h = Harness::new();
        h.session.with_state(|s| {
            let entry = BookshelfEntry {
                book_id: "b1".to_string(),
                status: ShelfStatus::Reading,
                added_at: crate::models::datetime_from_ms(0),
                updated_at: crate::models::datetime_from_ms(0),
            };
            s.shelf.reconcile(&mut s.queue, "b1", Some(entry));
        });

        // Removed on the server by another device already
        h.session.remove_from_shelf("b1");
        let report = h.drain().await;
        assert_eq!(report.acked, 1);
        assert!(h.session.pending().is_empty());
        assert!(h.session.shelf_entry("b1").is_none());
    }

    #[tokio::test]
    async fn test_bookmark_temporary_id_is_remapped() {
        let h = Harness::new();
        let temp = h
            .session
            .add_bookmark("b1", "c1", 40, None, Some("quote".to_string()));
        h.session.edit_bookmark(
            &temp,
            BookmarkPatch {
                note: Some("look again".to_string()),
                ..Default::default()
            },
        );
        let mut events = h.session.take_events().unwrap();

        let report = h.drain().await;
        assert_eq!(report.acked, 2);

        let bookmarks = h.session.bookmarks_for("b1");
        assert_eq!(bookmarks.len(), 1);
        let bookmark = &bookmarks[0];
        assert_eq!(bookmark.id, "bm-1");
        assert_eq!(bookmark.note.as_deref(), Some("look again"));

        // The edit went to the server id
        assert!(h
            .server
            .requests()
            .iter()
            .any(|r| r.method == Method::Put && r.path == "/bookmarks/bm-1"));
        assert!(std::iter::from_fn(|| events.try_recv().ok()).any(|e| matches!(
            e,
            SyncEvent::IdRemapped { ref new, .. } if new == "bm-1"
        )));
    }

    #[tokio::test]
    async fn test_crash_durability_resends_once() {
        let storage = Arc::new(MemoryStorage::new());
        let server = Arc::new(FakeServer::new());
        let ids: Vec<_>;
        {
            let h = Harness::with(storage.clone(), server.clone());
            ids = vec![
                h.session.update_position("b1", "c1", 1, 0.1),
                h.session.add_to_shelf("b2", ShelfStatus::WantToRead),
                h.session.record_reading("b1", "c1"),
            ];
            // The first send reaches the server but the process dies before the ack
            h.server.apply_then_fail_next(TransportError::Network("connection reset".into()));
            h.drain().await;
        }

        let h = Harness::with(storage, server);
        assert_eq!(h.session.pending().len(), 3);
        h.clock.advance(60_000);
        let report = h.drain().await;
        assert_eq!(report.acked, 3);

        // Every mutation applied exactly once despite the duplicate delivery
        let mut applied = h.server.applied();
        applied.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(applied, expected);

        let (_, queued) = crate::storage::Journal::open::<MutationRecord>(
            h.storage.clone(),
            crate::queue::QUEUE_NAMESPACE,
        )
        .unwrap();
        assert!(queued.is_empty());
    }

    #[tokio::test]
    async fn test_offline_buffering_then_drain() {
        let h = Harness::new();
        h.session.set_connectivity(Connectivity::Offline);

        for i in 0..5 {
            h.session.update_position("b1", "c1", i, i as f32 / 10.0);
            h.session.record_reading("b2", &format!("c{}", i));
        }
        assert_eq!(h.session.pending().len(), 10);
        assert_eq!(h.session.status(), SyncStatus::Offline);

        let report = h.drain().await;
        assert_eq!(report.stopped, Some(StopReason::Offline));
        assert!(h.server.mutation_bodies().is_empty());

        h.session.set_connectivity(Connectivity::Online);
        let report = h.drain().await;
        assert_eq!(report.acked, 10);
        assert_eq!(h.session.status(), SyncStatus::Idle);

        let bodies = h.server.mutation_bodies();
        let b1: Vec<u64> = bodies
            .iter()
            .filter(|b| b["data"]["bookId"] == "b1" && b["data"]["offset"].is_u64())
            .filter_map(|b| b["data"]["offset"].as_u64())
            .collect();
        assert_eq!(b1, vec![0, 1, 2, 3, 4]);
        let b2: Vec<String> = bodies
            .iter()
            .filter(|b| b["data"]["bookId"] == "b2")
            .filter_map(|b| b["data"]["chapterId"].as_str().map(str::to_string))
            .collect();
        assert_eq!(b2, vec!["c0", "c1", "c2", "c3", "c4"]);
    }

    #[tokio::test]
    async fn test_refresh_reports_lost_update_once() {
        let h = Harness::new();
        h.session.add_to_shelf("b1", ShelfStatus::WantToRead);
        h.session.set_connectivity(Connectivity::Offline);
        h.session.set_shelf_status("b1", ShelfStatus::Reading);
        let mut events = h.session.take_events().unwrap();

        // Another device's later edit is already on the server
        h.server.put_entity(
            EntityKind::Bookshelf,
            "b1",
            json!({
                "bookId": "b1",
                "status": "completed",
                "addedAt": "2023-11-14T00:00:00Z",
                "updatedAt": "2030-01-01T00:00:00Z"
            }),
        );

        h.orchestrator.refresh(EntityKind::Bookshelf).await.unwrap();
        assert_eq!(
            h.session.shelf_entry("b1").unwrap().status,
            ShelfStatus::Completed
        );
        assert!(h.session.pending().is_empty());

        let lost = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, SyncEvent::LostUpdate { .. }))
            .count();
        assert_eq!(lost, 1);
    }

    #[tokio::test]
    async fn test_newer_remote_bookmark_edit_supersedes_local_edit() {
        let h = Harness::new();
        h.session.add_bookmark("b1", "c1", 40, None, None);
        h.drain().await;
        assert!(h.session.bookmark("bm-1").is_some());

        h.session.set_connectivity(Connectivity::Offline);
        let edit = h
            .session
            .edit_bookmark(
                "bm-1",
                BookmarkPatch {
                    note: Some("mine".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        let mut events = h.session.take_events().unwrap();

        h.server.put_entity(
            EntityKind::Bookmark,
            "bm-1",
            json!({
                "id": "bm-1",
                "bookId": "b1",
                "chapterId": "c1",
                "position": 40,
                "note": "theirs",
                "createdAt": "2023-11-14T00:00:00Z",
                "updatedAt": "2030-01-01T00:00:00Z"
            }),
        );

        h.orchestrator.refresh(EntityKind::Bookmark).await.unwrap();
        let bookmark = h.session.bookmark("bm-1").unwrap();
        assert_eq!(bookmark.note.as_deref(), Some("theirs"));
        assert!(h.session.pending().is_empty());

        let lost: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, SyncEvent::LostUpdate { .. }))
            .collect();
        assert_eq!(
            lost,
            vec![SyncEvent::LostUpdate {
                kind: EntityKind::Bookmark,
                key: "bm-1".to_string(),
                dropped: vec![edit],
            }]
        );
    }

    #[tokio::test]
    async fn test_refresh_keeps_furthest_progress() {
        let h = Harness::new();
        let now = h.session.now_ms();
        h.session.set_connectivity(Connectivity::Offline);
        h.session.update_position("b1", "c4", 0, 0.40);

        h.server.put_entity(
            EntityKind::Progress,
            "b1",
            json!({
                "bookId": "b1",
                "chapterId": "c2",
                "offset": 0,
                "percentage": 0.25,
                "updatedAt": crate::models::datetime_from_ms(now + 500),
                "sourceDeviceId": "device-b"
            }),
        );

        h.orchestrator.refresh(EntityKind::Progress).await.unwrap();
        assert_eq!(h.session.position("b1").unwrap().percentage, 0.40);

        h.session.set_connectivity(Connectivity::Online);
        h.drain().await;
        let stored = h.server.entity(EntityKind::Progress, "b1").unwrap();
        assert_eq!(stored["percentage"].as_f64().map(|p| (p * 100.0).round()), Some(40.0));
    }

    #[tokio::test]
    async fn test_refresh_removes_entities_gone_from_server() {
        let h = Harness::new();
        h.session.record_reading("b1", "c1");
        h.drain().await;
        assert_eq!(h.session.history().len(), 1);

        h.server.remove_entity(EntityKind::History, "b1");
        h.orchestrator.refresh_all().await.unwrap();
        assert!(h.session.history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_drains_on_reconnect() {
        let h = Harness::new();
        h.session.set_connectivity(Connectivity::Offline);
        h.session.update_position("b1", "c1", 1, 0.1);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.orchestrator.clone().run(cancel.clone()));
        tokio::task::yield_now().await;

        let mut status = h.session.subscribe_status();
        h.session.set_connectivity(Connectivity::Online);
        while *status.borrow_and_update() != SyncStatus::Idle {
            status.changed().await.unwrap();
        }
        assert!(h.session.pending().is_empty());

        cancel.cancel();
        task.await.unwrap();
    }
}

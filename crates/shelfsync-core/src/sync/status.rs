//! Sync status machine
//!
//! The status shown to the user is a pure function of connectivity and the
//! queue's pending/parked counts. `StatusMachine` recomputes it on every
//! change and publishes it on a watch channel.

use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use super::connectivity::Connectivity;
use super::{EventSink, SyncEvent};

/// User-facing synchronization status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Everything confirmed
    Idle,
    /// Local changes waiting to be sent
    Syncing,
    Offline,
    /// Some change exhausted its retry budget
    Error,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Idle => f.write_str("idle"),
            SyncStatus::Syncing => f.write_str("syncing"),
            SyncStatus::Offline => f.write_str("offline"),
            SyncStatus::Error => f.write_str("error"),
        }
    }
}

/// Derive the status from its inputs
pub fn derive_status(connectivity: Connectivity, pending: usize, parked: usize) -> SyncStatus {
    if connectivity == Connectivity::Offline {
        SyncStatus::Offline
    } else if pending > 0 {
        SyncStatus::Syncing
    } else if parked > 0 {
        SyncStatus::Error
    } else {
        SyncStatus::Idle
    }
}

/// Publishes the derived status
pub struct StatusMachine {
    tx: watch::Sender<SyncStatus>,
    events: EventSink,
}

impl StatusMachine {
    pub fn new(events: EventSink) -> Self {
        let (tx, _) = watch::channel(SyncStatus::Idle);
        Self { tx, events }
    }

    pub fn current(&self) -> SyncStatus {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    /// Recompute and publish; returns the status
    pub fn update(&self, connectivity: Connectivity, pending: usize, parked: usize) -> SyncStatus {
        let next = derive_status(connectivity, pending, parked);
        let previous = self.tx.send_replace(next);
        if previous != next {
            debug!("Sync status: {} -> {}", previous, next);
            self.events.emit(SyncEvent::StatusChanged(next));
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_precedence() {
        use Connectivity::*;
        assert_eq!(derive_status(Offline, 5, 1), SyncStatus::Offline);
        assert_eq!(derive_status(Online, 5, 1), SyncStatus::Syncing);
        assert_eq!(derive_status(Unknown, 1, 0), SyncStatus::Syncing);
        assert_eq!(derive_status(Online, 0, 1), SyncStatus::Error);
        assert_eq!(derive_status(Online, 0, 0), SyncStatus::Idle);
    }

    #[test]
    fn test_update_publishes_changes_only() {
        let (events, mut rx) = EventSink::channel();
        let machine = StatusMachine::new(events);
        let watcher = machine.subscribe();

        machine.update(Connectivity::Online, 0, 0);
        assert!(rx.try_recv().is_err());

        machine.update(Connectivity::Offline, 2, 0);
        machine.update(Connectivity::Offline, 3, 0);
        assert_eq!(*watcher.borrow(), SyncStatus::Offline);
        assert_eq!(
            rx.try_recv().unwrap(),
            SyncEvent::StatusChanged(SyncStatus::Offline)
        );
        assert!(rx.try_recv().is_err());
    }
}

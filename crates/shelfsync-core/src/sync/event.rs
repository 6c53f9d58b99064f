//! Diagnostic events
//!
//! Informational and error outcomes the UI may want to surface. Nothing in
//! the core blocks on a listener; events are dropped if nobody is listening.

use tokio::sync::mpsc;

use super::connectivity::Connectivity;
use super::status::SyncStatus;
use crate::error::SyncError;
use crate::models::{EntityKind, MutationId};

/// Events emitted by the sync core
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Pending local mutations were superseded by a newer remote value
    LostUpdate {
        kind: EntityKind,
        key: String,
        dropped: Vec<MutationId>,
    },
    /// The server rejected a mutation; it was dropped
    SyncConflict {
        kind: EntityKind,
        key: String,
        mutation_id: MutationId,
        status: Option<u16>,
        message: String,
    },
    /// Durable storage is exhausted; writes continue in memory only
    QueueOverflow { namespace: String, message: String },
    /// Durable storage accepted writes again
    StorageRecovered { namespace: String },
    /// Draining stopped until the session re-authenticates
    AuthRequired { status: u16 },
    /// A mutation failed transiently and will be retried
    RetryScheduled {
        mutation_id: MutationId,
        attempts: u32,
        delay_ms: u64,
    },
    /// A mutation used up its retry budget and was parked
    RetryExhausted {
        mutation_id: MutationId,
        attempts: u32,
    },
    /// A temporary id was replaced by its server id
    IdRemapped {
        old: String,
        new: String,
        rewritten: usize,
    },
    ConnectivityChanged(Connectivity),
    StatusChanged(SyncStatus),
}

impl SyncEvent {
    /// The error this event reports, for events that carry one
    pub fn error(&self) -> Option<SyncError> {
        match self {
            SyncEvent::LostUpdate { kind, key, .. } => Some(SyncError::LostUpdate {
                kind: *kind,
                key: key.clone(),
            }),
            SyncEvent::QueueOverflow { message, .. } => {
                Some(SyncError::QueueOverflow(message.clone()))
            }
            SyncEvent::AuthRequired { status } => Some(SyncError::Auth { status: *status }),
            SyncEvent::SyncConflict {
                status: Some(status),
                message,
                ..
            } => Some(SyncError::PermanentSend {
                status: *status,
                message: message.clone(),
            }),
            _ => None,
        }
    }
}

/// Cheap, clonable emitter shared by every component of a session
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<SyncEvent>>,
}

impl EventSink {
    /// Create a sink and the receiver that observes it
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: SyncEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_reaches_receiver() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(SyncEvent::AuthRequired { status: 401 });
        assert_eq!(rx.try_recv().unwrap(), SyncEvent::AuthRequired { status: 401 });
    }

    #[test]
    fn test_error_of_event() {
        let lost = SyncEvent::LostUpdate {
            kind: EntityKind::Bookmark,
            key: "bm-1".to_string(),
            dropped: vec![MutationId::new_v4()],
        };
        assert_eq!(
            lost.error(),
            Some(SyncError::LostUpdate {
                kind: EntityKind::Bookmark,
                key: "bm-1".to_string()
            })
        );

        let overflow = SyncEvent::QueueOverflow {
            namespace: "mutation_queue".to_string(),
            message: "disk full".to_string(),
        };
        assert_eq!(
            overflow.error().unwrap().to_string(),
            "local storage exhausted: disk full"
        );

        let discarded = SyncEvent::SyncConflict {
            kind: EntityKind::History,
            key: "b1".to_string(),
            mutation_id: MutationId::new_v4(),
            status: None,
            message: "discarded".to_string(),
        };
        assert_eq!(discarded.error(), None);
        assert_eq!(SyncEvent::StatusChanged(SyncStatus::Idle).error(), None);
    }

    #[test]
    fn test_emit_without_listener_is_silent() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(SyncEvent::StatusChanged(SyncStatus::Idle));
        EventSink::disabled().emit(SyncEvent::StatusChanged(SyncStatus::Idle));
    }
}

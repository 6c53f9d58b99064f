//! Sync error taxonomy
//!
//! Every outcome the core reports to its callers is one of these variants.
//! None of them escape as a panic or a failed local mutation: they reach the
//! UI through `SyncEvent`s and the derived sync status.

use thiserror::Error;

use crate::models::EntityKind;
use crate::transport::TransportError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Network failure, timeout or 5xx; retried with backoff
    #[error("transient send failure: {0}")]
    TransientSend(String),

    /// 4xx other than auth; the mutation is dropped
    #[error("mutation rejected by server (HTTP {status}): {message}")]
    PermanentSend { status: u16, message: String },

    /// 401/403; the session layer must re-authenticate
    #[error("authentication required (HTTP {status})")]
    Auth { status: u16 },

    /// Local durable storage is exhausted
    #[error("local storage exhausted: {0}")]
    QueueOverflow(String),

    /// A pending local change was superseded by a newer remote value
    #[error("local change to {kind} '{key}' superseded by a newer remote value")]
    LostUpdate { kind: EntityKind, key: String },
}

impl SyncError {
    /// Whether the mutation that produced this error stays queued
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientSend(_))
    }
}

impl From<TransportError> for SyncError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Network(msg) => SyncError::TransientSend(msg),
            TransportError::Timeout => SyncError::TransientSend("request timed out".to_string()),
            TransportError::Http { status, body } => match status {
                401 | 403 => SyncError::Auth { status },
                408 | 425 | 429 => SyncError::TransientSend(format!("HTTP {}", status)),
                400..=499 => SyncError::PermanentSend {
                    status,
                    message: body
                        .as_ref()
                        .and_then(|b| b.get("message"))
                        .and_then(|m| m.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("HTTP {}", status)),
                },
                _ => SyncError::TransientSend(format!("HTTP {}", status)),
            },
        }
    }
}

//! Transport seam
//!
//! The core never talks HTTP itself. It hands `(method, path, body)` to a
//! `Transport` and classifies what comes back. Request timeouts are the
//! transport's responsibility.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// HTTP method subset used by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => f.write_str("GET"),
            Method::Post => f.write_str("POST"),
            Method::Put => f.write_str("PUT"),
            Method::Delete => f.write_str("DELETE"),
        }
    }
}

/// A successful (2xx) response
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Option<Value>,
}

impl Response {
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            body: Some(body),
        }
    }

    pub fn no_content() -> Self {
        Self {
            status: 204,
            body: None,
        }
    }
}

/// Failures reported by the transport
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Connection refused, DNS failure, reset, ...
    #[error("network error: {0}")]
    Network(String),

    /// The transport gave up waiting for a response
    #[error("request timed out")]
    Timeout,

    /// The server answered with a non-2xx status
    #[error("HTTP {status}")]
    Http { status: u16, body: Option<Value> },
}

impl TransportError {
    pub fn http(status: u16) -> Self {
        TransportError::Http { status, body: None }
    }

    /// HTTP status, if the server answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the failure says nothing about the server being reachable
    pub fn is_connectivity(&self) -> bool {
        matches!(self, TransportError::Network(_) | TransportError::Timeout)
    }
}

/// Request sender used by the orchestrator and the connectivity probe
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Response, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_display() {
        assert_eq!(Method::Delete.to_string(), "DELETE");
    }

    #[test]
    fn test_error_status() {
        assert_eq!(TransportError::http(503).status(), Some(503));
        assert_eq!(TransportError::Timeout.status(), None);
        assert!(TransportError::Timeout.is_connectivity());
        assert!(!TransportError::http(500).is_connectivity());
    }
}

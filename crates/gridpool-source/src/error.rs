//! Backend error types.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// A failed backend call. Always transient from the source's point of
/// view: it is logged and retried, never surfaced to the pool owner.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no node available: {0}")]
    Unavailable(String),

    #[error("connection failed: {0}")]
    Connect(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(String),

    #[error("unexpected status {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("invalid reply: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("unknown node: {0}")]
    UnknownNode(String),
}

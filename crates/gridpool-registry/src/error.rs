//! Registry error types.

use gridpool_core::NodeState;
use thiserror::Error;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("node already registered: {0}")]
    Duplicate(String),

    #[error("node not found: {0}")]
    NotFound(String),

    /// A transition the node lifecycle does not allow. Always a bug in
    /// the caller, never a runtime condition.
    #[error("registry invariant violated: {url} cannot move from {from} to {to}")]
    InvariantViolation {
        url: String,
        from: NodeState,
        to: NodeState,
    },
}

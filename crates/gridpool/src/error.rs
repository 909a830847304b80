//! Pool error types.

use thiserror::Error;

use gridpool_core::{ConfigError, CriteriaError};
use gridpool_registry::RegistryError;

/// Errors surfaced by [`ResourcePool`](crate::ResourcePool).
///
/// Backend and liveness failures never show up here: they are handled
/// inside the pool and only logged.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A request that can never be served. Nothing was changed.
    #[error("configuration error: {0}")]
    Configuration(#[from] CriteriaError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("node source already exists: {0}")]
    DuplicateSource(String),

    #[error("unknown node source: {0}")]
    UnknownSource(String),

    #[error("resource pool is shutting down")]
    ShuttingDown,

    /// Illegal node state transition. A bug, not a runtime condition.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

pub type PoolResult<T> = Result<T, PoolError>;

//! Error types for request validation and configuration loading.

use thiserror::Error;

/// Result type alias for criteria validation.
pub type CriteriaResult<T> = Result<T, CriteriaError>;

/// A selection request that can never be served.
#[derive(Debug, Error)]
pub enum CriteriaError {
    #[error("invalid criteria size: {0} (must be at least 1)")]
    InvalidSize(u32),

    #[error("node access token must not be blank")]
    EmptyAccessToken,

    #[error("selection script #{0} is empty")]
    EmptyScript(usize),

    #[error("selection script is not authorized (digest {0})")]
    UnauthorizedScript(String),

    #[error("invalid selection script: {0}")]
    InvalidScript(String),

    #[error("malformed criteria: {0}")]
    Malformed(String),
}

/// Result type alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while reading or validating a pool configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

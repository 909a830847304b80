//! gridpool-core — shared vocabulary of the gridpool resource manager.
//!
//! Nodes and their lifecycle states, selection criteria, node sets,
//! node events, and the `gridpool.toml` configuration model.

pub mod config;
pub mod criteria;
pub mod error;
pub mod types;

pub use config::{BackendConfig, LivenessConfig, NodeSourcePolicy, PoolConfig, SourceConfig};
pub use criteria::{Bindings, Criteria, SelectionScript, Topology};
pub use error::{ConfigError, ConfigResult, CriteriaError, CriteriaResult};
pub use types::*;

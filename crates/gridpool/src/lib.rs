//! gridpool — resource pool facade of the grid resource manager.
//!
//! `ResourcePool` is the single entry point of scheduler clients. It
//! lends nodes matching a [`Criteria`](gridpool_core::Criteria), takes
//! them back, and keeps the pool filled through dynamic node sources
//! while the liveness monitor weeds out nodes that stop answering.
//!
//! # Architecture
//!
//! ```text
//! ResourcePool
//!   ├── NodeRegistry (shared catalogue, node events)
//!   ├── CriteriaMatcher (filter → scripts → topology → size)
//!   ├── LivenessMonitor ──failures──► dispatcher task
//!   │                                    └── owning NodeSource / drop
//!   └── per-source slot
//!       ├── DynamicNodeSource<B> (maintenance loop task)
//!       └── NodeBackend (static list | peers | provisioner)
//! ```

pub mod error;
pub mod pool;

pub use error::{PoolError, PoolResult};
pub use pool::{PoolBuilder, PoolStats, ResourcePool, SourceStats};

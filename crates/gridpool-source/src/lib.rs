//! gridpool-source — node sources and their backends.
//!
//! # Architecture
//!
//! ```text
//! DynamicNodeSource<B: NodeBackend>      (implements NodeSource)
//!   ├── get_node()        bounded retries, lookup_freq apart
//!   ├── release_node()    idempotent, nice-time backoff
//!   ├── detected_pinged_down_node()
//!   ├── shutdown(preempt)
//!   └── run()             TTR expiry + nice-time driven top-up
//!
//! NodeBackend
//!   ├── StaticListBackend    fixed list of urls
//!   ├── PeerBackend          round-robin lend/return over HTTP
//!   └── ProvisionerBackend   cloud provisioning endpoint
//! ```
//!
//! Backend errors are transient by definition: the source logs them and
//! retries later. Nothing a backend does is surfaced to the pool owner.

pub mod backend;
pub mod balancer;
pub mod error;
pub mod source;

pub use backend::{AcquiredNode, NodeBackend, PeerBackend, ProvisionerBackend, StaticListBackend};
pub use error::{BackendError, BackendResult};
pub use source::{DynamicNodeSource, NodeSource};

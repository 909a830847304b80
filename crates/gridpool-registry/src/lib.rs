//! gridpool-registry — the catalogue of known nodes.
//!
//! The registry is the only shared mutable structure of the resource
//! manager. Every state change happens inside its lock and publishes a
//! [`NodeEvent`](gridpool_core::NodeEvent) while the lock is held, so
//! events about one node reach subscribers in the order they happened.
//!
//! Selection takes the write lock through [`NodeRegistry::write`] so
//! that matching and the Free → Busy transition are one critical
//! section.

pub mod error;
pub mod registry;

pub use error::{RegistryError, RegistryResult};
pub use registry::{NodeRegistry, RegistryStats, RegistryWriteGuard};

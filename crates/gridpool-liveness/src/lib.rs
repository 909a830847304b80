//! gridpool-liveness — failure detection for pooled nodes.
//!
//! # Architecture
//!
//! ```text
//! LivenessMonitor
//!   ├── one scan task (tokio::spawn)
//!   │   ├── EndpointSource::endpoints() → Arc<[url]> snapshot per pass
//!   │   ├── HeartbeatProbe::ping() → Alive | Dead | ProbeError
//!   │   └── LivenessRecord per url (consecutive failures)
//!   └── mpsc::UnboundedSender<LivenessFailure> → pool failure dispatcher
//! ```
//!
//! Dead and unreachable endpoints are reported the same way. A forced
//! detection either wakes the paused task or restarts the running pass
//! from a fresh snapshot.

pub mod monitor;
pub mod probe;

pub use monitor::{EndpointSource, FailureKind, LivenessFailure, LivenessMonitor, LivenessRecord, MonitorState};
pub use probe::{Heartbeat, HeartbeatProbe, HttpHeartbeatProbe, ProbeError, ProbeResult};

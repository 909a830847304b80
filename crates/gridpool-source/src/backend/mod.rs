//! Node backends — where a source gets its nodes from.
//!
//! Every backend implements [`NodeBackend`]; the source never looks
//! past that trait.

pub mod http;
pub mod peer;
pub mod provisioner;
pub mod static_list;

use serde::{Deserialize, Serialize};

use gridpool_core::{host_of, BoxFuture, HostId, NodeUrl};

use crate::error::BackendResult;

pub use peer::PeerBackend;
pub use provisioner::ProvisionerBackend;
pub use static_list::StaticListBackend;

/// A node handed over by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquiredNode {
    pub url: NodeUrl,
    /// Host the node runs on; derived from the url when absent.
    #[serde(default)]
    pub host: Option<HostId>,
}

impl AcquiredNode {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            host: None,
        }
    }

    pub fn on_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn host_id(&self) -> HostId {
        self.host.clone().unwrap_or_else(|| host_of(&self.url))
    }
}

/// Capability interface of one kind of infrastructure.
pub trait NodeBackend: Send + Sync + 'static {
    /// Short name for logs (`static`, `peer`, ...).
    fn kind(&self) -> &'static str;

    /// Try once to obtain a node.
    fn acquire(&self) -> BoxFuture<'_, BackendResult<AcquiredNode>>;

    /// Give a node back. May kill its remote runtime.
    fn relinquish<'a>(&'a self, url: &'a str) -> BoxFuture<'a, BackendResult<()>>;

    /// Drop any trace of a node that died. Nothing is given back.
    fn forget<'a>(&'a self, url: &'a str) -> BoxFuture<'a, ()>;
}

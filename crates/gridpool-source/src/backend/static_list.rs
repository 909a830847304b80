//! A fixed list of nodes, lent out one at a time.

use std::collections::HashSet;

use tokio::sync::Mutex;
use tracing::debug;

use gridpool_core::config::StaticNodeConfig;
use gridpool_core::{BoxFuture, NodeUrl};

use super::{AcquiredNode, NodeBackend};
use crate::error::{BackendError, BackendResult};

pub struct StaticListBackend {
    nodes: Vec<AcquiredNode>,
    lent: Mutex<HashSet<NodeUrl>>,
}

impl StaticListBackend {
    pub fn new(nodes: Vec<AcquiredNode>) -> Self {
        Self {
            nodes,
            lent: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_config(nodes: &[StaticNodeConfig]) -> Self {
        Self::new(
            nodes
                .iter()
                .map(|n| AcquiredNode {
                    url: n.url.clone(),
                    host: n.host.clone(),
                })
                .collect(),
        )
    }

    pub async fn lent_count(&self) -> usize {
        self.lent.lock().await.len()
    }
}

impl NodeBackend for StaticListBackend {
    fn kind(&self) -> &'static str {
        "static"
    }

    fn acquire(&self) -> BoxFuture<'_, BackendResult<AcquiredNode>> {
        Box::pin(async move {
            let mut lent = self.lent.lock().await;
            let node = self
                .nodes
                .iter()
                .find(|n| !lent.contains(&n.url))
                .ok_or_else(|| BackendError::Unavailable("every listed node is in use".into()))?;
            lent.insert(node.url.clone());
            Ok(node.clone())
        })
    }

    fn relinquish<'a>(&'a self, url: &'a str) -> BoxFuture<'a, BackendResult<()>> {
        Box::pin(async move {
            if !self.lent.lock().await.remove(url) {
                return Err(BackendError::UnknownNode(url.to_string()));
            }
            Ok(())
        })
    }

    fn forget<'a>(&'a self, url: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            // A dead listed node may come back; it becomes lendable again.
            if self.lent.lock().await.remove(url) {
                debug!(%url, "static node forgotten");
            }
        })
    }
}

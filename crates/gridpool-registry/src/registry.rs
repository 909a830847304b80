//! NodeRegistry — in-memory catalogue of nodes keyed by url.
//!
//! `NodeRegistry` is `Clone` + `Send` + `Sync` (backed by
//! `Arc<RwLock<..>>`) and is shared by the pool facade, every node
//! source, and the liveness monitor's endpoint view.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, RwLock, RwLockWriteGuard};
use tracing::{debug, error};

use gridpool_core::{epoch_millis, Node, NodeEvent, NodeEventKind, NodeState, NodeUrl};

use crate::error::{RegistryError, RegistryResult};

#[derive(Debug, Default)]
struct Inner {
    nodes: BTreeMap<NodeUrl, Node>,
    /// Nodes excluded from selection regardless of criteria.
    locked: BTreeSet<NodeUrl>,
}

/// Shared node catalogue.
#[derive(Clone)]
pub struct NodeRegistry {
    inner: Arc<RwLock<Inner>>,
    events: broadcast::Sender<NodeEvent>,
}

/// Per-state node counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub acquiring: usize,
    pub free: usize,
    pub busy: usize,
    pub to_release: usize,
    pub down: usize,
    pub locked: usize,
    /// Node count per source id.
    pub by_source: BTreeMap<String, usize>,
}

impl NodeRegistry {
    /// Create an empty registry whose event channel buffers `event_capacity`
    /// events per subscriber.
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            events,
        }
    }

    /// Subscribe to node events. Slow subscribers lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Insert a node in whatever state it carries (normally `Acquiring`).
    ///
    /// Duplicate urls are rejected.
    pub async fn register(&self, node: Node) -> RegistryResult<()> {
        let mut inner = self.inner.write().await;
        insert(&mut inner, &self.events, node)
    }

    /// Insert a node and make it `Free` in the same critical section.
    pub async fn register_free(&self, node: Node) -> RegistryResult<()> {
        let mut inner = self.inner.write().await;
        let url = node.url.clone();
        insert(&mut inner, &self.events, node)?;
        transition(&mut inner, &self.events, &url, NodeState::Free).map(|_| ())
    }

    /// Move a node to `next`, returning its previous state.
    pub async fn transition(&self, url: &str, next: NodeState) -> RegistryResult<NodeState> {
        let mut inner = self.inner.write().await;
        transition(&mut inner, &self.events, url, next)
    }

    /// Mark a node `Released` and drop it from the catalogue.
    ///
    /// Returns the removed node, or `None` if it was unknown.
    pub async fn remove(&self, url: &str) -> Option<Node> {
        let mut inner = self.inner.write().await;
        remove(&mut inner, &self.events, url)
    }

    pub async fn get(&self, url: &str) -> Option<Node> {
        self.inner.read().await.nodes.get(url).cloned()
    }

    pub async fn contains(&self, url: &str) -> bool {
        self.inner.read().await.nodes.contains_key(url)
    }

    /// Copy of every node, ordered by url.
    pub async fn snapshot(&self) -> Vec<Node> {
        self.inner.read().await.nodes.values().cloned().collect()
    }

    /// Urls of nodes that should currently answer heartbeats.
    pub async fn monitored_urls(&self) -> Vec<NodeUrl> {
        self.inner
            .read()
            .await
            .nodes
            .values()
            .filter(|n| n.state.is_monitored())
            .map(|n| n.url.clone())
            .collect()
    }

    /// Urls of the nodes owned by one source.
    pub async fn urls_of_source(&self, source_id: &str) -> Vec<NodeUrl> {
        self.inner
            .read()
            .await
            .nodes
            .values()
            .filter(|n| n.source_id == source_id)
            .map(|n| n.url.clone())
            .collect()
    }

    /// Exclude nodes from selection. Unknown urls are ignored.
    /// Returns how many nodes became locked.
    pub async fn lock_nodes<I, S>(&self, urls: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut inner = self.inner.write().await;
        let mut count = 0;
        for url in urls {
            let url = url.as_ref();
            if inner.nodes.contains_key(url) && inner.locked.insert(url.to_string()) {
                debug!(%url, "node locked");
                count += 1;
            }
        }
        count
    }

    /// Make locked nodes selectable again. Returns how many were unlocked.
    pub async fn unlock_nodes<I, S>(&self, urls: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut inner = self.inner.write().await;
        let mut count = 0;
        for url in urls {
            let url = url.as_ref();
            if inner.locked.remove(url) {
                debug!(%url, "node unlocked");
                count += 1;
            }
        }
        count
    }

    pub async fn is_locked(&self, url: &str) -> bool {
        self.inner.read().await.locked.contains(url)
    }

    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.read().await;
        let mut stats = RegistryStats {
            total: inner.nodes.len(),
            locked: inner.locked.len(),
            ..RegistryStats::default()
        };
        for node in inner.nodes.values() {
            match node.state {
                NodeState::Acquiring => stats.acquiring += 1,
                NodeState::Free => stats.free += 1,
                NodeState::Busy => stats.busy += 1,
                NodeState::ToRelease => stats.to_release += 1,
                NodeState::Down => stats.down += 1,
                NodeState::Released => {}
            }
            *stats.by_source.entry(node.source_id.clone()).or_insert(0) += 1;
        }
        stats
    }

    /// Take the registry write lock for a multi-step critical section.
    pub async fn write(&self) -> RegistryWriteGuard<'_> {
        RegistryWriteGuard {
            inner: self.inner.write().await,
            events: &self.events,
        }
    }
}

/// Exclusive access to the registry. Held for the whole of a selection.
pub struct RegistryWriteGuard<'a> {
    inner: RwLockWriteGuard<'a, Inner>,
    events: &'a broadcast::Sender<NodeEvent>,
}

impl RegistryWriteGuard<'_> {
    /// Every node, ordered by url.
    pub fn nodes(&self) -> Vec<Node> {
        self.inner.nodes.values().cloned().collect()
    }

    pub fn get(&self, url: &str) -> Option<&Node> {
        self.inner.nodes.get(url)
    }

    pub fn locked(&self) -> &BTreeSet<NodeUrl> {
        &self.inner.locked
    }

    pub fn transition(&mut self, url: &str, next: NodeState) -> RegistryResult<NodeState> {
        transition(&mut self.inner, self.events, url, next)
    }

    pub fn remove(&mut self, url: &str) -> Option<Node> {
        remove(&mut self.inner, self.events, url)
    }
}

fn insert(inner: &mut Inner, events: &broadcast::Sender<NodeEvent>, node: Node) -> RegistryResult<()> {
    if inner.nodes.contains_key(&node.url) {
        return Err(RegistryError::Duplicate(node.url));
    }
    debug!(url = %node.url, source = %node.source_id, state = %node.state, "node registered");
    publish(events, &node, NodeEventKind::Added);
    inner.nodes.insert(node.url.clone(), node);
    Ok(())
}

fn transition(
    inner: &mut Inner,
    events: &broadcast::Sender<NodeEvent>,
    url: &str,
    next: NodeState,
) -> RegistryResult<NodeState> {
    let node = inner
        .nodes
        .get_mut(url)
        .ok_or_else(|| RegistryError::NotFound(url.to_string()))?;

    let prev = node.state;
    if prev == next {
        return Ok(prev);
    }
    if !prev.can_transition_to(next) {
        error!(%url, from = %prev, to = %next, "illegal node state transition");
        return Err(RegistryError::InvariantViolation {
            url: url.to_string(),
            from: prev,
            to: next,
        });
    }

    node.state = next;
    node.state_changed_at = epoch_millis();
    debug!(%url, from = %prev, to = %next, "node state changed");

    let kind = match next {
        NodeState::Free => Some(NodeEventKind::Free),
        NodeState::Busy => Some(NodeEventKind::Busy),
        NodeState::ToRelease => Some(NodeEventKind::ToRelease),
        NodeState::Down => Some(NodeEventKind::Down),
        NodeState::Acquiring | NodeState::Released => None,
    };
    if let Some(kind) = kind {
        publish(events, node, kind);
    }
    Ok(prev)
}

fn remove(inner: &mut Inner, events: &broadcast::Sender<NodeEvent>, url: &str) -> Option<Node> {
    let mut node = inner.nodes.remove(url)?;
    inner.locked.remove(url);
    node.state = NodeState::Released;
    node.state_changed_at = epoch_millis();
    debug!(%url, source = %node.source_id, "node removed");
    publish(events, &node, NodeEventKind::Removed);
    Some(node)
}

fn publish(events: &broadcast::Sender<NodeEvent>, node: &Node, kind: NodeEventKind) {
    // No subscriber is not an error: notifications are best-effort.
    let _ = events.send(NodeEvent::new(node, kind));
}

//! Domain types shared by every gridpool crate.
//!
//! A [`Node`] is one allocatable unit of compute capacity, keyed by its
//! url. A [`NodeSet`] is what a selection hands back to the scheduler.
//! [`NodeEvent`]s are the one-way notifications the pool publishes.

use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unique key of a node (its remote url).
pub type NodeUrl = String;

/// Name of the node source that owns a node.
pub type SourceId = String;

/// Identity of the physical host a node runs on.
pub type HostId = String;

/// Source id used for nodes added by hand through the pool facade.
pub const DEFAULT_SOURCE: &str = "default";

/// Boxed future returned by the object-safe async traits of gridpool.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ── Node ──────────────────────────────────────────────────────────

/// Lifecycle state of a node in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Handed over by a backend, not yet registered.
    Acquiring,
    /// Registered and available for selection.
    Free,
    /// Lent to a scheduler client.
    Busy,
    /// Must be released as soon as it is no longer used.
    ToRelease,
    /// Reported dead or unreachable by the liveness monitor.
    Down,
    /// Given back to its backend. Terminal.
    Released,
}

impl NodeState {
    /// Whether the registry may move a node from `self` to `next`.
    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;
        match (self, next) {
            (Acquiring, Free | Down | Released) => true,
            (Free, Busy | ToRelease | Down | Released) => true,
            (Busy, Free | ToRelease | Down | Released) => true,
            (ToRelease, Released | Down) => true,
            (Down, Released) => true,
            _ => false,
        }
    }

    /// States in which the node is still expected to answer heartbeats.
    pub fn is_monitored(self) -> bool {
        matches!(self, NodeState::Free | NodeState::Busy | NodeState::ToRelease)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeState::Acquiring => "acquiring",
            NodeState::Free => "free",
            NodeState::Busy => "busy",
            NodeState::ToRelease => "to_release",
            NodeState::Down => "down",
            NodeState::Released => "released",
        };
        f.write_str(s)
    }
}

/// A node known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub url: NodeUrl,
    pub state: NodeState,
    /// Tokens protecting this node. Empty means unprotected.
    #[serde(default)]
    pub access_tokens: BTreeSet<String>,
    pub source_id: SourceId,
    pub host_id: HostId,
    /// Unix timestamp (millis) when the node entered the registry.
    pub registered_at: u64,
    /// Unix timestamp (millis) of the last state change.
    pub state_changed_at: u64,
}

impl Node {
    /// Create a node in the `Acquiring` state.
    pub fn new(url: impl Into<String>, source_id: impl Into<String>, host_id: impl Into<String>) -> Self {
        let now = epoch_millis();
        Self {
            url: url.into(),
            state: NodeState::Acquiring,
            access_tokens: BTreeSet::new(),
            source_id: source_id.into(),
            host_id: host_id.into(),
            registered_at: now,
            state_changed_at: now,
        }
    }

    /// Create a node whose host is derived from its url.
    pub fn from_url(url: impl Into<String>, source_id: impl Into<String>) -> Self {
        let url = url.into();
        let host = host_of(&url);
        Self::new(url, source_id, host)
    }

    pub fn with_tokens<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.access_tokens.extend(tokens.into_iter().map(Into::into));
        self
    }

    pub fn with_state(mut self, state: NodeState) -> Self {
        self.state = state;
        self
    }

    /// Whether any access token protects this node.
    pub fn is_protected_by_token(&self) -> bool {
        !self.access_tokens.is_empty()
    }

    pub fn has_token(&self, token: &str) -> bool {
        self.access_tokens.contains(token)
    }
}

/// Extract the host part of a node url, falling back to the whole url.
///
/// `pnp://10.0.0.4:1099/worker-3` → `10.0.0.4`.
pub fn host_of(url: &str) -> HostId {
    url.parse::<http::Uri>()
        .ok()
        .and_then(|uri| uri.host().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

// ── NodeSet ───────────────────────────────────────────────────────

/// Result of a selection: the requested nodes plus, for exclusive
/// topologies, the co-located nodes that were claimed along with them.
///
/// `nodes` and `extra_nodes` never share a url.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSet {
    nodes: Vec<Node>,
    #[serde(default)]
    extra_nodes: Vec<Node>,
}

impl NodeSet {
    pub fn new(nodes: Vec<Node>) -> Self {
        let mut set = Self::default();
        for node in nodes {
            set.push(node);
        }
        set
    }

    /// Build a set with extra nodes. Extras already present in `nodes`
    /// (or repeated) are dropped.
    pub fn with_extra_nodes(nodes: Vec<Node>, extra: Vec<Node>) -> Self {
        let mut set = Self::new(nodes);
        for node in extra {
            set.push_extra(node);
        }
        set
    }

    /// Add a node to the main list, removing it from the extras if present.
    pub fn push(&mut self, node: Node) {
        if self.nodes.iter().any(|n| n.url == node.url) {
            return;
        }
        self.extra_nodes.retain(|n| n.url != node.url);
        self.nodes.push(node);
    }

    /// Add an extra node unless it is already part of the set.
    pub fn push_extra(&mut self, node: Node) {
        if self.contains(&node.url) {
            return;
        }
        self.extra_nodes.push(node);
    }

    /// Merge another set into this one, preserving disjointness.
    pub fn extend(&mut self, other: NodeSet) {
        for node in other.nodes {
            self.push(node);
        }
        for node in other.extra_nodes {
            self.push_extra(node);
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Extra nodes, `None` when there are none.
    pub fn extra_nodes(&self) -> Option<&[Node]> {
        if self.extra_nodes.is_empty() {
            None
        } else {
            Some(&self.extra_nodes)
        }
    }

    /// Number of requested nodes (extras excluded).
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.nodes.iter().chain(&self.extra_nodes).any(|n| n.url == url)
    }

    /// Urls of nodes and extra nodes, deduplicated, in insertion order.
    pub fn all_node_urls(&self) -> Vec<NodeUrl> {
        let mut seen = HashSet::new();
        self.nodes
            .iter()
            .chain(&self.extra_nodes)
            .filter(|n| seen.insert(n.url.as_str()))
            .map(|n| n.url.clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.extra_nodes.clear();
    }

    pub fn into_parts(self) -> (Vec<Node>, Vec<Node>) {
        (self.nodes, self.extra_nodes)
    }
}

// ── Events ────────────────────────────────────────────────────────

/// Kind of notification published to the scheduler collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeEventKind {
    Added,
    Free,
    Busy,
    ToRelease,
    /// Liveness failure (the scheduler's `setDownNode`).
    Down,
    Removed,
}

/// One-way, best-effort notification about a single node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub url: NodeUrl,
    pub source_id: SourceId,
    pub kind: NodeEventKind,
    /// Unix timestamp (millis).
    pub at: u64,
}

impl NodeEvent {
    pub fn new(node: &Node, kind: NodeEventKind) -> Self {
        Self {
            url: node.url.clone(),
            source_id: node.source_id.clone(),
            kind,
            at: epoch_millis(),
        }
    }
}

pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

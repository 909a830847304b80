//! Selection request descriptor.
//!
//! A [`Criteria`] says how many nodes a client wants and under which
//! constraints (topology, selection scripts, exclusion and inclusion
//! lists, access token). It is immutable once submitted.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CriteriaError, CriteriaResult};
use crate::types::NodeUrl;

/// Values made available to selection scripts.
pub type Bindings = BTreeMap<String, String>;

/// Placement constraint on the allocated nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Any nodes.
    #[default]
    Arbitrary,
    /// All nodes on one host; other nodes of that host stay available.
    SingleHost,
    /// One entirely free host; its surplus nodes become extra nodes.
    SingleHostExclusive,
    /// As few entirely free hosts as possible, surplus as extra nodes.
    MultipleHostsExclusive,
    /// One node per entirely free host, the rest of each host as extras.
    DifferentHostsExclusive,
}

impl Topology {
    /// Whether the selection depends on host placement at all.
    pub fn is_topology_based(self) -> bool {
        self != Topology::Arbitrary
    }

    /// Whether whole hosts are claimed, producing extra nodes.
    pub fn is_exclusive(self) -> bool {
        matches!(
            self,
            Topology::SingleHostExclusive
                | Topology::MultipleHostsExclusive
                | Topology::DifferentHostsExclusive
        )
    }
}

impl std::fmt::Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Topology::Arbitrary => "arbitrary",
            Topology::SingleHost => "single_host",
            Topology::SingleHostExclusive => "single_host_exclusive",
            Topology::MultipleHostsExclusive => "multiple_hosts_exclusive",
            Topology::DifferentHostsExclusive => "different_hosts_exclusive",
        };
        f.write_str(s)
    }
}

/// A predicate evaluated against each candidate node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionScript {
    pub content: String,
}

impl SelectionScript {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }

    /// Hex sha256 of the trimmed script content.
    pub fn digest(&self) -> String {
        content_digest(&self.content)
    }
}

/// Hex sha256 of trimmed script content, as used by authorization lists.
pub fn content_digest(content: &str) -> String {
    hex::encode(Sha256::digest(content.trim().as_bytes()))
}

/// A request for `size` nodes under constraints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criteria {
    pub size: u32,
    #[serde(default)]
    pub topology: Topology,
    #[serde(default)]
    pub scripts: Vec<SelectionScript>,
    #[serde(default)]
    pub bindings: Bindings,
    /// Urls that must not be selected.
    #[serde(default)]
    pub blacklist: BTreeSet<NodeUrl>,
    /// When set, only these urls may be selected.
    #[serde(default)]
    pub acceptable_urls: Option<BTreeSet<NodeUrl>>,
    /// Accept fewer than `size` nodes instead of nothing.
    #[serde(default)]
    pub best_effort: bool,
    #[serde(default)]
    pub node_access_token: Option<String>,
    /// Identifiers of the computations this request serves; attached to
    /// the selection's log span.
    #[serde(default)]
    pub computation_descriptors: Vec<String>,
}

impl Criteria {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            topology: Topology::Arbitrary,
            scripts: Vec::new(),
            bindings: Bindings::new(),
            blacklist: BTreeSet::new(),
            acceptable_urls: None,
            best_effort: false,
            node_access_token: None,
            computation_descriptors: Vec::new(),
        }
    }

    /// Parse a criteria document. Malformed input (including a negative
    /// or missing size) is a configuration error.
    pub fn from_json(json: &str) -> CriteriaResult<Self> {
        let criteria: Criteria =
            serde_json::from_str(json).map_err(|e| CriteriaError::Malformed(e.to_string()))?;
        criteria.validate()?;
        Ok(criteria)
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_script(mut self, script: SelectionScript) -> Self {
        self.scripts.push(script);
        self
    }

    pub fn with_binding(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.bindings.insert(key.into(), value.into());
        self
    }

    pub fn with_blacklist<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blacklist.extend(urls.into_iter().map(Into::into));
        self
    }

    pub fn with_acceptable_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acceptable_urls = Some(urls.into_iter().map(Into::into).collect());
        self
    }

    pub fn best_effort(mut self, best_effort: bool) -> Self {
        self.best_effort = best_effort;
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.node_access_token = Some(token.into());
        self
    }

    pub fn with_computation_descriptor(mut self, descriptor: impl Into<String>) -> Self {
        self.computation_descriptors.push(descriptor.into());
        self
    }

    /// Reject requests that can never be served.
    pub fn validate(&self) -> CriteriaResult<()> {
        if self.size == 0 {
            return Err(CriteriaError::InvalidSize(self.size));
        }
        if let Some(token) = &self.node_access_token
            && token.trim().is_empty()
        {
            return Err(CriteriaError::EmptyAccessToken);
        }
        if let Some(index) = self.scripts.iter().position(|s| s.content.trim().is_empty()) {
            return Err(CriteriaError::EmptyScript(index));
        }
        Ok(())
    }
}

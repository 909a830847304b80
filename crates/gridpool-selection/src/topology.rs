//! Topology handlers.
//!
//! Each handler receives the candidates that survived filtering and
//! scripting (ordered by url) plus an index of every registry node per
//! host, and picks at most `number` nodes.
//!
//! A host is *fully free* when every node the registry knows on it is a
//! candidate. Exclusive handlers only ever claim fully free hosts and
//! hand back the surplus nodes of a claimed host as extra nodes.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use gridpool_core::{HostId, Node, NodeSet, NodeUrl, Topology};

/// Urls of every registry node, grouped by host.
#[derive(Debug, Clone, Default)]
pub struct HostIndex {
    hosts: BTreeMap<HostId, BTreeSet<NodeUrl>>,
}

impl HostIndex {
    pub fn build<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> Self {
        let mut hosts: BTreeMap<HostId, BTreeSet<NodeUrl>> = BTreeMap::new();
        for node in nodes {
            hosts
                .entry(node.host_id.clone())
                .or_default()
                .insert(node.url.clone());
        }
        Self { hosts }
    }

    pub fn nodes_on(&self, host: &str) -> usize {
        self.hosts.get(host).map_or(0, BTreeSet::len)
    }
}

/// Run the handler for `topology`.
pub fn select(topology: Topology, number: usize, candidates: &[Node], index: &HostIndex) -> NodeSet {
    if number == 0 || candidates.is_empty() {
        return NodeSet::default();
    }
    match topology {
        Topology::Arbitrary => arbitrary(number, candidates),
        Topology::SingleHost => single_host(number, candidates),
        Topology::SingleHostExclusive => single_host_exclusive(number, candidates, index),
        Topology::MultipleHostsExclusive => multiple_hosts_exclusive(number, candidates, index),
        Topology::DifferentHostsExclusive => different_hosts_exclusive(number, candidates, index),
    }
}

pub fn arbitrary(number: usize, candidates: &[Node]) -> NodeSet {
    NodeSet::new(candidates.iter().take(number).cloned().collect())
}

/// Candidates grouped by host, in host-id order.
fn group_by_host(candidates: &[Node]) -> BTreeMap<&str, Vec<&Node>> {
    let mut groups: BTreeMap<&str, Vec<&Node>> = BTreeMap::new();
    for node in candidates {
        groups.entry(node.host_id.as_str()).or_default().push(node);
    }
    groups
}

/// Hosts all of whose nodes are candidates, smallest first.
fn fully_free_hosts<'a>(candidates: &'a [Node], index: &HostIndex) -> Vec<(&'a str, Vec<&'a Node>)> {
    let mut hosts: Vec<(&str, Vec<&Node>)> = group_by_host(candidates)
        .into_iter()
        .filter(|(host, nodes)| index.nodes_on(host) == nodes.len())
        .collect();
    hosts.sort_by(|a, b| a.1.len().cmp(&b.1.len()).then_with(|| a.0.cmp(b.0)));
    hosts
}

fn owned(nodes: &[&Node]) -> Vec<Node> {
    nodes.iter().map(|n| (*n).clone()).collect()
}

/// All nodes on one host. When no host has `number` candidates, retry
/// with one node fewer until something fits.
pub fn single_host(number: usize, candidates: &[Node]) -> NodeSet {
    let groups = group_by_host(candidates);
    for wanted in (1..=number).rev() {
        if let Some(nodes) = groups.values().find(|nodes| nodes.len() >= wanted) {
            return NodeSet::new(owned(&nodes[..wanted]));
        }
    }
    NodeSet::default()
}

/// One fully free host, the smallest one that fits. The rest of the host
/// becomes extra nodes.
pub fn single_host_exclusive(number: usize, candidates: &[Node], index: &HostIndex) -> NodeSet {
    let hosts = fully_free_hosts(candidates, index);
    for wanted in (1..=number).rev() {
        if let Some((_, nodes)) = hosts.iter().find(|(_, nodes)| nodes.len() >= wanted) {
            let (main, extra) = nodes.split_at(wanted);
            return NodeSet::with_extra_nodes(owned(main), owned(extra));
        }
    }
    NodeSet::default()
}

/// As few fully free hosts as possible. Hosts are claimed whole; the
/// surplus of the last host becomes extra nodes.
pub fn multiple_hosts_exclusive(number: usize, candidates: &[Node], index: &HostIndex) -> NodeSet {
    let mut hosts = fully_free_hosts(candidates, index);
    let mut result = NodeSet::default();
    let mut remaining = number;

    while remaining > 0 && !hosts.is_empty() {
        // Largest host that fits entirely, otherwise the largest overall.
        let pick = hosts
            .iter()
            .rposition(|(_, nodes)| nodes.len() <= remaining)
            .unwrap_or(hosts.len() - 1);
        let (_, nodes) = hosts.remove(pick);

        if nodes.len() > remaining {
            let (main, extra) = nodes.split_at(remaining);
            result.extend(NodeSet::with_extra_nodes(owned(main), owned(extra)));
            remaining = 0;
        } else {
            remaining -= nodes.len();
            result.extend(NodeSet::new(owned(&nodes)));
        }
    }
    result
}

/// One node per fully free host; the other nodes of each claimed host
/// become extra nodes.
pub fn different_hosts_exclusive(number: usize, candidates: &[Node], index: &HostIndex) -> NodeSet {
    let mut result = NodeSet::default();
    for (_, nodes) in fully_free_hosts(candidates, index).into_iter().take(number) {
        let (main, extra) = nodes.split_at(1);
        result.extend(NodeSet::with_extra_nodes(owned(main), owned(extra)));
    }
    result
}

/// Nodes per host in a result, for assertions and logging.
pub fn hosts_of(set: &NodeSet) -> HashMap<HostId, usize> {
    let mut counts = HashMap::new();
    for node in set.nodes() {
        *counts.entry(node.host_id.clone()).or_insert(0) += 1;
    }
    counts
}

//! CriteriaMatcher — turns a registry snapshot and a [`Criteria`] into
//! the node set to hand out.
//!
//! The matcher is pure: it never changes node states. The caller runs it
//! while holding the registry write lock and marks the result `Busy`
//! before releasing it.
//!
//! Pipeline:
//!
//! ```text
//!   all nodes ─► Free, unlocked, not blacklisted, acceptable, token rule
//!             ─► selection scripts (all must pass)
//!             ─► topology handler
//!             ─► size policy (strict: all or nothing, best effort: what fits)
//! ```

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use gridpool_core::{Criteria, CriteriaError, CriteriaResult, Node, NodeSet, NodeState, NodeUrl};

use crate::script::{ScriptAuthorizer, ScriptEvaluator};
use crate::topology::{self, HostIndex};

/// Node selection with pluggable script evaluation.
pub struct CriteriaMatcher {
    evaluator: Box<dyn ScriptEvaluator>,
    authorizer: ScriptAuthorizer,
}

/// Counters of one matching pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchReport {
    pub free: usize,
    pub filtered: usize,
    pub scripted: usize,
    pub selected: usize,
    pub extra: usize,
}

impl CriteriaMatcher {
    pub fn new(evaluator: Box<dyn ScriptEvaluator>, authorizer: ScriptAuthorizer) -> Self {
        Self {
            evaluator,
            authorizer,
        }
    }

    pub fn authorizer(&self) -> &ScriptAuthorizer {
        &self.authorizer
    }

    /// Reject a request before the registry is touched.
    pub fn validate(&self, criteria: &Criteria) -> CriteriaResult<()> {
        criteria.validate()?;
        self.authorizer.check(&criteria.scripts)?;
        for script in &criteria.scripts {
            self.evaluator
                .check(script)
                .map_err(|e| CriteriaError::InvalidScript(e.to_string()))?;
        }
        Ok(())
    }

    /// Compute the node set for `criteria` out of `nodes`.
    ///
    /// `nodes` must be every registry node (not only free ones) so that
    /// exclusive topologies can tell fully free hosts apart.
    pub fn select(&self, nodes: &[Node], locked: &BTreeSet<NodeUrl>, criteria: &Criteria) -> (NodeSet, MatchReport) {
        let mut report = MatchReport {
            free: nodes.iter().filter(|n| n.state == NodeState::Free).count(),
            ..MatchReport::default()
        };

        let filtered: Vec<Node> = nodes
            .iter()
            .filter(|n| is_candidate(n, locked, criteria))
            .cloned()
            .collect();
        report.filtered = filtered.len();

        let candidates = self.apply_scripts(filtered, criteria);
        report.scripted = candidates.len();

        let size = criteria.size as usize;
        let index = HostIndex::build(nodes);
        let mut set = topology::select(criteria.topology, size, &candidates, &index);

        if set.len() < size {
            if criteria.best_effort {
                if criteria.topology.is_topology_based() && set.len() < size.min(candidates.len()) {
                    let fallback = topology::arbitrary(size, &candidates);
                    debug!(
                        topology = %criteria.topology,
                        topology_count = set.len(),
                        fallback_count = fallback.len(),
                        "topology unsatisfiable, falling back to arbitrary selection"
                    );
                    set = fallback;
                }
            } else {
                debug!(
                    requested = size,
                    available = set.len(),
                    "strict request cannot be satisfied"
                );
                set.clear();
            }
        }

        report.selected = set.len();
        report.extra = set.extra_nodes().map_or(0, <[Node]>::len);

        info!(
            requested = size,
            topology = %criteria.topology,
            free = report.free,
            filtered = report.filtered,
            scripted = report.scripted,
            selected = report.selected,
            extra = report.extra,
            "selection computed"
        );
        (set, report)
    }

    /// Compile every script once, then keep the candidates all of them
    /// accept. A script that fails to compile accepts nothing.
    fn apply_scripts(&self, candidates: Vec<Node>, criteria: &Criteria) -> Vec<Node> {
        if criteria.scripts.is_empty() {
            return candidates;
        }
        let mut compiled = Vec::with_capacity(criteria.scripts.len());
        for script in &criteria.scripts {
            match self.evaluator.compile(script, &criteria.bindings) {
                Ok(script) => compiled.push(script),
                Err(e) => {
                    warn!(candidates = candidates.len(), error = %e, "selection script failed");
                    return Vec::new();
                }
            }
        }
        candidates
            .into_iter()
            .filter(|node| compiled.iter().all(|script| script.matches(node)))
            .collect()
    }
}

/// Static eligibility of a node, before scripts and topology.
fn is_candidate(node: &Node, locked: &BTreeSet<NodeUrl>, criteria: &Criteria) -> bool {
    if node.state != NodeState::Free || locked.contains(&node.url) || criteria.blacklist.contains(&node.url) {
        return false;
    }
    if let Some(acceptable) = &criteria.acceptable_urls
        && !acceptable.contains(&node.url)
    {
        return false;
    }
    match &criteria.node_access_token {
        Some(token) => node.has_token(token),
        None => !node.is_protected_by_token(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::script::{CompiledScript, ExpressionEvaluator, ScriptResult};
    use gridpool_core::{Bindings, SelectionScript, Topology};

    fn matcher() -> CriteriaMatcher {
        CriteriaMatcher::new(Box::new(ExpressionEvaluator), ScriptAuthorizer::allow_all())
    }

    fn free(host: &str, i: usize) -> Node {
        Node::new(format!("pnp://{host}/n{i}"), "lab", host).with_state(NodeState::Free)
    }

    fn pool(layout: &[(&str, usize)]) -> Vec<Node> {
        layout
            .iter()
            .flat_map(|(host, n)| (0..*n).map(move |i| free(host, i)))
            .collect()
    }

    fn no_locks() -> BTreeSet<NodeUrl> {
        BTreeSet::new()
    }

    #[test]
    fn selects_only_free_nodes() {
        let mut nodes = pool(&[("a", 3)]);
        nodes[0].state = NodeState::Busy;
        nodes[1].state = NodeState::Down;

        let (set, report) = matcher().select(&nodes, &no_locks(), &Criteria::new(1));
        assert_eq!(set.len(), 1);
        assert_eq!(set.nodes()[0].url, "pnp://a/n2");
        assert_eq!(report.free, 1);
    }

    #[test]
    fn strict_request_is_all_or_nothing() {
        let nodes = pool(&[("a", 2)]);
        let (set, report) = matcher().select(&nodes, &no_locks(), &Criteria::new(3));
        assert!(set.is_empty());
        assert!(set.extra_nodes().is_none());
        assert_eq!(report.selected, 0);
    }

    #[test]
    fn best_effort_returns_what_fits() {
        let nodes = pool(&[("a", 2)]);
        let criteria = Criteria::new(3).best_effort(true);
        let (set, _) = matcher().select(&nodes, &no_locks(), &criteria);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn blacklist_and_locks_are_excluded() {
        let nodes = pool(&[("a", 3)]);
        let mut locked = no_locks();
        locked.insert("pnp://a/n1".to_string());
        let criteria = Criteria::new(3).best_effort(true).with_blacklist(["pnp://a/n0"]);

        let (set, _) = matcher().select(&nodes, &locked, &criteria);
        assert_eq!(set.all_node_urls(), vec!["pnp://a/n2"]);
    }

    #[test]
    fn acceptable_urls_restrict_candidates() {
        let nodes = pool(&[("a", 3)]);
        let criteria = Criteria::new(2)
            .best_effort(true)
            .with_acceptable_urls(["pnp://a/n1", "pnp://elsewhere/x"]);
        let (set, _) = matcher().select(&nodes, &no_locks(), &criteria);
        assert_eq!(set.all_node_urls(), vec!["pnp://a/n1"]);
    }

    #[test]
    fn token_protected_nodes_need_the_token() {
        let mut nodes = pool(&[("a", 2)]);
        nodes[0] = nodes[0].clone().with_tokens(["gpu"]);

        let (plain, _) = matcher().select(&nodes, &no_locks(), &Criteria::new(2).best_effort(true));
        assert_eq!(plain.all_node_urls(), vec!["pnp://a/n1"]);

        let with_token = Criteria::new(2).best_effort(true).with_access_token("gpu");
        let (guarded, _) = matcher().select(&nodes, &no_locks(), &with_token);
        assert_eq!(guarded.all_node_urls(), vec!["pnp://a/n0"]);
    }

    #[test]
    fn scripts_filter_candidates() {
        let nodes = pool(&[("a", 2), ("b", 2)]);
        let criteria = Criteria::new(4)
            .best_effort(true)
            .with_script(SelectionScript::new("host == $rack"))
            .with_binding("rack", "b");
        let (set, report) = matcher().select(&nodes, &no_locks(), &criteria);
        assert_eq!(set.len(), 2);
        assert!(set.nodes().iter().all(|n| n.host_id == "b"));
        assert_eq!(report.scripted, 2);
    }

    /// Counts compilations; accepts every node.
    #[derive(Default)]
    struct CountingEvaluator {
        compiled: Arc<AtomicUsize>,
    }

    struct AcceptAll;

    impl CompiledScript for AcceptAll {
        fn matches(&self, _node: &Node) -> bool {
            true
        }
    }

    impl ScriptEvaluator for CountingEvaluator {
        fn compile(&self, _script: &SelectionScript, _bindings: &Bindings) -> ScriptResult<Box<dyn CompiledScript>> {
            self.compiled.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(AcceptAll))
        }
    }

    #[test]
    fn scripts_compile_once_per_request() {
        let evaluator = CountingEvaluator::default();
        let compiled = evaluator.compiled.clone();
        let matcher = CriteriaMatcher::new(Box::new(evaluator), ScriptAuthorizer::allow_all());
        let nodes = pool(&[("a", 4), ("b", 4)]);
        let criteria = Criteria::new(8)
            .with_script(SelectionScript::new("host != c"))
            .with_script(SelectionScript::new("source == lab"));

        let (set, _) = matcher.select(&nodes, &no_locks(), &criteria);
        assert_eq!(set.len(), 8);
        assert_eq!(compiled.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failing_script_disqualifies_node() {
        let nodes = pool(&[("a", 2)]);
        let criteria = Criteria::new(1)
            .best_effort(true)
            .with_script(SelectionScript::new("host == $unbound"));
        let (set, _) = matcher().select(&nodes, &no_locks(), &criteria);
        assert!(set.is_empty());
    }

    #[test]
    fn single_host_never_yields_extras() {
        let nodes = pool(&[("a", 3), ("b", 4)]);
        let criteria = Criteria::new(3).with_topology(Topology::SingleHost);
        let (set, _) = matcher().select(&nodes, &no_locks(), &criteria);
        assert_eq!(set.len(), 3);
        assert!(set.extra_nodes().is_none());
        let host = &set.nodes()[0].host_id;
        assert!(set.nodes().iter().all(|n| &n.host_id == host));
    }

    #[test]
    fn exclusive_extras_are_disjoint_from_nodes() {
        let nodes = pool(&[("a", 4)]);
        let criteria = Criteria::new(2).with_topology(Topology::SingleHostExclusive);
        let (set, _) = matcher().select(&nodes, &no_locks(), &criteria);
        assert_eq!(set.len(), 2);
        let extras = set.extra_nodes().unwrap();
        assert_eq!(extras.len(), 2);
        for extra in extras {
            assert!(!set.nodes().iter().any(|n| n.url == extra.url));
        }
    }

    #[test]
    fn exclusive_ignores_host_with_busy_node() {
        let mut nodes = pool(&[("a", 4), ("b", 2)]);
        nodes[0].state = NodeState::Busy;
        let criteria = Criteria::new(2).with_topology(Topology::SingleHostExclusive);
        let (set, _) = matcher().select(&nodes, &no_locks(), &criteria);
        assert!(set.nodes().iter().all(|n| n.host_id == "b"));
    }

    #[test]
    fn best_effort_degrades_topology_before_count() {
        // no fully free host: every host has a busy node
        let mut nodes = pool(&[("a", 3), ("b", 3)]);
        nodes[0].state = NodeState::Busy;
        nodes[3].state = NodeState::Busy;
        let criteria = Criteria::new(3)
            .with_topology(Topology::SingleHostExclusive)
            .best_effort(true);
        let (set, _) = matcher().select(&nodes, &no_locks(), &criteria);
        assert_eq!(set.len(), 3);
        assert!(set.extra_nodes().is_none());
    }

    #[test]
    fn best_effort_single_host_spills_over_hosts() {
        let nodes = pool(&[("a", 3), ("b", 2)]);
        let criteria = Criteria::new(4).with_topology(Topology::SingleHost).best_effort(true);
        let (set, report) = matcher().select(&nodes, &no_locks(), &criteria);
        assert_eq!(set.len(), 4);
        assert_eq!(report.selected, 4);
        let hosts: BTreeSet<&str> = set.nodes().iter().map(|n| n.host_id.as_str()).collect();
        assert_eq!(hosts, BTreeSet::from(["a", "b"]));
        assert!(set.extra_nodes().is_none());
    }

    #[test]
    fn strict_unsatisfiable_topology_yields_nothing() {
        let mut nodes = pool(&[("a", 3), ("b", 3)]);
        nodes[0].state = NodeState::Busy;
        nodes[3].state = NodeState::Busy;
        let criteria = Criteria::new(3).with_topology(Topology::SingleHostExclusive);
        let (set, _) = matcher().select(&nodes, &no_locks(), &criteria);
        assert!(set.is_empty());
        assert!(set.extra_nodes().is_none());
    }

    #[test]
    fn validate_rejects_unauthorized_and_invalid_scripts() {
        let allowed = SelectionScript::new("host == a");
        let restricted = CriteriaMatcher::new(
            Box::new(ExpressionEvaluator),
            ScriptAuthorizer::from_digests([allowed.digest()]),
        );
        assert!(restricted.validate(&Criteria::new(1).with_script(allowed)).is_ok());
        assert!(matches!(
            restricted.validate(&Criteria::new(1).with_script(SelectionScript::new("host == b"))),
            Err(CriteriaError::UnauthorizedScript(_))
        ));
        assert!(matches!(
            matcher().validate(&Criteria::new(1).with_script(SelectionScript::new("cpu > 2"))),
            Err(CriteriaError::InvalidScript(_))
        ));
        assert!(matches!(
            matcher().validate(&Criteria::new(0)),
            Err(CriteriaError::InvalidSize(0))
        ));
    }
}

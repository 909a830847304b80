//! ResourcePool — the facade scheduler clients talk to.
//!
//! Owns the registry, the criteria matcher, the liveness monitor, and
//! every dynamic node source. Liveness failures are routed to the source
//! owning the node by a dispatcher task; nodes added by hand belong to
//! the pool itself and are simply dropped when they fail.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use gridpool_core::{
    BackendConfig, ConfigError, Criteria, LivenessConfig, Node, NodeEvent, NodeSet, NodeSourcePolicy, NodeState,
    PoolConfig, SourceConfig, DEFAULT_SOURCE,
};
use gridpool_liveness::{HeartbeatProbe, HttpHeartbeatProbe, LivenessFailure, LivenessMonitor, MonitorState};
use gridpool_registry::{NodeRegistry, RegistryStats, RegistryWriteGuard};
use gridpool_selection::{CriteriaMatcher, ExpressionEvaluator, ScriptAuthorizer, ScriptEvaluator};
use gridpool_source::{
    DynamicNodeSource, NodeBackend, NodeSource, PeerBackend, ProvisionerBackend, StaticListBackend,
};

use crate::error::{PoolError, PoolResult};

struct SourceSlot {
    source: Arc<dyn NodeSource>,
    task: JoinHandle<()>,
    /// Shut down, kept until its last node is given back.
    retiring: bool,
}

type Sources = Arc<RwLock<BTreeMap<String, SourceSlot>>>;

/// Snapshot of the pool for operators.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub nodes: RegistryStats,
    pub sources: Vec<SourceStats>,
    pub monitor: MonitorState,
    pub shutting_down: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub name: String,
    pub held: usize,
    pub retiring: bool,
}

/// Builder for a [`ResourcePool`] with a custom script evaluator or
/// heartbeat probe.
pub struct PoolBuilder {
    config: PoolConfig,
    evaluator: Option<Box<dyn ScriptEvaluator>>,
    probe: Option<Arc<dyn HeartbeatProbe>>,
}

impl PoolBuilder {
    pub fn with_evaluator(mut self, evaluator: impl ScriptEvaluator + 'static) -> Self {
        self.evaluator = Some(Box::new(evaluator));
        self
    }

    pub fn with_probe(mut self, probe: impl HeartbeatProbe) -> Self {
        self.probe = Some(Arc::new(probe));
        self
    }

    /// Assemble the pool, start the configured sources and the failure
    /// detector. Must run inside a tokio runtime.
    pub async fn build(self) -> PoolResult<ResourcePool> {
        let config = self.config;
        config.validate()?;
        let authorizer = ScriptAuthorizer::from_config(&config.selection).map_err(ConfigError::Read)?;

        let registry = NodeRegistry::new(config.events.capacity);
        let evaluator = self.evaluator.unwrap_or_else(|| Box::new(ExpressionEvaluator));
        let matcher = CriteriaMatcher::new(evaluator, authorizer);

        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let probe = self.probe.unwrap_or_else(|| Arc::new(HttpHeartbeatProbe));
        let monitor = LivenessMonitor::new(config.liveness.clone(), Arc::new(registry.clone()), probe, failures_tx);

        let sources = Sources::default();
        let dispatcher = tokio::spawn(dispatch_failures(failures_rx, registry.clone(), sources.clone()));

        let pool = ResourcePool {
            registry,
            matcher,
            monitor,
            sources,
            dispatcher,
            shutting_down: AtomicBool::new(false),
        };
        for source in &config.sources {
            pool.add_source(source).await?;
        }
        pool.monitor.start_failure_detector().await;

        info!(
            sources = config.sources.len(),
            restricted_scripts = pool.matcher.authorizer().is_restricted(),
            "resource pool started"
        );
        Ok(pool)
    }
}

/// Explicit context object of the resource manager.
pub struct ResourcePool {
    registry: NodeRegistry,
    matcher: CriteriaMatcher,
    monitor: LivenessMonitor,
    sources: Sources,
    dispatcher: JoinHandle<()>,
    shutting_down: AtomicBool,
}

impl ResourcePool {
    pub fn builder(config: PoolConfig) -> PoolBuilder {
        PoolBuilder {
            config,
            evaluator: None,
            probe: None,
        }
    }

    /// Pool with the built-in script language and HTTP heartbeats.
    pub async fn new(config: PoolConfig) -> PoolResult<Self> {
        Self::builder(config).build().await
    }

    // ── Selection ─────────────────────────────────────────────────

    /// Select nodes matching `criteria` and lend them.
    ///
    /// Malformed criteria fail with [`PoolError::Configuration`] before
    /// anything is touched. Otherwise this never fails: a request that
    /// cannot be served gets an empty set. Matching and the `Busy`
    /// transition of every returned node, extras included, happen under
    /// one registry lock.
    pub async fn get_nodes(&self, criteria: &Criteria) -> PoolResult<NodeSet> {
        self.matcher.validate(criteria)?;

        let span = info_span!(
            "selection",
            descriptors = ?criteria.computation_descriptors,
            size = criteria.size,
            topology = ?criteria.topology,
        );
        self.select_and_lend(criteria).instrument(span).await
    }

    async fn select_and_lend(&self, criteria: &Criteria) -> PoolResult<NodeSet> {
        if self.is_shutting_down() {
            debug!("pool shutting down, nothing to lend");
            return Ok(NodeSet::default());
        }

        let mut guard = self.registry.write().await;
        let candidates = guard.nodes();
        let (selected, _) = self.matcher.select(&candidates, guard.locked(), criteria);
        let (nodes, extra) = selected.into_parts();
        let nodes = lend(&mut guard, nodes)?;
        let extra = lend(&mut guard, extra)?;
        drop(guard);

        Ok(NodeSet::with_extra_nodes(nodes, extra))
    }

    /// Give nodes back after use.
    ///
    /// `Busy` nodes become `Free`; nodes marked `ToRelease` meanwhile are
    /// released for good. Unknown urls and nodes not lent are ignored.
    /// Returns how many nodes were taken back.
    pub async fn release_nodes<I, S>(&self, urls: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut freed = 0;
        let mut released = Vec::new();
        {
            let mut guard = self.registry.write().await;
            for url in urls {
                let url = url.as_ref();
                let Some(node) = guard.get(url) else {
                    debug!(%url, "release of an unknown node");
                    continue;
                };
                let (state, source_id) = (node.state, node.source_id.clone());
                match state {
                    NodeState::Busy => {
                        if guard.transition(url, NodeState::Free).is_ok() {
                            freed += 1;
                        }
                    }
                    NodeState::ToRelease => {
                        guard.remove(url);
                        released.push((url.to_string(), source_id));
                    }
                    state => debug!(%url, %state, "release of a node not lent"),
                }
            }
        }

        let count = freed + released.len();
        for (url, source_id) in &released {
            self.hand_back(url, source_id).await;
        }
        if !released.is_empty() {
            reap_retired(&self.sources).await;
        }
        count
    }

    // ── Nodes ─────────────────────────────────────────────────────

    /// Register a node by hand, `Free` right away.
    ///
    /// The node belongs to the pool under `source_name` (default
    /// `"default"`), which must not name a dynamic source. Duplicates are
    /// rejected.
    pub async fn add_node(&self, url: &str, source_name: Option<&str>) -> bool {
        let source = source_name.unwrap_or(DEFAULT_SOURCE);
        if self.is_shutting_down() {
            warn!(%url, "pool shutting down, node not added");
            return false;
        }
        if self.sources.read().await.contains_key(source) {
            warn!(%url, %source, "nodes of a dynamic source are acquired by the source itself");
            return false;
        }

        match self.registry.register_free(Node::from_url(url, source)).await {
            Ok(()) => {
                info!(%url, %source, "node added");
                true
            }
            Err(e) => {
                warn!(%url, error = %e, "node not added");
                false
            }
        }
    }

    /// Remove a node. Without `preempt` a lent node keeps serving and is
    /// removed once returned. `false` for an unknown url.
    pub async fn remove_node(&self, url: &str, preempt: bool) -> bool {
        let source_id = {
            let mut guard = self.registry.write().await;
            let Some(node) = guard.get(url) else {
                return false;
            };
            let (state, source_id) = (node.state, node.source_id.clone());
            match state {
                NodeState::Busy if !preempt => {
                    let _ = guard.transition(url, NodeState::ToRelease);
                    info!(%url, "node will be removed once returned");
                    return true;
                }
                NodeState::ToRelease if !preempt => return true,
                _ => {
                    guard.remove(url);
                }
            }
            source_id
        };

        self.hand_back(url, &source_id).await;
        reap_retired(&self.sources).await;
        true
    }

    /// Exclude nodes from selection. Returns how many became locked.
    pub async fn lock_nodes<I, S>(&self, urls: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.registry.lock_nodes(urls).await
    }

    pub async fn unlock_nodes<I, S>(&self, urls: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.registry.unlock_nodes(urls).await
    }

    /// Tell the owning source that a node left the registry for good.
    /// Nodes added by hand need nothing more.
    async fn hand_back(&self, url: &str, source_id: &str) {
        match owner(&self.sources, source_id).await {
            Some(source) => source.release_node(url).await,
            None => info!(%url, source = %source_id, "node removed"),
        }
    }

    // ── Sources ───────────────────────────────────────────────────

    /// Add a dynamic node source and start its maintenance loop.
    pub async fn add_node_source<B: NodeBackend>(
        &self,
        name: &str,
        backend: B,
        policy: NodeSourcePolicy,
    ) -> PoolResult<()> {
        policy.validate()?;
        if self.is_shutting_down() {
            return Err(PoolError::ShuttingDown);
        }
        // Names of hand-added nodes are taken as well.
        if name == DEFAULT_SOURCE || !self.registry.urls_of_source(name).await.is_empty() {
            return Err(PoolError::DuplicateSource(name.to_string()));
        }

        let mut sources = self.sources.write().await;
        if sources.contains_key(name) {
            return Err(PoolError::DuplicateSource(name.to_string()));
        }

        let kind = backend.kind();
        let max = policy.max_nodes;
        let source = Arc::new(DynamicNodeSource::new(name, policy, backend, self.registry.clone()));
        let task = tokio::spawn(source.clone().run());
        sources.insert(
            name.to_string(),
            SourceSlot {
                source,
                task,
                retiring: false,
            },
        );

        info!(source = %name, backend = kind, max, "node source added");
        Ok(())
    }

    /// Add a node source described by configuration.
    pub async fn add_source(&self, config: &SourceConfig) -> PoolResult<()> {
        let name = config.name.as_str();
        let policy = config.policy.clone();
        match &config.backend {
            BackendConfig::Static { nodes } => {
                self.add_node_source(name, StaticListBackend::from_config(nodes), policy)
                    .await
            }
            BackendConfig::Peer {
                peers,
                request_timeout_ms,
            } => {
                let backend = PeerBackend::new(name, peers.clone(), Duration::from_millis(*request_timeout_ms));
                self.add_node_source(name, backend, policy).await
            }
            BackendConfig::Provisioner {
                endpoint,
                request_timeout_ms,
            } => {
                let backend =
                    ProvisionerBackend::new(name, endpoint.clone(), Duration::from_millis(*request_timeout_ms));
                self.add_node_source(name, backend, policy).await
            }
        }
    }

    /// Shut a source down. Without `preempt` its lent nodes keep serving
    /// and the source is dropped once the last one is returned; a later
    /// call with `preempt` releases them right away.
    pub async fn remove_node_source(&self, name: &str, preempt: bool) -> PoolResult<()> {
        let source = {
            let mut sources = self.sources.write().await;
            let slot = sources
                .get_mut(name)
                .ok_or_else(|| PoolError::UnknownSource(name.to_string()))?;
            if slot.retiring && !preempt {
                return Ok(());
            }
            slot.retiring = true;
            slot.source.clone()
        };

        info!(source = %name, preempt, "removing node source");
        source.shutdown(preempt).await;
        reap_retired(&self.sources).await;
        Ok(())
    }

    pub async fn source_names(&self) -> Vec<String> {
        self.sources.read().await.keys().cloned().collect()
    }

    // ── Observation ───────────────────────────────────────────────

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.registry.subscribe()
    }

    pub async fn stats(&self) -> PoolStats {
        let slots: Vec<(String, Arc<dyn NodeSource>, bool)> = self
            .sources
            .read()
            .await
            .iter()
            .map(|(name, slot)| (name.clone(), slot.source.clone(), slot.retiring))
            .collect();

        let mut sources = Vec::with_capacity(slots.len());
        for (name, source, retiring) in slots {
            sources.push(SourceStats {
                name,
                held: source.held_count().await,
                retiring,
            });
        }

        PoolStats {
            nodes: self.registry.stats().await,
            sources,
            monitor: self.monitor.state().await,
            shutting_down: self.is_shutting_down(),
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn monitor(&self) -> &LivenessMonitor {
        &self.monitor
    }

    /// Ask the failure detector for an immediate pass.
    pub fn force_detection(&self) {
        self.monitor.force_detection();
    }

    /// Restart the failure detector with new settings.
    pub async fn reconfigure_liveness(&self, config: LivenessConfig) {
        info!(period_ms = config.period_ms, threshold = config.failure_threshold, "liveness reconfigured");
        self.monitor.initialize(config).await;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    /// Stop lending and shut every source down.
    ///
    /// Without `preempt`, lent nodes stay with their users and are
    /// released when returned. Calling again with `preempt` releases
    /// whatever is still pending.
    pub async fn shutdown(&self, preempt: bool) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            self.monitor.stop_failure_detector().await;
        }

        let slots: Vec<Arc<dyn NodeSource>> = self
            .sources
            .write()
            .await
            .values_mut()
            .map(|slot| {
                slot.retiring = true;
                slot.source.clone()
            })
            .collect();
        for source in &slots {
            source.shutdown(preempt).await;
        }

        let manual = self.detach_manual(preempt).await;
        reap_retired(&self.sources).await;
        info!(preempt, sources = slots.len(), manual_released = manual, "resource pool shut down");
    }

    /// Remove the hand-added nodes that may go now and mark the lent ones
    /// `ToRelease`. Returns how many were removed.
    async fn detach_manual(&self, preempt: bool) -> usize {
        let owned: HashSet<String> = self.sources.read().await.keys().cloned().collect();
        let mut guard = self.registry.write().await;
        let manual: Vec<(String, NodeState)> = guard
            .nodes()
            .into_iter()
            .filter(|n| !owned.contains(&n.source_id))
            .map(|n| (n.url, n.state))
            .collect();

        let mut removed = 0;
        for (url, state) in manual {
            match state {
                NodeState::Busy if !preempt => {
                    let _ = guard.transition(&url, NodeState::ToRelease);
                }
                NodeState::ToRelease if !preempt => {}
                _ => {
                    guard.remove(&url);
                    removed += 1;
                }
            }
        }
        removed
    }
}

impl Drop for ResourcePool {
    fn drop(&mut self) {
        self.dispatcher.abort();
        if let Ok(sources) = self.sources.try_read() {
            for slot in sources.values() {
                slot.task.abort();
            }
        }
    }
}

/// Mark selected nodes `Busy` and return them in that state.
fn lend(guard: &mut RegistryWriteGuard<'_>, nodes: Vec<Node>) -> PoolResult<Vec<Node>> {
    nodes
        .into_iter()
        .map(|mut node| {
            guard.transition(&node.url, NodeState::Busy)?;
            node.state = NodeState::Busy;
            Ok(node)
        })
        .collect()
}

async fn owner(sources: &Sources, source_id: &str) -> Option<Arc<dyn NodeSource>> {
    sources.read().await.get(source_id).map(|slot| slot.source.clone())
}

/// Drop retiring sources that no longer hold any node.
async fn reap_retired(sources: &Sources) {
    let retiring: Vec<(String, Arc<dyn NodeSource>)> = sources
        .read()
        .await
        .iter()
        .filter(|(_, slot)| slot.retiring)
        .map(|(name, slot)| (name.clone(), slot.source.clone()))
        .collect();

    for (name, source) in retiring {
        if source.held_count().await > 0 {
            continue;
        }
        if let Some(slot) = sources.write().await.remove(&name) {
            slot.task.abort();
            info!(source = %name, "node source removed");
        }
    }
}

/// Route liveness failures to the source owning the node.
async fn dispatch_failures(
    mut failures: mpsc::UnboundedReceiver<LivenessFailure>,
    registry: NodeRegistry,
    sources: Sources,
) {
    while let Some(failure) = failures.recv().await {
        let url = failure.url.as_str();
        let Some(node) = registry.get(url).await else {
            debug!(%url, "failure of a node already gone");
            continue;
        };
        warn!(%url, source = %node.source_id, kind = ?failure.kind, "node failed liveness check");

        if let Some(source) = owner(&sources, &node.source_id).await {
            source.detected_pinged_down_node(url).await;
        }
        // Hand-added nodes, or anything the source did not clean up.
        if registry.contains(url).await {
            let _ = registry.transition(url, NodeState::Down).await;
            registry.remove(url).await;
        }
        reap_retired(&sources).await;
    }
    debug!("failure dispatcher stopped");
}

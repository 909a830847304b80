//! DynamicNodeSource — keeps a bounded set of nodes acquired from one
//! backend registered in the pool.
//!
//! Bookkeeping per source:
//! - `held`: every node acquired and not yet given back, with its TTR
//!   deadline
//! - `nice_times`: min-heap of instants at which one more acquisition
//!   may be attempted. Releases and failures push `now + nice_time`, so
//!   a failing backend is not hammered.
//!
//! Lock order is always source bookkeeping, then registry. The source
//! never calls back into the pool.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use gridpool_core::{BoxFuture, Node, NodeSourcePolicy, NodeState, NodeUrl, SourceId};
use gridpool_registry::{NodeRegistry, RegistryError};

use crate::backend::NodeBackend;

/// What the pool needs from a node source.
pub trait NodeSource: Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Acquire and register one node, retrying within the policy's
    /// bounds. `None` when nothing could be acquired.
    fn get_node(&self) -> BoxFuture<'_, Option<Node>>;

    /// Give a node back to the backend. Idempotent.
    fn release_node<'a>(&'a self, url: &'a str) -> BoxFuture<'a, ()>;

    /// A held node failed its heartbeat.
    fn detected_pinged_down_node<'a>(&'a self, url: &'a str) -> BoxFuture<'a, ()>;

    fn shutdown(&self, preempt: bool) -> BoxFuture<'_, ()>;

    /// Maintenance loop: TTR expiry and nice-time driven acquisition.
    /// Returns once the source shuts down.
    fn run(self: Arc<Self>) -> BoxFuture<'static, ()>;

    /// Number of nodes currently held.
    fn held_count(&self) -> BoxFuture<'_, usize>;
}

#[derive(Debug)]
struct Held {
    /// `None` once TTR has been handled (or when there is no TTR).
    deadline: Option<Instant>,
}

#[derive(Debug, Default)]
struct Bookkeeping {
    held: HashMap<NodeUrl, Held>,
    nice_times: BinaryHeap<Reverse<Instant>>,
    /// Acquisitions in flight; they count against `max_nodes`.
    acquiring: usize,
    shutting_down: bool,
    /// A registry invariant broke under this source.
    halted: bool,
}

impl Bookkeeping {
    fn occupied(&self) -> usize {
        self.held.len() + self.acquiring
    }
}

pub struct DynamicNodeSource<B: NodeBackend> {
    id: SourceId,
    policy: NodeSourcePolicy,
    backend: B,
    registry: NodeRegistry,
    book: Mutex<Bookkeeping>,
    /// Set by any shutdown; stops the maintenance loop.
    stop_tx: watch::Sender<bool>,
    /// Set by a preemptive shutdown; cuts short the wait between
    /// acquisition attempts.
    cancel_tx: watch::Sender<bool>,
}

impl<B: NodeBackend> DynamicNodeSource<B> {
    pub fn new(id: impl Into<String>, policy: NodeSourcePolicy, backend: B, registry: NodeRegistry) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (cancel_tx, _) = watch::channel(false);
        Self {
            id: id.into(),
            policy,
            backend,
            registry,
            book: Mutex::new(Bookkeeping::default()),
            stop_tx,
            cancel_tx,
        }
    }

    pub fn policy(&self) -> &NodeSourcePolicy {
        &self.policy
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn is_shutting_down(&self) -> bool {
        self.book.lock().await.shutting_down
    }

    pub async fn is_halted(&self) -> bool {
        self.book.lock().await.halted
    }

    /// Stop for good after a registry invariant violation: no more
    /// acquisitions and the maintenance loop ends. Held nodes stay
    /// where they are.
    async fn halt(&self, error: &RegistryError) {
        error!(source = %self.id, %error, "registry invariant violated, node source halted");
        {
            let mut book = self.book.lock().await;
            book.halted = true;
            book.shutting_down = true;
            book.nice_times.clear();
        }
        let _ = self.stop_tx.send(true);
        let _ = self.cancel_tx.send(true);
    }

    /// Urls of the nodes held right now.
    pub async fn held_urls(&self) -> Vec<NodeUrl> {
        let mut urls: Vec<NodeUrl> = self.book.lock().await.held.keys().cloned().collect();
        urls.sort();
        urls
    }

    async fn acquire_one(&self) -> Option<Node> {
        let mut cancel = self.cancel_tx.subscribe();

        for attempt in 1..=self.policy.num_tries {
            {
                let mut book = self.book.lock().await;
                if book.shutting_down || *cancel.borrow() {
                    return None;
                }
                if book.occupied() >= self.policy.max_nodes as usize {
                    debug!(source = %self.id, max = self.policy.max_nodes, "source is full");
                    return None;
                }
                book.acquiring += 1;
            }

            // Runs to completion even under a preemptive shutdown: the
            // backend may already have handed the node out.
            let result = self.backend.acquire().await;

            let mut book = self.book.lock().await;
            book.acquiring -= 1;
            match result {
                Ok(acquired) => {
                    if book.shutting_down {
                        drop(book);
                        info!(source = %self.id, url = %acquired.url, "node acquired during shutdown, giving it back");
                        self.give_back(&acquired.url).await;
                        return None;
                    }

                    let node = Node::new(acquired.url.clone(), self.id.clone(), acquired.host_id())
                        .with_tokens(self.policy.access_tokens.iter().cloned());
                    match self.registry.register_free(node).await {
                        Ok(()) => {
                            let deadline = self.policy.ttr().map(|ttr| Instant::now() + ttr);
                            book.held.insert(acquired.url.clone(), Held { deadline });
                            drop(book);
                            info!(source = %self.id, url = %acquired.url, attempt, backend = self.backend.kind(), "node acquired");
                            return self.registry.get(&acquired.url).await;
                        }
                        Err(e) => {
                            drop(book);
                            warn!(source = %self.id, url = %acquired.url, error = %e, "acquired node rejected by registry");
                            self.give_back(&acquired.url).await;
                        }
                    }
                }
                Err(e) => {
                    drop(book);
                    warn!(source = %self.id, attempt, tries = self.policy.num_tries, error = %e, "node acquisition failed");
                }
            }

            if attempt < self.policy.num_tries {
                tokio::select! {
                    _ = tokio::time::sleep(self.policy.lookup_freq()) => {}
                    _ = cancel.changed() => return None,
                }
            }
        }

        debug!(source = %self.id, tries = self.policy.num_tries, "acquisition attempts exhausted");
        None
    }

    /// Tell the backend a node is given back. Failures are logged only.
    async fn give_back(&self, url: &str) {
        if let Err(e) = self.backend.relinquish(url).await {
            warn!(source = %self.id, %url, error = %e, "backend failed to take node back");
        }
    }

    /// Drop a node from the bookkeeping and schedule a later acquisition.
    /// `false` when the node was not held.
    async fn forget_held(&self, url: &str) -> bool {
        let mut book = self.book.lock().await;
        if book.held.remove(url).is_none() {
            return false;
        }
        if !book.shutting_down {
            let at = Instant::now() + self.policy.nice_time();
            book.nice_times.push(Reverse(at));
        }
        true
    }

    async fn release(&self, url: &str) {
        if !self.forget_held(url).await {
            debug!(source = %self.id, %url, "release of a node not held, ignoring");
            return;
        }
        self.registry.remove(url).await;
        self.give_back(url).await;
        info!(source = %self.id, %url, "node released");
    }

    async fn detected_down(&self, url: &str) {
        if !self.forget_held(url).await {
            debug!(source = %self.id, %url, "down report for a node not held");
            return;
        }
        match self.registry.transition(url, NodeState::Down).await {
            Err(e @ RegistryError::InvariantViolation { .. }) => return self.halt(&e).await,
            Err(e) => debug!(source = %self.id, %url, error = %e, "node gone before it could be marked down"),
            Ok(_) => {}
        }
        self.registry.remove(url).await;
        self.backend.forget(url).await;
        warn!(source = %self.id, %url, "node down, re-acquisition scheduled after nice time");
    }

    /// Under the registry lock, remove the held nodes that may go now
    /// and mark the busy ones `ToRelease`. Stops at the first invariant
    /// violation; the urls removed so far are returned either way.
    async fn detach(&self, urls: &[NodeUrl], preempt: bool) -> (Vec<NodeUrl>, Option<RegistryError>) {
        let mut guard = self.registry.write().await;
        let mut removed = Vec::new();
        for url in urls {
            let state = guard.get(url).map(|n| n.state);
            match state {
                Some(NodeState::Busy) if !preempt => {
                    if let Err(e) = guard.transition(url, NodeState::ToRelease) {
                        return (removed, Some(e));
                    }
                }
                Some(NodeState::ToRelease) if !preempt => {}
                Some(_) => {
                    guard.remove(url);
                    removed.push(url.clone());
                }
                None => removed.push(url.clone()),
            }
        }
        (removed, None)
    }

    async fn shutdown_inner(&self, preempt: bool) {
        let urls: Vec<NodeUrl> = {
            let mut book = self.book.lock().await;
            book.shutting_down = true;
            book.nice_times.clear();
            book.held.keys().cloned().collect()
        };
        let _ = self.stop_tx.send(true);
        if preempt {
            let _ = self.cancel_tx.send(true);
        }

        let (removed, violation) = self.detach(&urls, preempt).await;
        for url in &removed {
            self.release(url).await;
        }
        if let Some(e) = violation {
            self.halt(&e).await;
        }
        info!(
            source = %self.id,
            preempt,
            released = removed.len(),
            pending = urls.len() - removed.len(),
            "node source shutting down"
        );
    }

    /// One maintenance tick.
    pub async fn maintain(&self) {
        let now = Instant::now();

        // TTR expiry.
        let expired: Vec<NodeUrl> = {
            let mut book = self.book.lock().await;
            if book.shutting_down {
                return;
            }
            book.held
                .iter_mut()
                .filter(|(_, h)| h.deadline.is_some_and(|d| d <= now))
                .map(|(url, h)| {
                    h.deadline = None;
                    url.clone()
                })
                .collect()
        };
        if !expired.is_empty() {
            debug!(source = %self.id, count = expired.len(), "nodes reached their TTR");
            let (removed, violation) = self.detach(&expired, false).await;
            for url in removed {
                self.release(&url).await;
            }
            if let Some(e) = violation {
                return self.halt(&e).await;
            }
        }

        // Acquisition slots that are due.
        let due = {
            let mut book = self.book.lock().await;
            let max = self.policy.max_nodes as usize;
            while book.occupied() + book.nice_times.len() < max {
                book.nice_times.push(Reverse(now));
            }
            let mut due = 0;
            while book.occupied() + due < max
                && book.nice_times.peek().is_some_and(|Reverse(at)| *at <= now)
            {
                book.nice_times.pop();
                due += 1;
            }
            due
        };

        for _ in 0..due {
            if self.acquire_one().await.is_none() {
                let mut book = self.book.lock().await;
                if !book.shutting_down {
                    let at = Instant::now() + self.policy.nice_time();
                    book.nice_times.push(Reverse(at));
                }
            }
        }
    }
}

impl<B: NodeBackend> NodeSource for DynamicNodeSource<B> {
    fn id(&self) -> &str {
        &self.id
    }

    fn get_node(&self) -> BoxFuture<'_, Option<Node>> {
        Box::pin(self.acquire_one())
    }

    fn release_node<'a>(&'a self, url: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(self.release(url))
    }

    fn detected_pinged_down_node<'a>(&'a self, url: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(self.detected_down(url))
    }

    fn shutdown(&self, preempt: bool) -> BoxFuture<'_, ()> {
        Box::pin(self.shutdown_inner(preempt))
    }

    fn run(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let mut stop = self.stop_tx.subscribe();
            let tick = self.policy.lookup_freq();
            info!(source = %self.id, backend = self.backend.kind(), max = self.policy.max_nodes, "node source started");

            loop {
                if *stop.borrow() {
                    break;
                }
                // Not raced against `stop`: an acquisition must finish so
                // that a node obtained meanwhile is given back.
                self.maintain().await;
                tokio::select! {
                    _ = tokio::time::sleep(tick) => {}
                    _ = stop.changed() => break,
                }
            }
            debug!(source = %self.id, "node source loop stopped");
        })
    }

    fn held_count(&self) -> BoxFuture<'_, usize> {
        Box::pin(async move { self.book.lock().await.held.len() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use gridpool_core::NodeEventKind;

    use crate::backend::AcquiredNode;
    use crate::error::{BackendError, BackendResult};

    /// Fails the first `failures` acquisitions, then hands out
    /// `pnp://fake/<n>` nodes.
    #[derive(Default)]
    struct FakeBackend {
        failures: u32,
        delay: Duration,
        acquired: AtomicU32,
        attempts: AtomicU32,
        relinquished: std::sync::Mutex<Vec<String>>,
        forgotten: std::sync::Mutex<Vec<String>>,
    }

    impl FakeBackend {
        fn failing(failures: u32) -> Self {
            Self {
                failures,
                ..Self::default()
            }
        }

        fn relinquished(&self) -> Vec<String> {
            self.relinquished.lock().unwrap().clone()
        }
    }

    impl NodeBackend for FakeBackend {
        fn kind(&self) -> &'static str {
            "fake"
        }

        fn acquire(&self) -> BoxFuture<'_, BackendResult<AcquiredNode>> {
            Box::pin(async move {
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt <= self.failures {
                    return Err(BackendError::Unavailable(format!("attempt {attempt}")));
                }
                let n = self.acquired.fetch_add(1, Ordering::SeqCst);
                Ok(AcquiredNode::new(format!("pnp://fake/{n}")).on_host(format!("host-{}", n % 2)))
            })
        }

        fn relinquish<'a>(&'a self, url: &'a str) -> BoxFuture<'a, BackendResult<()>> {
            Box::pin(async move {
                self.relinquished.lock().unwrap().push(url.to_string());
                Ok(())
            })
        }

        fn forget<'a>(&'a self, url: &'a str) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.forgotten.lock().unwrap().push(url.to_string());
            })
        }
    }

    fn policy(max_nodes: u32) -> NodeSourcePolicy {
        NodeSourcePolicy {
            nice_time_ms: 50,
            lookup_freq_ms: 1,
            ..NodeSourcePolicy::new(max_nodes)
        }
    }

    fn source(policy: NodeSourcePolicy, backend: FakeBackend) -> (Arc<DynamicNodeSource<FakeBackend>>, NodeRegistry) {
        let registry = NodeRegistry::new(64);
        let source = Arc::new(DynamicNodeSource::new("lab", policy, backend, registry.clone()));
        (source, registry)
    }

    #[tokio::test]
    async fn get_node_registers_a_free_node() {
        let mut p = policy(2);
        p.access_tokens = vec!["gpu".into()];
        let (source, registry) = source(p, FakeBackend::default());

        let node = source.get_node().await.unwrap();
        assert_eq!(node.state, NodeState::Free);
        assert_eq!(node.source_id, "lab");
        assert_eq!(node.host_id, "host-0");
        assert!(node.has_token("gpu"));
        assert!(registry.contains(&node.url).await);
        assert_eq!(source.held_count().await, 1);
    }

    #[tokio::test]
    async fn succeeds_on_last_try() {
        let (source, _) = source(policy(1), FakeBackend::failing(9));
        let node = source.get_node().await;
        assert!(node.is_some(), "tenth attempt must succeed");
        assert_eq!(source.backend().attempts.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn gives_up_after_num_tries() {
        let (source, registry) = source(policy(1), FakeBackend::failing(100));
        assert!(source.get_node().await.is_none());
        assert_eq!(source.backend().attempts.load(Ordering::SeqCst), 10);
        assert_eq!(registry.stats().await.total, 0);
    }

    #[tokio::test]
    async fn full_source_does_not_acquire() {
        let (source, _) = source(policy(1), FakeBackend::default());
        assert!(source.get_node().await.is_some());
        assert!(source.get_node().await.is_none());
        assert_eq!(source.backend().attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn double_release_is_a_noop() {
        let (source, registry) = source(policy(2), FakeBackend::default());
        let node = source.get_node().await.unwrap();

        source.release_node(&node.url).await;
        source.release_node(&node.url).await;

        assert_eq!(source.backend().relinquished(), vec![node.url.clone()]);
        assert_eq!(source.held_count().await, 0);
        assert!(!registry.contains(&node.url).await);
    }

    #[tokio::test]
    async fn down_node_is_forgotten_and_reported() {
        let (source, registry) = source(policy(2), FakeBackend::default());
        let node = source.get_node().await.unwrap();
        let mut events = registry.subscribe();

        source.detected_pinged_down_node(&node.url).await;

        assert_eq!(events.recv().await.unwrap().kind, NodeEventKind::Down);
        assert_eq!(events.recv().await.unwrap().kind, NodeEventKind::Removed);
        assert!(source.backend().relinquished().is_empty());
        assert_eq!(*source.backend().forgotten.lock().unwrap(), vec![node.url.clone()]);
        assert_eq!(source.held_count().await, 0);

        // second report is ignored
        source.detected_pinged_down_node(&node.url).await;
        assert_eq!(source.backend().forgotten.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn preemptive_shutdown_releases_busy_nodes() {
        let (source, registry) = source(policy(3), FakeBackend::default());
        let a = source.get_node().await.unwrap();
        let b = source.get_node().await.unwrap();
        registry.transition(&a.url, NodeState::Busy).await.unwrap();

        source.shutdown(true).await;

        assert!(!registry.contains(&a.url).await);
        assert!(!registry.contains(&b.url).await);
        assert_eq!(source.backend().relinquished().len(), 2);
        assert!(source.get_node().await.is_none());
    }

    #[tokio::test]
    async fn graceful_shutdown_defers_busy_nodes() {
        let (source, registry) = source(policy(3), FakeBackend::default());
        let busy = source.get_node().await.unwrap();
        let free = source.get_node().await.unwrap();
        registry.transition(&busy.url, NodeState::Busy).await.unwrap();

        source.shutdown(false).await;
        assert!(!registry.contains(&free.url).await);
        assert_eq!(registry.get(&busy.url).await.unwrap().state, NodeState::ToRelease);
        assert_eq!(source.held_count().await, 1);

        // the client gives the node back
        source.release_node(&busy.url).await;
        assert_eq!(source.held_count().await, 0);
        assert_eq!(source.backend().relinquished().len(), 2);
    }

    #[tokio::test]
    async fn preemptive_shutdown_escalates_a_graceful_one() {
        let (source, registry) = source(policy(2), FakeBackend::default());
        let busy = source.get_node().await.unwrap();
        registry.transition(&busy.url, NodeState::Busy).await.unwrap();

        source.shutdown(false).await;
        assert_eq!(source.held_count().await, 1);
        source.shutdown(true).await;
        assert_eq!(source.held_count().await, 0);
        assert!(!registry.contains(&busy.url).await);
    }

    #[tokio::test]
    async fn node_acquired_during_shutdown_is_given_back() {
        let backend = FakeBackend {
            delay: Duration::from_millis(50),
            ..FakeBackend::default()
        };
        let (source, registry) = source(policy(1), backend);

        let acquiring = {
            let source = source.clone();
            tokio::spawn(async move { source.get_node().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        source.shutdown(false).await;

        assert!(acquiring.await.unwrap().is_none());
        assert_eq!(registry.stats().await.total, 0);
        assert_eq!(source.backend().relinquished(), vec!["pnp://fake/0".to_string()]);
    }

    #[tokio::test]
    async fn in_flight_acquisition_is_given_back_on_preemptive_shutdown() {
        let backend = FakeBackend {
            delay: Duration::from_millis(50),
            ..FakeBackend::default()
        };
        let (source, registry) = source(policy(1), backend);

        let acquiring = {
            let source = source.clone();
            tokio::spawn(async move { source.get_node().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        source.shutdown(true).await;

        assert!(acquiring.await.unwrap().is_none());
        assert_eq!(source.backend().acquired.load(Ordering::SeqCst), 1);
        assert_eq!(source.backend().relinquished(), vec!["pnp://fake/0".to_string()]);
        assert_eq!(registry.stats().await.total, 0);
        assert_eq!(source.held_count().await, 0);
    }

    #[tokio::test]
    async fn preemptive_shutdown_interrupts_retry_loop() {
        let mut p = policy(1);
        p.lookup_freq_ms = 10_000;
        let (source, _) = source(p, FakeBackend::failing(100));

        let acquiring = {
            let source = source.clone();
            tokio::spawn(async move { source.get_node().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        source.shutdown(true).await;

        let result = tokio::time::timeout(Duration::from_secs(1), acquiring).await;
        assert!(result.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn maintenance_fills_up_to_max() {
        let (source, registry) = source(policy(3), FakeBackend::default());
        source.maintain().await;
        assert_eq!(source.held_count().await, 3);
        assert_eq!(registry.stats().await.free, 3);

        source.maintain().await;
        assert_eq!(source.backend().attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn released_slot_waits_for_nice_time() {
        let (source, _) = source(policy(1), FakeBackend::default());
        source.maintain().await;
        let url = source.held_urls().await.remove(0);

        source.release_node(&url).await;
        source.maintain().await;
        assert_eq!(source.held_count().await, 0, "nice time not elapsed yet");

        tokio::time::sleep(Duration::from_millis(80)).await;
        source.maintain().await;
        assert_eq!(source.held_count().await, 1);
    }

    #[tokio::test]
    async fn ttr_expiry_releases_free_and_marks_busy() {
        let mut p = policy(2);
        p.ttr_ms = Some(20);
        p.nice_time_ms = 60_000;
        let (source, registry) = source(p, FakeBackend::default());
        source.maintain().await;
        let urls = source.held_urls().await;
        registry.transition(&urls[0], NodeState::Busy).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        source.maintain().await;

        assert_eq!(registry.get(&urls[0]).await.unwrap().state, NodeState::ToRelease);
        assert!(!registry.contains(&urls[1]).await);
        assert_eq!(source.held_urls().await, vec![urls[0].clone()]);
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() {
        let (source, registry) = source(policy(2), FakeBackend::default());
        let handle = tokio::spawn(source.clone().run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.stats().await.free, 2);

        source.shutdown(true).await;
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(registry.stats().await.total, 0);
    }

    #[tokio::test]
    async fn invariant_violation_halts_the_source() {
        let (source, registry) = source(policy(2), FakeBackend::default());
        let handle = tokio::spawn(source.clone().run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let urls = source.held_urls().await;
        assert_eq!(urls.len(), 2);

        // A released node can no longer go down.
        registry.transition(&urls[0], NodeState::Released).await.unwrap();
        source.detected_pinged_down_node(&urls[0]).await;

        assert!(source.is_halted().await);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(registry.get(&urls[0]).await.unwrap().state, NodeState::Released);
        assert!(source.backend().forgotten.lock().unwrap().is_empty());
        assert!(source.get_node().await.is_none());
        assert_eq!(source.backend().attempts.load(Ordering::SeqCst), 2);
    }
}

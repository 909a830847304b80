//! Liveness monitor — one background task scanning every monitored
//! endpoint and reporting the ones that stop answering.
//!
//! ```text
//!   Idle ──start──► Scanning ──clean pass──► Idle (pause: period | force)
//!                      │  ▲
//!                      │  └── failure reported / forced ── fresh snapshot
//!                      └──stop──► Killed
//! ```
//!
//! Each pass works on an immutable snapshot of the endpoint list. A
//! reported endpoint is not reported again while it stays in the
//! snapshot, so a failure racing with `force_detection` is delivered once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gridpool_core::{epoch_millis, BoxFuture, LivenessConfig, NodeUrl};
use gridpool_registry::NodeRegistry;

use crate::probe::{heartbeat_url, Heartbeat, HeartbeatProbe, ProbeError};

/// Where the monitor gets the endpoints to scan from.
pub trait EndpointSource: Send + Sync + 'static {
    fn endpoints(&self) -> BoxFuture<'_, Vec<NodeUrl>>;
}

impl EndpointSource for NodeRegistry {
    fn endpoints(&self) -> BoxFuture<'_, Vec<NodeUrl>> {
        Box::pin(self.monitored_urls())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Idle,
    Scanning,
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The endpoint answered that it is dead.
    Dead,
    /// The endpoint could not be reached.
    Unreachable,
}

/// A failure notification. Dead and unreachable endpoints get the same
/// recovery treatment; the kind is informational.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessFailure {
    pub url: NodeUrl,
    pub kind: FailureKind,
}

/// Heartbeat history of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LivenessRecord {
    pub url: NodeUrl,
    /// Unix timestamp (millis) of the last `Alive` answer.
    pub last_heartbeat_at: Option<u64>,
    pub consecutive_failures: u32,
}

impl LivenessRecord {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            last_heartbeat_at: None,
            consecutive_failures: 0,
        }
    }

    fn record_alive(&mut self) {
        self.consecutive_failures = 0;
        self.last_heartbeat_at = Some(epoch_millis());
    }

    fn record_failure(&mut self) -> u32 {
        self.consecutive_failures += 1;
        self.consecutive_failures
    }
}

/// State shared between the monitor handle and its scan task.
struct Shared {
    state: RwLock<MonitorState>,
    records: RwLock<HashMap<NodeUrl, LivenessRecord>>,
    restart: AtomicBool,
    wake: Notify,
}

struct Slot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

struct Control {
    config: LivenessConfig,
    slot: Option<Slot>,
}

/// Failure detector over an [`EndpointSource`].
pub struct LivenessMonitor {
    endpoints: Arc<dyn EndpointSource>,
    probe: Arc<dyn HeartbeatProbe>,
    failures: mpsc::UnboundedSender<LivenessFailure>,
    shared: Arc<Shared>,
    control: Mutex<Control>,
}

impl LivenessMonitor {
    /// Create a stopped monitor. Failures are sent to `failures`.
    pub fn new(
        config: LivenessConfig,
        endpoints: Arc<dyn EndpointSource>,
        probe: Arc<dyn HeartbeatProbe>,
        failures: mpsc::UnboundedSender<LivenessFailure>,
    ) -> Self {
        Self {
            endpoints,
            probe,
            failures,
            shared: Arc::new(Shared {
                state: RwLock::new(MonitorState::Idle),
                records: RwLock::new(HashMap::new()),
                restart: AtomicBool::new(false),
                wake: Notify::new(),
            }),
            control: Mutex::new(Control { config, slot: None }),
        }
    }

    /// Start the scan task. A no-op while it is already running.
    pub async fn start_failure_detector(&self) {
        let mut control = self.control.lock().await;
        if let Some(slot) = &control.slot
            && !slot.handle.is_finished()
        {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scanner = Scanner {
            config: control.config.clone(),
            endpoints: self.endpoints.clone(),
            probe: self.probe.clone(),
            failures: self.failures.clone(),
            shared: self.shared.clone(),
        };
        *self.shared.state.write().await = MonitorState::Idle;
        let handle = tokio::spawn(scanner.run(shutdown_rx));
        control.slot = Some(Slot { handle, shutdown_tx });

        info!(
            period_ms = control.config.period_ms,
            threshold = control.config.failure_threshold,
            "failure detector started"
        );
    }

    /// Stop the scan task, discarding the pass in progress.
    pub async fn stop_failure_detector(&self) {
        let mut control = self.control.lock().await;
        if let Some(slot) = control.slot.take() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!("failure detector stopped");
        }
        *self.shared.state.write().await = MonitorState::Killed;
    }

    /// Stop, forget all heartbeat history, and start again with `config`.
    pub async fn initialize(&self, config: LivenessConfig) {
        self.stop_failure_detector().await;
        self.shared.records.write().await.clear();
        self.shared.restart.store(false, Ordering::SeqCst);
        self.control.lock().await.config = config;
        self.start_failure_detector().await;
    }

    /// Wake a paused scan, or make the running pass restart from a fresh
    /// snapshot. Never starts a second concurrent scan.
    pub fn force_detection(&self) {
        self.shared.restart.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    /// Probe one endpoint once, outside the scan loop.
    pub async fn is_unreachable(&self, url: &str) -> bool {
        let config = self.control.lock().await.config.clone();
        let endpoint = heartbeat_url(url, &config.heartbeat_path);
        !matches!(probe_once(self.probe.as_ref(), &endpoint, &config).await, Ok(Heartbeat::Alive))
    }

    pub async fn state(&self) -> MonitorState {
        *self.shared.state.read().await
    }

    /// Heartbeat history of every endpoint seen in the latest snapshot.
    pub async fn records(&self) -> Vec<LivenessRecord> {
        let mut records: Vec<LivenessRecord> = self.shared.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.url.cmp(&b.url));
        records
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        if let Some(slot) = self.control.get_mut().slot.take() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
        }
    }
}

async fn probe_once(
    probe: &dyn HeartbeatProbe,
    endpoint: &str,
    config: &LivenessConfig,
) -> Result<Heartbeat, ProbeError> {
    let timeout = config.probe_timeout();
    match tokio::time::timeout(timeout, probe.ping(endpoint)).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError::Timeout(timeout)),
    }
}

/// How one scan pass ended.
enum PassOutcome {
    Clean,
    Restart,
    Shutdown,
}

/// The scan task. Owns the per-run bookkeeping.
struct Scanner {
    config: LivenessConfig,
    endpoints: Arc<dyn EndpointSource>,
    probe: Arc<dyn HeartbeatProbe>,
    failures: mpsc::UnboundedSender<LivenessFailure>,
    shared: Arc<Shared>,
}

impl Scanner {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut reported: HashSet<NodeUrl> = HashSet::new();
        debug!("liveness scan loop starting");

        loop {
            *self.shared.state.write().await = MonitorState::Scanning;
            match self.scan_pass(&mut reported, &shutdown).await {
                PassOutcome::Shutdown => break,
                PassOutcome::Restart => continue,
                PassOutcome::Clean => {}
            }

            *self.shared.state.write().await = MonitorState::Idle;
            tokio::select! {
                _ = tokio::time::sleep(self.config.period()) => {}
                _ = self.shared.wake.notified() => {
                    debug!("liveness scan forced");
                }
                _ = shutdown.changed() => break,
            }
        }

        *self.shared.state.write().await = MonitorState::Killed;
        debug!("liveness scan loop stopped");
    }

    async fn scan_pass(&self, reported: &mut HashSet<NodeUrl>, shutdown: &watch::Receiver<bool>) -> PassOutcome {
        self.shared.restart.store(false, Ordering::SeqCst);
        let snapshot: Arc<[NodeUrl]> = self.endpoints.endpoints().await.into();

        // Forget endpoints that left the monitored set.
        let current: HashSet<&str> = snapshot.iter().map(String::as_str).collect();
        reported.retain(|url| current.contains(url.as_str()));
        self.shared
            .records
            .write()
            .await
            .retain(|url, _| current.contains(url.as_str()));

        for url in snapshot.iter() {
            if *shutdown.borrow() {
                return PassOutcome::Shutdown;
            }
            if self.shared.restart.load(Ordering::SeqCst) {
                debug!("scan restarted from a fresh snapshot");
                return PassOutcome::Restart;
            }
            if reported.contains(url) {
                continue;
            }

            let endpoint = heartbeat_url(url, &self.config.heartbeat_path);
            let result = probe_once(self.probe.as_ref(), &endpoint, &self.config).await;

            let mut records = self.shared.records.write().await;
            let record = records
                .entry(url.clone())
                .or_insert_with(|| LivenessRecord::new(url));
            let kind = match result {
                Ok(Heartbeat::Alive) => {
                    record.record_alive();
                    continue;
                }
                Ok(Heartbeat::Dead) => FailureKind::Dead,
                Err(e) => {
                    debug!(%url, error = %e, "heartbeat failed");
                    FailureKind::Unreachable
                }
            };

            let failures = record.record_failure();
            drop(records);
            if failures < self.config.failure_threshold {
                debug!(%url, failures, threshold = self.config.failure_threshold, "heartbeat miss below threshold");
                continue;
            }

            warn!(%url, ?kind, failures, "endpoint failed liveness check");
            reported.insert(url.clone());
            if self.failures.send(LivenessFailure { url: url.clone(), kind }).is_err() {
                debug!("failure receiver dropped");
            }
            return PassOutcome::Restart;
        }
        PassOutcome::Clean
    }
}

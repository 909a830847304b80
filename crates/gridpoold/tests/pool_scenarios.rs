//! Resource pool scenarios.
//!
//! Exercise the assembled pool the way the daemon runs it: sources from
//! configuration, selection with topologies and scripts, liveness over
//! real HTTP heartbeats, and shutdown.

use std::collections::HashSet;
use std::io::Write;
use std::time::Duration;

use gridpool::{PoolError, PoolStats, ResourcePool};
use gridpool_core::{BoxFuture, Criteria, NodeSourcePolicy, NodeState, PoolConfig, SelectionScript, Topology};
use gridpool_liveness::{Heartbeat, HeartbeatProbe, ProbeResult};
use gridpool_source::{AcquiredNode, StaticListBackend};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

struct AlwaysAlive;

impl HeartbeatProbe for AlwaysAlive {
    fn ping<'a>(&'a self, _endpoint: &'a str) -> BoxFuture<'a, ProbeResult<Heartbeat>> {
        Box::pin(async { Ok(Heartbeat::Alive) })
    }
}

fn quick_config() -> PoolConfig {
    let mut config = PoolConfig::default();
    config.liveness.period_ms = 20;
    config
}

async fn test_pool(config: PoolConfig) -> ResourcePool {
    ResourcePool::builder(config).with_probe(AlwaysAlive).build().await.unwrap()
}

async fn add_host(pool: &ResourcePool, host: &str, count: usize) {
    for i in 0..count {
        assert!(pool.add_node(&format!("pnp://{host}:1099/w{i}"), None).await);
    }
}

fn fast_policy(max_nodes: u32) -> NodeSourcePolicy {
    let mut policy = NodeSourcePolicy::new(max_nodes);
    policy.nice_time_ms = 0;
    policy.lookup_freq_ms = 10;
    policy
}

async fn wait_for(pool: &ResourcePool, what: impl Fn(&PoolStats) -> bool) {
    for _ in 0..300 {
        if what(&pool.stats().await) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pool never reached the expected state: {:?}", pool.stats().await);
}

/// Answer every heartbeat with `200 OK`.
async fn heartbeat_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let mut read = 0;
                while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf[read..]).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => read += n,
                    }
                }
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nOK")
                    .await;
                let _ = stream.shutdown().await;
            });
        }
    });
    addr
}

// ── Selection ──────────────────────────────────────────────────

#[tokio::test]
async fn single_host_prefers_a_host_that_fits() {
    let pool = test_pool(quick_config()).await;
    add_host(&pool, "a", 3).await;
    add_host(&pool, "b", 2).await;

    let set = pool
        .get_nodes(&Criteria::new(2).with_topology(Topology::SingleHost))
        .await
        .unwrap();
    assert_eq!(set.len(), 2);
    assert!(set.nodes().iter().all(|n| n.host_id == "a"));
    assert!(set.extra_nodes().is_none());
    pool.release_nodes(set.all_node_urls()).await;

    let set = pool
        .get_nodes(&Criteria::new(4).with_topology(Topology::SingleHost))
        .await
        .unwrap();
    assert!(set.is_empty());
    assert_eq!(pool.stats().await.nodes.free, 5);
}

#[tokio::test]
async fn best_effort_returns_what_is_free() {
    let pool = test_pool(quick_config()).await;
    add_host(&pool, "a", 3).await;

    let set = tokio::time::timeout(
        Duration::from_secs(1),
        pool.get_nodes(&Criteria::new(5).best_effort(true)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(set.len(), 3);

    let set = pool.get_nodes(&Criteria::new(1).best_effort(true)).await.unwrap();
    assert!(set.is_empty());
}

#[tokio::test]
async fn concurrent_strict_requests_never_share_nodes() {
    let pool = test_pool(quick_config()).await;
    add_host(&pool, "a", 5).await;
    add_host(&pool, "b", 5).await;

    let results = concurrent_requests(&pool, 6, 2).await;
    let mut seen = HashSet::new();
    let mut served = 0;
    for set in results {
        served += set.len();
        for url in set.all_node_urls() {
            assert!(seen.insert(url), "node lent twice");
        }
    }
    assert_eq!(served, 10);
}

/// `requests` selections of `size` nodes, the first three concurrently.
async fn concurrent_requests(pool: &ResourcePool, requests: usize, size: u32) -> Vec<gridpool_core::NodeSet> {
    let criteria = Criteria::new(size);
    let mut sets = Vec::new();
    let (a, b, c) = tokio::join!(
        pool.get_nodes(&criteria),
        pool.get_nodes(&criteria),
        pool.get_nodes(&criteria)
    );
    sets.extend([a.unwrap(), b.unwrap(), c.unwrap()]);
    for _ in 3..requests {
        sets.push(pool.get_nodes(&criteria).await.unwrap());
    }
    sets
}

// ── Configuration ──────────────────────────────────────────────

#[tokio::test]
async fn static_source_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[liveness]
period_ms = 20

[[sources]]
name = "lab"
[sources.policy]
max_nodes = 3
nice_time_ms = 0
lookup_freq_ms = 10
access_tokens = ["gpu"]
[sources.backend]
kind = "static"
nodes = [
    {{ url = "pnp://10.0.0.1:1099/w1", host = "rack-1" }},
    {{ url = "pnp://10.0.0.2:1099/w1", host = "rack-2" }},
    {{ url = "pnp://10.0.0.3:1099/w1", host = "rack-2" }},
]
"#
    )
    .unwrap();

    let config = PoolConfig::from_file(file.path()).unwrap();
    let pool = test_pool(config).await;
    wait_for(&pool, |s| s.nodes.free == 3).await;

    // Source nodes carry the policy token.
    let set = pool.get_nodes(&Criteria::new(1).best_effort(true)).await.unwrap();
    assert!(set.is_empty());

    let criteria = Criteria::new(2)
        .with_access_token("gpu")
        .with_script(SelectionScript::new("host == $rack"))
        .with_binding("rack", "rack-2");
    let set = pool.get_nodes(&criteria).await.unwrap();
    assert_eq!(set.len(), 2);
    assert!(set.nodes().iter().all(|n| n.host_id == "rack-2" && n.source_id == "lab"));

    pool.remove_node_source("lab", false).await.unwrap();
    let stats = pool.stats().await;
    assert_eq!(stats.nodes.total, 2);
    assert_eq!(stats.nodes.to_release, 2);

    assert_eq!(pool.release_nodes(set.all_node_urls()).await, 2);
    wait_for(&pool, |s| s.nodes.total == 0 && s.sources.is_empty()).await;
}

#[tokio::test]
async fn only_authorized_scripts_are_run() {
    let allowed = SelectionScript::new("host == a");
    let mut config = quick_config();
    config.selection.authorized_script_digests = vec![allowed.digest()];
    let pool = test_pool(config).await;
    add_host(&pool, "a", 1).await;

    let err = pool
        .get_nodes(&Criteria::new(1).with_script(SelectionScript::new("host == b")))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Configuration(_)));
    assert_eq!(pool.stats().await.nodes.free, 1);

    let set = pool.get_nodes(&Criteria::new(1).with_script(allowed)).await.unwrap();
    assert_eq!(set.len(), 1);
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let mut config = quick_config();
    config.liveness.failure_threshold = 0;
    let err = ResourcePool::builder(config).with_probe(AlwaysAlive).build().await.err().unwrap();
    assert!(matches!(err, PoolError::Config(_)));
}

// ── Liveness ───────────────────────────────────────────────────

#[tokio::test]
async fn unreachable_nodes_leave_the_pool() {
    let alive = heartbeat_server().await;
    let gone = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };

    let mut config = quick_config();
    config.liveness.probe_timeout_ms = 500;
    let pool = ResourcePool::new(config).await.unwrap();
    let alive_url = format!("http://{alive}/w1");
    assert!(pool.add_node(&alive_url, None).await);
    assert!(pool.add_node(&format!("http://{gone}/w1"), None).await);

    wait_for(&pool, |s| s.nodes.total == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let remaining = pool.registry().snapshot().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].url, alive_url);
    assert!(!pool.monitor().is_unreachable(&alive_url).await);
}

// ── Shutdown ───────────────────────────────────────────────────

#[tokio::test]
async fn preemptive_shutdown_releases_busy_nodes() {
    let pool = test_pool(quick_config()).await;
    let backend = StaticListBackend::new(vec![
        AcquiredNode::new("pnp://s:1099/w1"),
        AcquiredNode::new("pnp://s:1099/w2"),
    ]);
    pool.add_node_source("lab", backend, fast_policy(2)).await.unwrap();
    wait_for(&pool, |s| s.nodes.free == 2).await;

    let set = pool.get_nodes(&Criteria::new(2)).await.unwrap();
    assert!(set.nodes().iter().all(|n| n.state == NodeState::Busy));
    let mut events = pool.subscribe();

    pool.shutdown(true).await;

    let mut removed = HashSet::new();
    while let Ok(event) = events.try_recv() {
        if event.kind == gridpool_core::NodeEventKind::Removed {
            removed.insert(event.url);
        }
    }
    assert_eq!(removed, set.all_node_urls().into_iter().collect());
    assert!(pool.get_nodes(&Criteria::new(1).best_effort(true)).await.unwrap().is_empty());
    assert_eq!(pool.stats().await.nodes.total, 0);
}

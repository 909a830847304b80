//! gridpool.toml configuration.
//!
//! ```toml
//! [liveness]
//! period_ms = 10000
//!
//! [[sources]]
//! name = "lab"
//! [sources.policy]
//! max_nodes = 4
//! nice_time_ms = 5000
//! [sources.backend]
//! kind = "static"
//! nodes = [{ url = "pnp://10.0.0.4:1099/w1" }]
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

/// Settings of the failure detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Pause between two clean scan passes.
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Consecutive failed heartbeats before an endpoint is reported.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Path appended to a node url for its heartbeat.
    #[serde(default = "default_heartbeat_path")]
    pub heartbeat_path: String,
}

impl LivenessConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            period_ms: default_period_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            heartbeat_path: default_heartbeat_path(),
        }
    }
}

/// Selection script authorization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Hex sha256 digests of the only scripts allowed to run.
    #[serde(default)]
    pub authorized_script_digests: Vec<String>,
    /// Directory whose files are all authorized scripts.
    #[serde(default)]
    pub authorized_script_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Buffered events per subscriber before the slowest one lags.
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

/// Per-source acquisition policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSourcePolicy {
    /// Upper bound of nodes held at once.
    pub max_nodes: u32,
    /// Minimum delay before re-acquiring after a release or failure.
    #[serde(default = "default_nice_time_ms")]
    pub nice_time_ms: u64,
    /// Maximum holding time before a node is proactively released.
    /// `None` keeps nodes until the source shuts down.
    #[serde(default)]
    pub ttr_ms: Option<u64>,
    /// Tokens protecting every node of this source.
    #[serde(default)]
    pub access_tokens: Vec<String>,
    /// Delay between two acquisition attempts of one `get_node` call.
    #[serde(default = "default_lookup_freq_ms")]
    pub lookup_freq_ms: u64,
    /// Attempts per `get_node` call.
    #[serde(default = "default_num_tries")]
    pub num_tries: u32,
}

impl NodeSourcePolicy {
    pub fn new(max_nodes: u32) -> Self {
        Self {
            max_nodes,
            nice_time_ms: default_nice_time_ms(),
            ttr_ms: None,
            access_tokens: Vec::new(),
            lookup_freq_ms: default_lookup_freq_ms(),
            num_tries: default_num_tries(),
        }
    }

    pub fn nice_time(&self) -> Duration {
        Duration::from_millis(self.nice_time_ms)
    }

    pub fn ttr(&self) -> Option<Duration> {
        self.ttr_ms.map(Duration::from_millis)
    }

    pub fn lookup_freq(&self) -> Duration {
        Duration::from_millis(self.lookup_freq_ms)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_nodes == 0 {
            return Err(ConfigError::Invalid("max_nodes must be at least 1".into()));
        }
        if self.num_tries == 0 {
            return Err(ConfigError::Invalid("num_tries must be at least 1".into()));
        }
        if self.ttr_ms == Some(0) {
            return Err(ConfigError::Invalid("ttr_ms must be positive when set".into()));
        }
        Ok(())
    }
}

/// A node source and the backend it acquires from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub policy: NodeSourcePolicy,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// A fixed list of nodes.
    Static { nodes: Vec<StaticNodeConfig> },
    /// Peers of an overlay that lend nodes on request.
    Peer {
        peers: Vec<String>,
        #[serde(default = "default_request_timeout_ms")]
        request_timeout_ms: u64,
    },
    /// A cloud provisioning endpoint.
    Provisioner {
        endpoint: String,
        #[serde(default = "default_request_timeout_ms")]
        request_timeout_ms: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticNodeConfig {
    pub url: String,
    /// Defaults to the host part of `url`.
    #[serde(default)]
    pub host: Option<String>,
}

impl PoolConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: PoolConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.liveness.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "liveness.failure_threshold must be at least 1".into(),
            ));
        }
        if self.events.capacity == 0 {
            return Err(ConfigError::Invalid("events.capacity must be at least 1".into()));
        }

        let mut names = HashSet::new();
        for source in &self.sources {
            if !names.insert(source.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate source name: {}",
                    source.name
                )));
            }
            source
                .policy
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("source {}: {e}", source.name)))?;
            match &source.backend {
                BackendConfig::Static { nodes } if nodes.is_empty() => {
                    return Err(ConfigError::Invalid(format!(
                        "source {}: static backend needs at least one node",
                        source.name
                    )));
                }
                BackendConfig::Peer { peers, .. } if peers.is_empty() => {
                    return Err(ConfigError::Invalid(format!(
                        "source {}: peer backend needs at least one peer",
                        source.name
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn default_period_ms() -> u64 {
    10_000
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

fn default_failure_threshold() -> u32 {
    1
}

fn default_heartbeat_path() -> String {
    "/heartbeat".to_string()
}

fn default_event_capacity() -> usize {
    1024
}

fn default_nice_time_ms() -> u64 {
    10_000
}

fn default_lookup_freq_ms() -> u64 {
    1_000
}

fn default_num_tries() -> u32 {
    10
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

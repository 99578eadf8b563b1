//! Node configuration with TOML file support.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use idnet_network::RetryPolicy;
use idnet_types::NodeId;

use crate::NodeError;

/// Where queued tasks run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Every task runs in this process.
    Standalone,
    /// Tasks are delegated to connected worker processes.
    Coordinator,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicyKind {
    LeastOutstanding,
    RoundRobin,
}

/// Outbound retry schedule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Total ceiling, measured from the first attempt.
    #[serde(default = "default_max_elapsed_secs")]
    pub max_elapsed_secs: u64,
}

/// A peer as recorded on the ledger: key, address and optional proxy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub node_id: NodeId,
    /// Ed25519 public key, hex.
    pub public_key: String,
    pub address: String,
    #[serde(default)]
    pub proxy: Option<NodeId>,
}

/// Configuration for an idnet node.
///
/// Loaded from a TOML file via [`NodeConfig::from_toml_file`] or built
/// programmatically (e.g. for tests). Every field has a default.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_id")]
    pub node_id: NodeId,

    /// LMDB environment directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Hex-encoded 32-byte key seed. Created on first start when missing.
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Peer transport listen address.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_mode")]
    pub mode: ExecutionMode,

    /// Worker endpoint address (coordinator mode only).
    #[serde(default = "default_worker_rpc_addr")]
    pub worker_rpc_addr: String,

    #[serde(default = "default_scheduling_policy")]
    pub scheduling_policy: SchedulingPolicyKind,

    /// Payloads at or above this size are compressed.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Dedup window; must outlast the retry ceiling.
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,

    #[serde(default = "default_worker_call_timeout_secs")]
    pub worker_call_timeout_secs: u64,

    /// Log format: "human" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Log level filter, e.g. "info" or "info,idnet_network=debug".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Send an error response to the sender of an inbound message whose
    /// handler failed.
    #[serde(default)]
    pub notify_failures: bool,

    #[serde(default)]
    pub enable_metrics: bool,

    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,

    /// Known peers.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_node_id() -> NodeId {
    NodeId::new("node-1")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./idnet_data")
}

fn default_listen_addr() -> String {
    "0.0.0.0:7700".to_string()
}

fn default_mode() -> ExecutionMode {
    ExecutionMode::Standalone
}

fn default_worker_rpc_addr() -> String {
    "0.0.0.0:7801".to_string()
}

fn default_scheduling_policy() -> SchedulingPolicyKind {
    SchedulingPolicyKind::LeastOutstanding
}

fn default_compression_threshold() -> usize {
    4096
}

fn default_initial_interval_ms() -> u64 {
    500
}

fn default_max_interval_ms() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    1.5
}

fn default_max_elapsed_secs() -> u64 {
    15 * 60
}

fn default_dedup_ttl_secs() -> u64 {
    30 * 60
}

fn default_worker_call_timeout_secs() -> u64 {
    120
}

fn default_log_format() -> String {
    "human".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

// ── Impl ───────────────────────────────────────────────────────────────

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            multiplier: default_multiplier(),
            max_elapsed_secs: default_max_elapsed_secs(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(self.initial_interval_ms),
            max_interval: Duration::from_millis(self.max_interval_ms),
            multiplier: self.multiplier,
            max_elapsed: Duration::from_secs(self.max_elapsed_secs),
            ..RetryPolicy::default()
        }
    }
}

impl NodeConfig {
    pub fn from_toml_file(path: &str) -> Result<Self, NodeError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| NodeError::Config(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, NodeError> {
        toml::from_str(s).map_err(|e| NodeError::Config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String, NodeError> {
        toml::to_string_pretty(self).map_err(|e| NodeError::Config(e.to_string()))
    }

    /// Reject settings that would break delivery guarantees.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.node_id.is_empty() {
            return Err(NodeError::Config("node_id must not be empty".into()));
        }
        if self.dedup_ttl() <= self.retry.policy().max_elapsed {
            return Err(NodeError::Config(format!(
                "dedup_ttl_secs ({}) must exceed retry.max_elapsed_secs ({})",
                self.dedup_ttl_secs, self.retry.max_elapsed_secs
            )));
        }
        if self.retry.multiplier < 1.0 {
            return Err(NodeError::Config("retry.multiplier must be at least 1.0".into()));
        }
        if self.retry.initial_interval_ms == 0 {
            return Err(NodeError::Config("retry.initial_interval_ms must be positive".into()));
        }
        if self.worker_call_timeout_secs == 0 {
            return Err(NodeError::Config("worker_call_timeout_secs must be positive".into()));
        }
        self.log_format.parse::<crate::LogFormat>()?;
        Ok(())
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    pub fn worker_call_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_call_timeout_secs)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            data_dir: default_data_dir(),
            key_file: None,
            listen_addr: default_listen_addr(),
            mode: default_mode(),
            worker_rpc_addr: default_worker_rpc_addr(),
            scheduling_policy: default_scheduling_policy(),
            compression_threshold: default_compression_threshold(),
            retry: RetryConfig::default(),
            dedup_ttl_secs: default_dedup_ttl_secs(),
            worker_call_timeout_secs: default_worker_call_timeout_secs(),
            log_format: default_log_format(),
            log_level: default_log_level(),
            notify_failures: false,
            enable_metrics: false,
            metrics_addr: default_metrics_addr(),
            peers: Vec::new(),
        }
    }
}

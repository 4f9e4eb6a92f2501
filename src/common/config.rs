//! Configuration for meshsearch nodes
//!
//! Values come from an optional TOML file, then `MESHSEARCH_<SECTION>__<KEY>`
//! environment variables. The node binary applies CLI overrides last.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub membership: MembershipConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub directory: DirectoryConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            membership: MembershipConfig::default(),
            pool: PoolConfig::default(),
            query: QueryConfig::default(),
            directory: DirectoryConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// Identity this node registers under
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_server_address")]
    pub server_address: String,

    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,

    #[serde(default = "default_version")]
    pub version: String,
}

fn default_server_address() -> String {
    "127.0.0.1".to_string()
}
fn default_rpc_port() -> u16 {
    32191
}
fn default_version() -> String {
    crate::VERSION.to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            server_address: default_server_address(),
            rpc_port: default_rpc_port(),
            version: default_version(),
        }
    }
}

/// Liveness tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// Tick period
    #[serde(default = "default_membership_interval")]
    pub interval_ms: u64,

    /// A peer this far behind the reference heartbeat is considered gone
    #[serde(default = "default_max_heartbeat_lag")]
    pub max_heartbeat_lag_ms: u64,
}

fn default_membership_interval() -> u64 {
    1_000
}
fn default_max_heartbeat_lag() -> u64 {
    30_000
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_membership_interval(),
            max_heartbeat_lag_ms: default_max_heartbeat_lag(),
        }
    }
}

impl MembershipConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Per-peer connection pool limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_min_idle")]
    pub min_idle: usize,

    #[serde(default = "default_max_total")]
    pub max_total: usize,

    #[serde(default = "default_idle_eviction")]
    pub idle_eviction_secs: u64,

    /// How long a borrow may wait for a free slot
    #[serde(default = "default_borrow_timeout")]
    pub borrow_timeout_ms: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

fn default_min_idle() -> usize {
    1
}
fn default_max_total() -> usize {
    8
}
fn default_idle_eviction() -> u64 {
    300
}
fn default_borrow_timeout() -> u64 {
    10_000
}
fn default_connect_timeout() -> u64 {
    5_000
}
fn default_request_timeout() -> u64 {
    60_000
}
fn default_max_message_bytes() -> usize {
    128 * 1024 * 1024
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: default_min_idle(),
            max_total: default_max_total(),
            idle_eviction_secs: default_idle_eviction(),
            borrow_timeout_ms: default_borrow_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            request_timeout_ms: default_request_timeout(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl PoolConfig {
    pub fn idle_eviction(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_secs)
    }

    pub fn borrow_timeout(&self) -> Duration {
        Duration::from_millis(self.borrow_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Query fan-out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Concurrent shard requests per fan-out; unbounded when unset
    #[serde(default)]
    pub concurrency: Option<usize>,

    #[serde(default = "default_query_timeout")]
    pub timeout_ms: u64,
}

fn default_query_timeout() -> u64 {
    30_000
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            timeout_ms: default_query_timeout(),
        }
    }
}

impl QueryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Cluster directory storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./meshsearch-directory")
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Config {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("MESHSEARCH")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.node.server_address.is_empty() {
            return Err(crate::Error::InvalidConfig(
                "node.server_address cannot be empty".into(),
            ));
        }
        if self.pool.max_total == 0 {
            return Err(crate::Error::InvalidConfig(
                "pool.max_total must be at least 1".into(),
            ));
        }
        if self.pool.min_idle > self.pool.max_total {
            return Err(crate::Error::InvalidConfig(format!(
                "pool.min_idle ({}) exceeds pool.max_total ({})",
                self.pool.min_idle, self.pool.max_total
            )));
        }
        if self.membership.interval_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "membership.interval_ms must be positive".into(),
            ));
        }
        if self.query.concurrency == Some(0) {
            return Err(crate::Error::InvalidConfig(
                "query.concurrency must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

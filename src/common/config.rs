//! Configuration for netcoord components

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "NETCOORD_CONFIG";

/// Config file used when `NETCOORD_CONFIG` is unset
pub const DEFAULT_CONFIG_FILE: &str = "netcoord.toml";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name of this node
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Local datacenter
    #[serde(default = "default_datacenter")]
    pub datacenter: String,

    /// HTTP server config
    #[serde(default)]
    pub server: ServerConfig,

    /// Coalescer, validation and query tunables
    #[serde(default)]
    pub coordinate: CoordinateConfig,

    /// Remote datacenters reachable from this one
    #[serde(default)]
    pub datacenters: Vec<RemoteDatacenter>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_node_name() -> String {
    "node-1".to_string()
}
fn default_datacenter() -> String {
    "dc1".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// RocksDB path for coordinates (in-memory store when unset)
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8500))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: None,
        }
    }
}

/// Coordinate subsystem tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinateConfig {
    /// Interval between coalescer flushes to the store
    #[serde(default = "default_update_period")]
    pub update_period_ms: u64,

    /// Distinct (node, segment) keys the pending buffer may hold
    #[serde(default = "default_max_pending_updates")]
    pub max_pending_updates: usize,

    /// Required length of a coordinate vector
    #[serde(default = "default_dimensionality")]
    pub dimensionality: usize,

    /// Timeout for a single remote datacenter sub-query
    #[serde(default = "default_datacenter_timeout")]
    pub datacenter_timeout_ms: u64,

    /// Overall deadline for the cross-datacenter fan-out
    #[serde(default = "default_aggregate_timeout")]
    pub aggregate_timeout_ms: u64,

    /// Blocking-query wait when the caller gives none
    #[serde(default = "default_query_wait")]
    pub default_query_wait_ms: u64,

    /// Upper bound for blocking-query waits
    #[serde(default = "default_max_query_wait")]
    pub max_query_wait_ms: u64,
}

fn default_update_period() -> u64 {
    200
}
fn default_max_pending_updates() -> usize {
    640
}
fn default_dimensionality() -> usize {
    8
}
fn default_datacenter_timeout() -> u64 {
    1_000
}
fn default_aggregate_timeout() -> u64 {
    3_000
}
fn default_query_wait() -> u64 {
    300_000
}
fn default_max_query_wait() -> u64 {
    600_000
}

impl Default for CoordinateConfig {
    fn default() -> Self {
        Self {
            update_period_ms: default_update_period(),
            max_pending_updates: default_max_pending_updates(),
            dimensionality: default_dimensionality(),
            datacenter_timeout_ms: default_datacenter_timeout(),
            aggregate_timeout_ms: default_aggregate_timeout(),
            default_query_wait_ms: default_query_wait(),
            max_query_wait_ms: default_max_query_wait(),
        }
    }
}

impl CoordinateConfig {
    pub fn update_period(&self) -> Duration {
        Duration::from_millis(self.update_period_ms)
    }

    pub fn datacenter_timeout(&self) -> Duration {
        Duration::from_millis(self.datacenter_timeout_ms)
    }

    pub fn aggregate_timeout(&self) -> Duration {
        Duration::from_millis(self.aggregate_timeout_ms)
    }

    /// Clamp a requested blocking wait into the configured bounds.
    pub fn query_wait(&self, requested: Duration) -> Duration {
        let max = Duration::from_millis(self.max_query_wait_ms);
        if requested.is_zero() {
            Duration::from_millis(self.default_query_wait_ms).min(max)
        } else {
            requested.min(max)
        }
    }
}

/// A remote datacenter and the HTTP address of one of its servers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDatacenter {
    pub name: String,
    pub address: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            datacenter: default_datacenter(),
            server: ServerConfig::default(),
            coordinate: CoordinateConfig::default(),
            datacenters: Vec::new(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load from the file named by `NETCOORD_CONFIG` (optional) and
    /// `NETCOORD__*` environment variables.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("NETCOORD").separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(Error::InvalidConfig("node_name cannot be empty".into()));
        }
        if self.datacenter.is_empty() {
            return Err(Error::InvalidConfig("datacenter cannot be empty".into()));
        }
        let c = &self.coordinate;
        if c.update_period_ms == 0 {
            return Err(Error::InvalidConfig("update_period_ms must be > 0".into()));
        }
        if c.dimensionality == 0 {
            return Err(Error::InvalidConfig("dimensionality must be > 0".into()));
        }
        if c.max_pending_updates == 0 {
            return Err(Error::InvalidConfig("max_pending_updates must be > 0".into()));
        }
        if c.datacenter_timeout_ms == 0 || c.aggregate_timeout_ms == 0 {
            return Err(Error::InvalidConfig("fan-out timeouts must be > 0".into()));
        }
        if let Some(dc) = self
            .datacenters
            .iter()
            .find(|dc| dc.name.is_empty() || dc.name == self.datacenter)
        {
            return Err(Error::InvalidConfig(format!(
                "invalid remote datacenter name: {:?}",
                dc.name
            )));
        }
        Ok(())
    }
}

//! Configuration types for ReplKV
//!
//! A node is configured from an optional TOML file. Every field has a default
//! so an empty file (or no file at all) yields a runnable single node.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Write-ahead log file name inside the data directory
pub const WAL_FILE: &str = "wal.log";
/// Checkpoint side file name inside the data directory
pub const CHECKPOINT_FILE: &str = "checkpoint.txt";
/// Directory holding the persistent store
pub const DB_DIR: &str = "db";

/// Root configuration for a ReplKV node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::configuration(format!("{}: {e}", path.display())))
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::configuration(e.to_string()))
    }
}

/// Node identity and listener
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address the HTTP server binds to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Host name other nodes use to reach this one (usually `CNAME`)
    #[serde(default)]
    pub cname: Option<String>,
    /// Full base URL to advertise; overrides the one derived from `cname`
    #[serde(default)]
    pub advertise_addr: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            cname: None,
            advertise_addr: None,
        }
    }
}

impl NodeConfig {
    /// Base URL this node is known by in the cluster file
    ///
    /// `advertise_addr` wins; otherwise `http://{cname}:{port}` with the port
    /// taken from `listen`. Returns `None` when neither is set.
    pub fn self_address(&self) -> Option<String> {
        if let Some(addr) = &self.advertise_addr {
            return Some(addr.trim_end_matches('/').to_string());
        }
        let cname = self.cname.as_deref().filter(|c| !c.is_empty())?;
        let port = self
            .listen
            .rsplit_once(':')
            .map_or("8080", |(_, port)| port);
        Some(format!("http://{cname}:{port}"))
    }
}

/// Durable log, checkpoint and compaction settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding `wal.log`, `checkpoint.txt` and `db/`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// fsync every append before acknowledging it
    #[serde(default = "default_true")]
    pub sync_on_write: bool,
    #[serde(default = "default_compaction_interval_secs")]
    pub compaction_interval_secs: u64,
    /// Consecutive failed compaction cycles before the node stops
    #[serde(default = "default_max_compaction_failures")]
    pub max_compaction_failures: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            sync_on_write: true,
            compaction_interval_secs: default_compaction_interval_secs(),
            max_compaction_failures: default_max_compaction_failures(),
        }
    }
}

impl StorageConfig {
    /// Storage rooted at `data_dir` with every other field defaulted
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(WAL_FILE)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_dir.join(CHECKPOINT_FILE)
    }

    pub fn db_dir(&self) -> PathBuf {
        self.data_dir.join(DB_DIR)
    }

    pub fn compaction_interval(&self) -> Duration {
        Duration::from_secs(self.compaction_interval_secs.max(1))
    }
}

/// Static membership and health checking
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// File listing one peer base URL per line
    #[serde(default = "default_cluster_file")]
    pub cluster_file: PathBuf,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Timeout for health probes and replication calls
    #[serde(default = "default_peer_timeout_ms")]
    pub peer_timeout_ms: u64,
    /// Stop the node when a health check finds no live peer
    #[serde(default)]
    pub exit_on_isolation: bool,
    /// Run without peers when the cluster file does not exist
    #[serde(default)]
    pub allow_missing_cluster_file: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_file: default_cluster_file(),
            ping_interval_secs: default_ping_interval_secs(),
            peer_timeout_ms: default_peer_timeout_ms(),
            exit_on_isolation: false,
            allow_missing_cluster_file: false,
        }
    }
}

impl ClusterConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_true() -> bool {
    true
}

fn default_compaction_interval_secs() -> u64 {
    5
}

fn default_max_compaction_failures() -> u32 {
    3
}

fn default_cluster_file() -> PathBuf {
    PathBuf::from("cluster.txt")
}

fn default_ping_interval_secs() -> u64 {
    120
}

fn default_peer_timeout_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

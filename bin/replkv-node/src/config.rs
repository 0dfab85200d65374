//! Command line arguments
//!
//! Settings come from an optional TOML file; flags given on the command
//! line take precedence.

use clap::Parser;
use replkv_common::{Config, Result};
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(name = "replkv-node")]
#[command(about = "Replicated key-value store node")]
#[command(version)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, env = "REPLKV_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen address for the HTTP API
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Host name peers use to reach this node
    #[arg(long, env = "CNAME")]
    pub cname: Option<String>,

    /// Base URL to advertise to peers (overrides the one derived from CNAME)
    #[arg(long)]
    pub advertise_addr: Option<String>,

    /// Directory holding the log, checkpoint and store
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// File listing peer base URLs, one per line
    #[arg(long)]
    pub cluster_file: Option<PathBuf>,

    /// Skip fsync on every append
    #[arg(long, default_value_t = false)]
    pub no_sync: bool,

    /// Stop the node when no peer answers a health check
    #[arg(long, default_value_t = false)]
    pub exit_on_isolation: bool,

    /// Start without peers if the cluster file is missing
    #[arg(long, default_value_t = false)]
    pub allow_missing_cluster_file: bool,

    /// Log level
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Args {
    /// Load the configuration file, if any, and apply the command line on top
    pub fn resolve(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(listen) = self.listen {
            config.node.listen = listen;
        }
        if let Some(cname) = self.cname {
            config.node.cname = Some(cname);
        }
        if let Some(addr) = self.advertise_addr {
            config.node.advertise_addr = Some(addr);
        }
        if let Some(data_dir) = self.data_dir {
            config.storage.data_dir = data_dir;
        }
        if let Some(cluster_file) = self.cluster_file {
            config.cluster.cluster_file = cluster_file;
        }
        if self.no_sync {
            config.storage.sync_on_write = false;
        }
        if self.exit_on_isolation {
            config.cluster.exit_on_isolation = true;
        }
        if self.allow_missing_cluster_file {
            config.cluster.allow_missing_cluster_file = true;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        Ok(config)
    }
}

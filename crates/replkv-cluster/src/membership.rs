//! Static cluster membership with health probing
//!
//! The configured membership comes from a cluster file with one peer base
//! URL per line. The live set is the subset that answered the last round of
//! `GET /ping` probes.

use futures::future::join_all;
use parking_lot::RwLock;
use replkv_common::config::ClusterConfig;
use replkv_common::{Error, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Health check path served by every node
pub const PING_PATH: &str = "/ping";

/// Normalize a peer base URL for comparison
pub fn normalize_addr(addr: &str) -> String {
    addr.trim().trim_end_matches('/').to_string()
}

/// Parse cluster file content into the peer list, excluding `self_addr`
///
/// Blank lines and `#` comments are ignored and duplicates are dropped.
pub fn parse_cluster_file(content: &str, self_addr: Option<&str>) -> Vec<String> {
    let self_addr = self_addr.map(normalize_addr);
    let mut peers: Vec<String> = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let addr = normalize_addr(line);
        if self_addr.as_deref() == Some(addr.as_str()) || peers.contains(&addr) {
            continue;
        }
        peers.push(addr);
    }
    peers
}

pub(crate) fn peer_error(e: &reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout
    } else {
        Error::ConnectionFailed(e.to_string())
    }
}

pub(crate) fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::configuration(format!("failed to build HTTP client: {e}")))
}

/// Configured peers and the live subset
pub struct Membership {
    self_addr: Option<String>,
    configured: Vec<String>,
    live: RwLock<Vec<String>>,
    client: reqwest::Client,
}

impl Membership {
    /// Load the cluster file and probe every configured peer once
    pub async fn init(config: &ClusterConfig, self_addr: Option<String>) -> Result<Self> {
        let configured = Self::read_cluster_file(&config.cluster_file, self_addr.as_deref())?;
        info!(
            "Loaded {} peers from {}",
            configured.len(),
            config.cluster_file.display()
        );

        let membership = Self {
            self_addr: self_addr.map(|a| normalize_addr(&a)),
            configured,
            live: RwLock::new(Vec::new()),
            client: build_client(config.peer_timeout())?,
        };

        if !membership.ping().await && !membership.configured.is_empty() {
            warn!("No configured peer answered; starting without live peers");
        }
        Ok(membership)
    }

    /// Membership over a fixed peer list, all assumed live until the next ping
    pub fn from_peers(
        self_addr: Option<String>,
        peers: impl IntoIterator<Item = String>,
        timeout: Duration,
    ) -> Result<Self> {
        let self_addr = self_addr.map(|a| normalize_addr(&a));
        let mut configured: Vec<String> = Vec::new();
        for peer in peers {
            let peer = normalize_addr(&peer);
            if self_addr.as_deref() != Some(peer.as_str()) && !configured.contains(&peer) {
                configured.push(peer);
            }
        }

        Ok(Self {
            self_addr,
            live: RwLock::new(configured.clone()),
            configured,
            client: build_client(timeout)?,
        })
    }

    fn read_cluster_file(path: &Path, self_addr: Option<&str>) -> Result<Vec<String>> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!(
                "failed to read cluster file {}: {e}",
                path.display()
            ))
        })?;
        Ok(parse_cluster_file(&content, self_addr))
    }

    async fn probe(&self, peer: &str) -> Result<()> {
        let response = self
            .client
            .get(format!("{peer}{PING_PATH}"))
            .send()
            .await
            .map_err(|e| peer_error(&e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::ConnectionFailed(format!(
                "ping returned {}",
                response.status()
            )))
        }
    }

    /// Probe every configured peer and replace the live set with the responders
    ///
    /// Returns false when no peer is live afterwards.
    pub async fn ping(&self) -> bool {
        let results = join_all(self.configured.iter().map(|peer| self.probe(peer))).await;

        let mut responders = Vec::with_capacity(self.configured.len());
        for (peer, result) in self.configured.iter().zip(results) {
            match result {
                Ok(()) => responders.push(peer.clone()),
                Err(e) => debug!("Peer {} failed health check: {}", peer, e),
            }
        }

        let mut live = self.live.write();
        for peer in live.iter().filter(|p| !responders.contains(p)) {
            warn!("Dropping unreachable peer {}", peer);
        }
        for peer in responders.iter().filter(|p| !live.contains(p)) {
            info!("Peer {} is reachable", peer);
        }
        *live = responders;
        !live.is_empty()
    }

    /// Re-probe peers on a fixed interval until `shutdown` fires
    ///
    /// With `exit_on_isolation`, a round where no configured peer answers
    /// ends the loop with [`Error::Isolated`].
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        exit_on_isolation: bool,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!("Health check loop started (interval {:?})", interval);

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self.ping().await || self.configured.is_empty() {
                continue;
            }
            if exit_on_isolation {
                error!(
                    "None of {} configured peers answered, node is isolated",
                    self.configured.len()
                );
                return Err(Error::Isolated {
                    configured: self.configured.len(),
                });
            }
            warn!("None of {} configured peers answered", self.configured.len());
        }

        info!("Health check loop stopped");
        Ok(())
    }

    /// Snapshot of the live peer set
    pub fn peers(&self) -> Vec<String> {
        self.live.read().clone()
    }

    pub fn live_count(&self) -> usize {
        self.live.read().len()
    }

    pub fn configured(&self) -> &[String] {
        &self.configured
    }

    pub fn self_addr(&self) -> Option<&str> {
        self.self_addr.as_deref()
    }
}

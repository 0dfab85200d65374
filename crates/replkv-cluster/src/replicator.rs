//! Write replication
//!
//! Outbound, every accepted local write is POSTed to each live peer by its
//! own task; failures are logged and never affect the local write.
//! Inbound, an update is parsed, validated, appended to the local log under
//! a fresh local LSN and applied to the index. Updates are never forwarded.
//!
//! Retried deliveries are recognised by `(origin, remote LSN)` and applied
//! at most once.

use crate::membership::{Membership, build_client, peer_error};
use parking_lot::Mutex;
use replkv_common::{Error, LogEntry, Result};
use replkv_storage::StorageEngine;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Internal endpoint receiving replicated writes
pub const UPDATE_PATH: &str = "/internal/update";

/// Header carrying the sender's advertised base URL
pub const ORIGIN_HEADER: &str = "x-replkv-origin";

/// Remote LSNs remembered per origin
const DEDUPE_WINDOW: usize = 4096;

/// Body of a replicated write
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateRequest {
    pub update: String,
}

/// Outcome of applying a replicated write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteApply {
    /// Appended locally under `lsn`
    Applied { lsn: u64 },
    /// Already applied from the same origin
    Duplicate,
}

/// Delivery counts for one propagated write
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PropagationReport {
    pub delivered: usize,
    pub failed: usize,
}

/// In-flight deliveries of one write
///
/// Dropping the handle leaves the deliveries running.
#[must_use = "dropping a Propagation detaches it; call wait() to observe delivery"]
pub struct Propagation {
    handles: Vec<JoinHandle<bool>>,
}

impl Propagation {
    /// Number of peers the write was sent to
    pub fn peers(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every delivery to finish
    pub async fn wait(self) -> PropagationReport {
        let mut report = PropagationReport::default();
        for handle in self.handles {
            match handle.await {
                Ok(true) => report.delivered += 1,
                Ok(false) | Err(_) => report.failed += 1,
            }
        }
        report
    }
}

/// Replication statistics
#[derive(Clone, Copy, Debug, Default)]
pub struct ReplicationStats {
    pub sent: u64,
    pub failed: u64,
    pub received: u64,
    pub duplicates: u64,
    /// Received without an origin, so never checked for duplicates
    pub unattributed: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    failed: AtomicU64,
    received: AtomicU64,
    duplicates: AtomicU64,
    unattributed: AtomicU64,
}

/// Recently applied remote LSNs from one origin
#[derive(Default)]
struct OriginWindow {
    order: VecDeque<u64>,
    seen: HashSet<u64>,
}

impl OriginWindow {
    fn contains(&self, lsn: u64) -> bool {
        self.seen.contains(&lsn)
    }

    fn record(&mut self, lsn: u64) {
        if self.seen.insert(lsn) {
            self.order.push_back(lsn);
        }
        while self.order.len() > DEDUPE_WINDOW {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
    }
}

/// Broadcasts local writes and applies remote ones
pub struct Replicator {
    engine: Arc<StorageEngine>,
    membership: Arc<Membership>,
    client: reqwest::Client,
    origin: Option<String>,
    windows: Mutex<HashMap<String, OriginWindow>>,
    counters: Arc<Counters>,
    warned_unattributed: AtomicBool,
}

impl Replicator {
    pub fn new(
        engine: Arc<StorageEngine>,
        membership: Arc<Membership>,
        timeout: Duration,
    ) -> Result<Self> {
        let origin = membership.self_addr().map(ToString::to_string);
        Ok(Self {
            engine,
            membership,
            client: build_client(timeout)?,
            origin,
            windows: Mutex::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
            warned_unattributed: AtomicBool::new(false),
        })
    }

    /// Send `line` to every live peer without waiting for the result
    pub fn propagate(&self, line: &str) -> Propagation {
        let peers = self.membership.peers();
        let mut handles = Vec::with_capacity(peers.len());

        for peer in peers {
            let client = self.client.clone();
            let counters = Arc::clone(&self.counters);
            let origin = self.origin.clone();
            let body = UpdateRequest {
                update: line.to_string(),
            };

            handles.push(tokio::spawn(async move {
                match send_update(&client, &peer, origin.as_deref(), &body).await {
                    Ok(()) => {
                        counters.sent.fetch_add(1, Ordering::Relaxed);
                        debug!("Replicated {:?} to {}", body.update, peer);
                        true
                    }
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!("Failed to replicate to {}: {}", peer, e);
                        false
                    }
                }
            }));
        }

        Propagation { handles }
    }

    /// Apply a write received from `origin`
    ///
    /// Without an origin the update cannot be recognised on retry and is
    /// always applied; such updates are counted as unattributed.
    ///
    /// The dedupe windows stay locked across the append and its fsync, so
    /// inbound updates are applied one at a time.
    pub fn receive_remote(&self, origin: Option<&str>, line: &str) -> Result<RemoteApply> {
        let entry = LogEntry::parse(line)?;
        entry.op.validate()?;
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        if origin.is_none() {
            self.counters.unattributed.fetch_add(1, Ordering::Relaxed);
            if !self.warned_unattributed.swap(true, Ordering::Relaxed) {
                warn!(
                    "Receiving updates without {}; retried deliveries will be applied again",
                    ORIGIN_HEADER
                );
            }
        }

        let mut windows = self.windows.lock();
        if let Some(origin) = origin
            && windows.get(origin).is_some_and(|w| w.contains(entry.lsn))
        {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!("Ignoring duplicate update {} from {}", entry.lsn, origin);
            return Ok(RemoteApply::Duplicate);
        }

        let appended = self.engine.apply(&entry.op)?;
        if let Some(origin) = origin {
            windows
                .entry(origin.to_string())
                .or_default()
                .record(entry.lsn);
        }

        debug!(
            "Applied remote update {} from {} as LSN {}",
            entry.lsn,
            origin.unwrap_or("unknown origin"),
            appended.lsn
        );
        Ok(RemoteApply::Applied { lsn: appended.lsn })
    }

    pub fn stats(&self) -> ReplicationStats {
        ReplicationStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            unattributed: self.counters.unattributed.load(Ordering::Relaxed),
        }
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }
}

async fn send_update(
    client: &reqwest::Client,
    peer: &str,
    origin: Option<&str>,
    body: &UpdateRequest,
) -> Result<()> {
    let mut request = client.post(format!("{peer}{UPDATE_PATH}")).json(body);
    if let Some(origin) = origin {
        request = request.header(ORIGIN_HEADER, origin);
    }
    let response = request
        .send()
        .await
        .map_err(|e| peer_error(&e))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(Error::ConnectionFailed(format!(
            "peer returned status {status}: {body}"
        )));
    }
    Ok(())
}

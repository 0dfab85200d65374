//! Node metrics for Prometheus
//!
//! Request counters are kept here; storage, compaction and replication
//! figures are read from their owners at export time.

use crate::service::KvService;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// API operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiOperation {
    Get,
    Set,
    Delete,
    Ping,
    InternalUpdate,
}

impl ApiOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Delete => "delete",
            Self::Ping => "ping",
            Self::InternalUpdate => "internal_update",
        }
    }

    const ALL: [Self; 5] = [
        Self::Get,
        Self::Set,
        Self::Delete,
        Self::Ping,
        Self::InternalUpdate,
    ];
}

pub struct NodeMetrics {
    start_time: Instant,
    requests: [AtomicU64; 5],
    validation_rejections: AtomicU64,
    internal_errors: AtomicU64,
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            requests: Default::default(),
            validation_rejections: AtomicU64::new(0),
            internal_errors: AtomicU64::new(0),
        }
    }

    pub fn record_request(&self, op: ApiOperation) {
        self.requests[op as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.validation_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_internal_error(&self) {
        self.internal_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests(&self, op: ApiOperation) -> u64 {
        self.requests[op as usize].load(Ordering::Relaxed)
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self, service: &KvService) -> String {
        let mut output = String::with_capacity(4 * 1024);

        metric(
            &mut output,
            "replkv_uptime_seconds",
            "counter",
            "Node uptime in seconds",
            self.start_time.elapsed().as_secs(),
        );

        let _ = writeln!(output, "# HELP replkv_requests_total API requests by operation");
        let _ = writeln!(output, "# TYPE replkv_requests_total counter");
        for op in ApiOperation::ALL {
            let _ = writeln!(
                output,
                "replkv_requests_total{{operation=\"{}\"}} {}",
                op.as_str(),
                self.requests(op)
            );
        }

        metric(
            &mut output,
            "replkv_validation_rejections_total",
            "counter",
            "Requests rejected by validation",
            self.validation_rejections.load(Ordering::Relaxed),
        );
        metric(
            &mut output,
            "replkv_internal_errors_total",
            "counter",
            "Requests failed with an internal error",
            self.internal_errors.load(Ordering::Relaxed),
        );

        let engine = service.engine();
        metric(
            &mut output,
            "replkv_wal_lsn",
            "gauge",
            "Last assigned log sequence number",
            engine.current_lsn(),
        );
        metric(
            &mut output,
            "replkv_wal_checkpoint",
            "gauge",
            "Log entries folded into the persistent store",
            engine.checkpoint(),
        );
        metric(
            &mut output,
            "replkv_keys",
            "gauge",
            "Keys held in the index",
            engine.len() as u64,
        );

        let compaction = engine.compactor().stats();
        metric(
            &mut output,
            "replkv_compaction_cycles_total",
            "counter",
            "Completed compaction cycles",
            compaction.cycles,
        );
        metric(
            &mut output,
            "replkv_compaction_failures_total",
            "counter",
            "Failed compaction cycles",
            compaction.failures,
        );
        metric(
            &mut output,
            "replkv_compaction_entries_total",
            "counter",
            "Log entries folded by compaction",
            compaction.entries_folded,
        );

        let replicator = service.replicator();
        metric(
            &mut output,
            "replkv_live_peers",
            "gauge",
            "Peers that answered the last health check",
            replicator.membership().live_count() as u64,
        );
        let replication = replicator.stats();
        metric(
            &mut output,
            "replkv_replication_sent_total",
            "counter",
            "Updates delivered to peers",
            replication.sent,
        );
        metric(
            &mut output,
            "replkv_replication_failed_total",
            "counter",
            "Updates that failed to reach a peer",
            replication.failed,
        );
        metric(
            &mut output,
            "replkv_replication_received_total",
            "counter",
            "Valid updates received from peers",
            replication.received,
        );
        metric(
            &mut output,
            "replkv_replication_duplicates_total",
            "counter",
            "Received updates ignored as duplicates",
            replication.duplicates,
        );
        metric(
            &mut output,
            "replkv_replication_unattributed_total",
            "counter",
            "Received updates without an origin header",
            replication.unattributed,
        );

        output
    }
}

fn metric(output: &mut String, name: &str, kind: &str, help: &str, value: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {kind}");
    let _ = writeln!(output, "{name} {value}");
}

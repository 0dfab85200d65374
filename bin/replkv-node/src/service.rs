//! Key-value service
//!
//! The single entry point the HTTP layer uses. Local writes are validated,
//! made durable, applied to the index and then broadcast to peers.

use crate::supervisor::{FailureReporter, NodeFailure};
use replkv_cluster::{Propagation, RemoteApply, Replicator};
use replkv_common::{Error, Operation, Result};
use replkv_storage::StorageEngine;
use std::sync::Arc;
use tracing::debug;

/// An accepted local write
pub struct Written {
    pub lsn: u64,
    /// Deliveries to peers, still in flight
    pub propagation: Propagation,
}

pub struct KvService {
    engine: Arc<StorageEngine>,
    replicator: Arc<Replicator>,
    failures: FailureReporter,
}

impl KvService {
    pub fn new(
        engine: Arc<StorageEngine>,
        replicator: Arc<Replicator>,
        failures: FailureReporter,
    ) -> Self {
        Self {
            engine,
            replicator,
            failures,
        }
    }

    pub fn write(&self, key: &str, value: &str) -> Result<Written> {
        self.submit(Operation::set(key, value))
    }

    pub fn delete(&self, key: &str) -> Result<Written> {
        self.submit(Operation::delete(key))
    }

    pub fn read(&self, key: &str) -> Option<String> {
        self.engine.get(key)
    }

    /// Apply a write replicated from `origin`
    pub fn receive_remote(&self, origin: Option<&str>, line: &str) -> Result<RemoteApply> {
        self.replicator
            .receive_remote(origin, line)
            .inspect_err(|e| self.report_if_fatal(e))
    }

    fn submit(&self, op: Operation) -> Result<Written> {
        op.validate()?;

        let appended = self
            .engine
            .apply(&op)
            .inspect_err(|e| self.report_if_fatal(e))?;
        debug!("Accepted {} {} as LSN {}", op.kind(), op.key(), appended.lsn);

        Ok(Written {
            lsn: appended.lsn,
            propagation: self.replicator.propagate(&appended.line),
        })
    }

    fn report_if_fatal(&self, e: &Error) {
        if !e.is_client_error() {
            self.failures.report(NodeFailure::Wal(e.to_string()));
        }
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    pub fn replicator(&self) -> &Arc<Replicator> {
        &self.replicator
    }
}

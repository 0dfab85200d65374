//! Background compaction
//!
//! Each cycle folds the log entries past the checkpoint into the persistent
//! store and then advances the checkpoint:
//!
//! 1. `c = checkpoint`
//! 2. `lines = scan_from(c + 1)`
//! 3. `apply_batch(lines, c + lines.len())`
//! 4. `set_checkpoint(c + lines.len())`
//!
//! The store commits its own `applied_through` marker in step 3, which lets
//! recovery repair a crash between steps 3 and 4.

use crate::store::PersistentStore;
use crate::wal::Wal;
use parking_lot::Mutex;
use replkv_common::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of a cycle that folded at least one entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompactionOutcome {
    /// First log position folded
    pub from: u64,
    pub applied: usize,
    pub skipped: usize,
    /// Checkpoint after the cycle
    pub checkpoint: u64,
}

/// Compaction statistics
#[derive(Clone, Copy, Debug, Default)]
pub struct CompactionStats {
    pub cycles: u64,
    pub failures: u64,
    pub entries_folded: u64,
}

/// Folds the log into the persistent store
pub struct Compactor {
    wal: Arc<Wal>,
    store: Arc<PersistentStore>,
    /// Serializes cycles
    compaction_lock: Mutex<()>,
    cycles: AtomicU64,
    failures: AtomicU64,
    entries_folded: AtomicU64,
}

impl Compactor {
    pub fn new(wal: Arc<Wal>, store: Arc<PersistentStore>) -> Self {
        Self {
            wal,
            store,
            compaction_lock: Mutex::new(()),
            cycles: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            entries_folded: AtomicU64::new(0),
        }
    }

    /// Run one compaction cycle
    ///
    /// Returns `None` when there was nothing to fold. A failed cycle leaves
    /// the checkpoint untouched so the next one retries the same range.
    pub fn run_cycle(&self) -> Result<Option<CompactionOutcome>> {
        let _lock = self.compaction_lock.lock();

        let result = self.fold();
        match &result {
            Ok(_) => self.cycles.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failures.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    fn fold(&self) -> Result<Option<CompactionOutcome>> {
        let checkpoint = self.wal.checkpoint();
        let lines = self.wal.scan_from(checkpoint + 1)?;
        if lines.is_empty() {
            return Ok(None);
        }

        let target = checkpoint + lines.len() as u64;
        let batch = self.store.apply_batch(&lines, target)?;
        self.wal.set_checkpoint(target)?;

        self.entries_folded
            .fetch_add(lines.len() as u64, Ordering::Relaxed);
        debug!(
            "Compacted entries {}..={} ({} skipped)",
            checkpoint + 1,
            target,
            batch.skipped
        );

        Ok(Some(CompactionOutcome {
            from: checkpoint + 1,
            applied: batch.applied,
            skipped: batch.skipped,
            checkpoint: target,
        }))
    }

    pub fn stats(&self) -> CompactionStats {
        CompactionStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            entries_folded: self.entries_folded.load(Ordering::Relaxed),
        }
    }

    async fn run_cycle_blocking(self: &Arc<Self>) -> Result<Option<CompactionOutcome>> {
        let compactor = Arc::clone(self);
        tokio::task::spawn_blocking(move || compactor.run_cycle())
            .await
            .map_err(|e| Error::internal(format!("compaction task failed: {e}")))?
    }

    /// Compact on a fixed interval until `shutdown` fires
    ///
    /// Returns the last error once `max_failures` cycles in a row have failed.
    /// On shutdown one final cycle is attempted.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        max_failures: u32,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!("Compaction loop started (interval {:?})", interval);

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        let mut consecutive_failures = 0u32;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.run_cycle_blocking().await {
                Ok(_) => consecutive_failures = 0,
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= max_failures.max(1) {
                        error!(
                            "Compaction failed {} times in a row, giving up: {}",
                            consecutive_failures, e
                        );
                        return Err(e);
                    }
                    warn!(
                        "Compaction cycle failed ({}/{}): {}",
                        consecutive_failures, max_failures, e
                    );
                }
            }
        }

        match self.run_cycle_blocking().await {
            Ok(Some(outcome)) => info!(
                "Final compaction folded through checkpoint {}",
                outcome.checkpoint
            ),
            Ok(None) => {}
            Err(e) => warn!("Final compaction failed: {}", e),
        }
        info!("Compaction loop stopped");
        Ok(())
    }
}

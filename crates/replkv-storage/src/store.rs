//! Persistent key-value store backed by redb.
//!
//! Holds the compacted state of the log. Each compaction batch is applied in
//! one write transaction together with the `applied_through` marker, so the
//! store always knows exactly which log prefix it contains.

use redb::{Database, ReadableTable, TableDefinition};
use replkv_common::{Error, LogEntry, Operation};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Redb file name inside the store directory
pub const DB_FILE: &str = "data.redb";

/// Key to value pairs
pub const KV: TableDefinition<&str, &str> = TableDefinition::new("kv");
/// Store bookkeeping
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const APPLIED_THROUGH: &str = "applied_through";

/// Error type for persistent store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Self::Storage(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Counts from one applied batch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub applied: usize,
    pub skipped: usize,
}

/// Persistent store backed by redb.
pub struct PersistentStore {
    db: Database,
    path: PathBuf,
}

impl PersistentStore {
    /// Open (or create) the store inside `dir`
    pub fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(DB_FILE);
        let db = Database::create(&path)?;

        // Create tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(KV)?;
            let _t = write_txn.open_table(META)?;
        }
        write_txn.commit()?;

        Ok(Self { db, path })
    }

    /// Visit every stored pair in key order, returning how many were seen
    pub fn scan(&self, mut visit: impl FnMut(&str, &str)) -> StoreResult<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(KV)?;
        let mut count = 0;
        for entry in table.iter()? {
            let (key, value) = entry?;
            visit(key.value(), value.value());
            count += 1;
        }
        Ok(count)
    }

    pub fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(KV)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    /// Apply log lines and record `applied_through` in a single transaction
    ///
    /// Malformed lines are logged and skipped; they still count as consumed
    /// from the log.
    pub fn apply_batch(&self, lines: &[String], applied_through: u64) -> StoreResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();

        let write_txn = self.db.begin_write()?;
        {
            let mut kv = write_txn.open_table(KV)?;
            for line in lines {
                let entry = match LogEntry::parse(line) {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("Skipping WAL line {:?}: {}", line, e);
                        outcome.skipped += 1;
                        continue;
                    }
                };
                match &entry.op {
                    Operation::Set { key, value } => {
                        kv.insert(key.as_str(), value.as_str())?;
                    }
                    Operation::Delete { key } => {
                        kv.remove(key.as_str())?;
                    }
                }
                outcome.applied += 1;
            }

            let mut meta = write_txn.open_table(META)?;
            meta.insert(APPLIED_THROUGH, applied_through)?;
        }
        write_txn.commit()?;

        debug!(
            "Applied batch through {}: {} applied, {} skipped",
            applied_through, outcome.applied, outcome.skipped
        );
        Ok(outcome)
    }

    /// Log position covered by the last committed batch
    pub fn applied_through(&self) -> StoreResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(META)?;
        Ok(table.get(APPLIED_THROUGH)?.map_or(0, |v| v.value()))
    }

    /// Close the database, releasing its file lock
    pub fn close(self) {
        drop(self.db);
        info!("Closed store {}", self.path.display());
    }
}

//! Storage engine
//!
//! Owns the log, the index and the persistent store. Writes go
//! WAL -> index; compaction later folds the WAL into the store. On open the
//! index is rebuilt from the store and then from the log past the checkpoint.

use crate::compactor::Compactor;
use crate::index::MemIndex;
use crate::store::PersistentStore;
use crate::wal::{Appended, Wal, WalConfig};
use parking_lot::Mutex;
use replkv_common::config::StorageConfig;
use replkv_common::{Error, LogEntry, Operation, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// Log, index and store behind one write path
pub struct StorageEngine {
    wal: Arc<Wal>,
    index: Arc<MemIndex>,
    store: Arc<PersistentStore>,
    compactor: Arc<Compactor>,
    /// Keeps index application in LSN order
    write_lock: Mutex<()>,
}

impl StorageEngine {
    /// Open the engine and recover the index
    pub fn open(config: &StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            Error::Storage(format!(
                "failed to create data dir {}: {e}",
                config.data_dir.display()
            ))
        })?;

        let wal = Arc::new(Wal::open(
            config.wal_path(),
            config.checkpoint_path(),
            WalConfig {
                sync_on_write: config.sync_on_write,
            },
        )?);
        let store = Arc::new(PersistentStore::open(config.db_dir())?);

        Self::reconcile_checkpoint(&wal, &store)?;

        let index = Arc::new(MemIndex::new());
        let stored = store.scan(|key, value| index.set(key, value))?;

        let pending = wal.scan_from(wal.checkpoint() + 1)?;
        let mut replayed = 0usize;
        for line in &pending {
            match LogEntry::parse(line) {
                Ok(entry) => {
                    index.apply(&entry.op);
                    replayed += 1;
                }
                Err(e) => warn!("Skipping WAL line {:?} during recovery: {}", line, e),
            }
        }

        info!(
            "Recovered {} keys from store and replayed {} WAL entries (LSN {}, checkpoint {})",
            stored,
            replayed,
            wal.current_lsn(),
            wal.checkpoint()
        );

        let compactor = Arc::new(Compactor::new(Arc::clone(&wal), Arc::clone(&store)));
        Ok(Self {
            wal,
            index,
            store,
            compactor,
            write_lock: Mutex::new(()),
        })
    }

    /// Align the checkpoint with the prefix the store says it holds
    fn reconcile_checkpoint(wal: &Wal, store: &PersistentStore) -> Result<()> {
        let applied = store.applied_through()?;
        let checkpoint = wal.checkpoint();
        if applied == checkpoint {
            return Ok(());
        }
        if applied > wal.current_lsn() {
            return Err(Error::corruption(format!(
                "store has applied through {applied} but the log ends at {}",
                wal.current_lsn()
            )));
        }

        warn!(
            "Checkpoint {} disagrees with store marker {}, using the store marker",
            checkpoint, applied
        );
        wal.restore_checkpoint(applied)
    }

    /// Append an operation to the log and apply it to the index
    ///
    /// The index is untouched when the append fails.
    pub fn apply(&self, op: &Operation) -> Result<Appended> {
        let _guard = self.write_lock.lock();
        let appended = self.wal.append(op)?;
        self.index.apply(op);
        Ok(appended)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.index.get(key)
    }

    pub fn compactor(&self) -> Arc<Compactor> {
        Arc::clone(&self.compactor)
    }

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    pub fn store(&self) -> &Arc<PersistentStore> {
        &self.store
    }

    pub fn current_lsn(&self) -> u64 {
        self.wal.current_lsn()
    }

    pub fn checkpoint(&self) -> u64 {
        self.wal.checkpoint()
    }

    /// Number of keys in the index
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Release the store once no other component holds it
    ///
    /// Every committed write is already in the log, so a store that is still
    /// shared is left to close when its last handle drops.
    pub fn close(self) {
        let Self {
            store, compactor, ..
        } = self;
        drop(compactor);
        match Arc::try_unwrap(store) {
            Ok(store) => store.close(),
            Err(_) => warn!("Store still in use at shutdown, closing with its last handle"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> StorageConfig {
        StorageConfig {
            sync_on_write: false,
            ..StorageConfig::with_data_dir(dir)
        }
    }

    #[test]
    fn test_engine_read_your_writes() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open(&test_config(dir.path())).unwrap();

        let appended = engine.apply(&Operation::set("a", "1")).unwrap();
        assert_eq!(appended.lsn, 1);
        assert_eq!(engine.get("a").as_deref(), Some("1"));

        engine.apply(&Operation::delete("a")).unwrap();
        assert_eq!(engine.get("a"), None);
        assert_eq!(engine.current_lsn(), 2);
    }

    #[test]
    fn test_engine_restart_replays_uncompacted_entries() {
        let dir = tempdir().unwrap();
        {
            let engine = StorageEngine::open(&test_config(dir.path())).unwrap();
            engine.apply(&Operation::set("a", "1")).unwrap();
            engine.apply(&Operation::set("b", "2")).unwrap();
            engine.apply(&Operation::delete("a")).unwrap();
        }

        let engine = StorageEngine::open(&test_config(dir.path())).unwrap();
        assert_eq!(engine.checkpoint(), 0);
        assert_eq!(engine.get("a"), None);
        assert_eq!(engine.get("b").as_deref(), Some("2"));
        assert_eq!(engine.apply(&Operation::set("c", "3")).unwrap().lsn, 4);
    }

    #[test]
    fn test_engine_restart_after_partial_compaction() {
        let dir = tempdir().unwrap();
        {
            let engine = StorageEngine::open(&test_config(dir.path())).unwrap();
            engine.apply(&Operation::set("a", "1")).unwrap();
            engine.apply(&Operation::set("b", "1")).unwrap();
            engine.compactor().run_cycle().unwrap();
            engine.apply(&Operation::set("b", "2")).unwrap();
            engine.apply(&Operation::set("c", "3")).unwrap();
        }

        let engine = StorageEngine::open(&test_config(dir.path())).unwrap();
        assert_eq!(engine.checkpoint(), 2);
        assert_eq!(engine.get("a").as_deref(), Some("1"));
        assert_eq!(engine.get("b").as_deref(), Some("2"));
        assert_eq!(engine.get("c").as_deref(), Some("3"));
        assert_eq!(engine.len(), 3);
    }

    #[test]
    fn test_engine_reconciles_crash_between_batch_and_checkpoint() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        {
            let engine = StorageEngine::open(&config).unwrap();
            engine.apply(&Operation::set("a", "1")).unwrap();
            engine.apply(&Operation::set("b", "2")).unwrap();

            // Batch committed, checkpoint write lost
            let lines = engine.wal().scan_from(1).unwrap();
            engine.store().apply_batch(&lines, 2).unwrap();
            assert_eq!(engine.checkpoint(), 0);
        }

        let engine = StorageEngine::open(&config).unwrap();
        assert_eq!(engine.checkpoint(), 2);
        assert_eq!(engine.get("a").as_deref(), Some("1"));
        assert_eq!(engine.compactor().run_cycle().unwrap(), None);
    }

    #[test]
    fn test_engine_compaction_runs_alongside_writers() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let engine = StorageEngine::open(&config).unwrap();
        let compactor = engine.compactor();
        let writers_done = AtomicBool::new(false);

        std::thread::scope(|s| {
            let writers: Vec<_> = (0..4)
                .map(|w| {
                    let engine = &engine;
                    s.spawn(move || {
                        for i in 0..250 {
                            let key = format!("w{w}-k{i}");
                            engine.apply(&Operation::set(key.clone(), i.to_string())).unwrap();
                            assert_eq!(engine.get(&key), Some(i.to_string()));
                        }
                    })
                })
                .collect();
            s.spawn(|| {
                while !writers_done.load(Ordering::SeqCst) {
                    compactor.run_cycle().unwrap();
                }
            });
            for writer in writers {
                writer.join().unwrap();
            }
            writers_done.store(true, Ordering::SeqCst);
        });

        compactor.run_cycle().unwrap();
        assert_eq!(engine.current_lsn(), 1000);
        assert_eq!(engine.checkpoint(), 1000);
        drop(compactor);
        engine.close();

        let engine = StorageEngine::open(&config).unwrap();
        assert_eq!(engine.checkpoint(), 1000);
        assert_eq!(engine.len(), 1000);
        assert_eq!(engine.get("w0-k0").as_deref(), Some("0"));
        assert_eq!(engine.get("w3-k249").as_deref(), Some("249"));
    }

    #[test]
    fn test_engine_survives_undecodable_log_line() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::write(
            config.wal_path(),
            b"1,SET,a,1\n2,SET,b,\xff\xfe\n3,SET,c,3\n",
        )
        .unwrap();

        {
            let engine = StorageEngine::open(&config).unwrap();
            assert_eq!(engine.get("c").as_deref(), Some("3"));
            let outcome = engine.compactor().run_cycle().unwrap().unwrap();
            assert_eq!(outcome.checkpoint, 3);
            assert_eq!(engine.apply(&Operation::set("d", "4")).unwrap().lsn, 4);
        }

        let engine = StorageEngine::open(&config).unwrap();
        assert_eq!(engine.checkpoint(), 3);
        assert_eq!(engine.get("a").as_deref(), Some("1"));
        assert_eq!(engine.get("c").as_deref(), Some("3"));
        assert_eq!(engine.get("d").as_deref(), Some("4"));
    }

    #[test]
    fn test_engine_close_releases_store() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());

        let engine = StorageEngine::open(&config).unwrap();
        engine.apply(&Operation::set("a", "1")).unwrap();
        engine.compactor().run_cycle().unwrap();
        engine.close();

        let store = PersistentStore::open(config.db_dir()).unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
        assert_eq!(store.applied_through().unwrap(), 1);
    }

    #[test]
    fn test_engine_rejects_store_ahead_of_log() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        {
            let store = PersistentStore::open(config.db_dir()).unwrap();
            store.apply_batch(&["1,SET,a,1".to_string()], 1).unwrap();
        }

        let err = StorageEngine::open(&config).err().unwrap();
        assert!(matches!(err, Error::Corruption(_)));
    }
}

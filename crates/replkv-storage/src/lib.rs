//! ReplKV Storage - Durable log and local state
//!
//! This crate provides:
//! - An append-only text write-ahead log with sequential LSNs and a
//!   persisted checkpoint
//! - The in-memory index serving reads
//! - A redb-backed persistent store
//! - The background compactor folding the log into the store
//! - `StorageEngine`, which composes the above and recovers on open

pub mod compactor;
pub mod engine;
pub mod index;
pub mod store;
pub mod wal;

pub use compactor::{CompactionOutcome, CompactionStats, Compactor};
pub use engine::StorageEngine;
pub use index::MemIndex;
pub use store::{BatchOutcome, PersistentStore, StoreError, StoreResult};
pub use wal::{Appended, Wal, WalConfig};

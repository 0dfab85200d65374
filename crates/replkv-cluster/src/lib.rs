//! ReplKV Cluster - Membership and replication
//!
//! Membership tracks which configured peers answer health probes.
//! The replicator broadcasts every local write to those peers and applies
//! writes received from them exactly once.

pub mod membership;
pub mod replicator;

pub use membership::Membership;
pub use replicator::{
    ORIGIN_HEADER, Propagation, PropagationReport, RemoteApply, ReplicationStats, Replicator,
    UPDATE_PATH, UpdateRequest,
};

//! ReplKV Node - HTTP front end and process wiring
//!
//! This crate provides:
//! - The `KvService` facade over storage and replication
//! - The axum router serving `/get`, `/set`, `/delete`, `/ping`,
//!   `/internal/update` and `/metrics`
//! - Prometheus metrics
//! - The supervisor that owns background loops and stops the node on
//!   fatal failures

pub mod api;
pub mod config;
pub mod metrics;
pub mod node;
pub mod service;
pub mod supervisor;

pub use config::Args;
pub use node::Node;
pub use service::KvService;
pub use supervisor::{FailureReporter, NodeFailure, Supervisor};

//! ReplKV Common - Shared types and utilities
//!
//! This crate provides the log entry format, request validation rules,
//! error definitions, and configuration types used by every ReplKV
//! component.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

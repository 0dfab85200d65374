//! Core types for ReplKV
//!
//! A log entry is stored and replicated as one text line:
//!
//! ```text
//! <lsn>,SET,<key>,<value>
//! <lsn>,DELETE,<key>
//! ```
//!
//! Only the first three commas separate fields, so a value may contain
//! commas. Keys may not.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Maximum key length in bytes accepted by the API
pub const MAX_KEY_LEN: usize = 50;

/// Maximum value length in bytes accepted by the API
pub const MAX_VALUE_LEN: usize = 100;

const SET_TAG: &str = "SET";
const DELETE_TAG: &str = "DELETE";

/// Operation kind recorded in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Set,
    Delete,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Set => SET_TAG,
            Self::Delete => DELETE_TAG,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single mutation of the key space
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Set { key: String, value: String },
    Delete { key: String },
}

impl Operation {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }

    pub fn kind(&self) -> OpKind {
        match self {
            Self::Set { .. } => OpKind::Set,
            Self::Delete { .. } => OpKind::Delete,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. } | Self::Delete { key } => key,
        }
    }

    /// Check the key (and value, for SET) against the API limits
    pub fn validate(&self) -> Result<()> {
        validate_key(self.key())?;
        if let Self::Set { value, .. } = self {
            validate_value(value)?;
        }
        Ok(())
    }
}

/// An immutable, sequenced log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Log Sequence Number assigned by the node that wrote the line
    pub lsn: u64,
    pub op: Operation,
}

impl LogEntry {
    pub fn new(lsn: u64, op: Operation) -> Self {
        Self { lsn, op }
    }

    /// Parse a log line, tolerating a trailing line terminator
    pub fn parse(line: &str) -> Result<Self> {
        line.parse()
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.op {
            Operation::Set { key, value } => write!(f, "{},{SET_TAG},{key},{value}", self.lsn),
            Operation::Delete { key } => write!(f, "{},{DELETE_TAG},{key}", self.lsn),
        }
    }
}

impl FromStr for LogEntry {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\n', '\r']);
        let mut fields = line.splitn(4, ',');

        let lsn_field = fields.next().unwrap_or_default();
        let lsn = lsn_field
            .parse::<u64>()
            .map_err(|_| Error::malformed(format!("invalid LSN {lsn_field:?}")))?;
        let tag = fields
            .next()
            .ok_or_else(|| Error::malformed("missing operation"))?;
        let key = fields
            .next()
            .ok_or_else(|| Error::malformed("missing key"))?
            .to_string();
        let value = fields.next();

        let op = match (tag, value) {
            (SET_TAG, Some(value)) => Operation::Set {
                key,
                value: value.to_string(),
            },
            (SET_TAG, None) => return Err(Error::malformed("SET without a value")),
            (DELETE_TAG, None) => Operation::Delete { key },
            (DELETE_TAG, Some(_)) => return Err(Error::malformed("DELETE with a value")),
            (other, _) => return Err(Error::malformed(format!("unknown operation {other:?}"))),
        };

        Ok(Self { lsn, op })
    }
}

/// Validate a key against the API contract
///
/// Keys must be non-empty, at most [`MAX_KEY_LEN`] bytes, and may not contain
/// the field separator or line terminators of the log format.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::validation("Key is empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(Error::validation("Key length too long"));
    }
    if key.contains([',', '\n', '\r']) {
        return Err(Error::validation("Key contains a reserved character"));
    }
    Ok(())
}

/// Validate a value against the API contract
///
/// Empty values are rejected: the read path reports a missing key and an
/// empty value identically, so storing one would be indistinguishable from
/// a delete.
pub fn validate_value(value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::validation("Value is empty"));
    }
    if value.len() > MAX_VALUE_LEN {
        return Err(Error::validation("Value length too long"));
    }
    if value.contains(['\n', '\r']) {
        return Err(Error::validation("Value contains a reserved character"));
    }
    Ok(())
}

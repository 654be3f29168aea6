//! Error types for leaseq.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("timed out after {timeout:?} waiting for lock on {resource}")]
    LockTimeout { resource: String, timeout: Duration },

    #[error("operation cancelled")]
    Cancelled,

    #[error("transaction commit failed after {attempts} attempts: watched state changed")]
    CommitConflict { attempts: u32 },

    #[error("store error: {0}")]
    Store(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for the cancellation condition raised out of a blocked wait.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// True when a key held a different kind of value than the command
    /// expected (`WRONGTYPE`), i.e. the data is malformed rather than the
    /// store unreachable.
    pub fn is_wrong_type(&self) -> bool {
        match self {
            Error::Store(msg) => msg.starts_with("WRONGTYPE"),
            Error::Redis(e) => e.code() == Some("WRONGTYPE"),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

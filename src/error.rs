//! Error types for the haven HA manager.
//!
//! All fallible operations in the crate return [`Result`], backed by the
//! unified [`HavenError`] enum. Database-level failures are partitioned at
//! the registry seam into retryable connection loss and fatal query errors;
//! both surface here as [`HavenError::DbOffline`] and
//! [`HavenError::Database`] respectively.

use std::time::Duration;
use thiserror::Error;

/// Main error type for haven operations.
#[derive(Error, Debug)]
pub enum HavenError {
    /// The registry database connection is down; retry on the next tick.
    #[error("database is offline")]
    DbOffline,

    /// Unrecoverable database failure. The detail string is for logs; the
    /// sticky manager error reads "database error".
    #[error("database error")]
    Database(String),

    /// Terminal admission or registry-ownership violation.
    #[error("{0}")]
    Fatal(String),

    /// The manager reported a terminal error status to the parent.
    #[error("HA manager error: {0}")]
    Manager(String),

    /// Notification channel failure.
    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("request timeout after {0:?}")]
    Timeout(Duration),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl HavenError {
    /// Check if the error is retryable on a later tick.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HavenError::DbOffline | HavenError::Timeout(_))
    }
}

impl From<bincode::Error> for HavenError {
    fn from(e: bincode::Error) -> Self {
        HavenError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for HavenError {
    fn from(e: serde_json::Error) -> Self {
        HavenError::Serialization(e.to_string())
    }
}

/// Result type alias for haven operations.
pub type Result<T> = std::result::Result<T, HavenError>;

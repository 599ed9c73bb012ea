//! Engine Error Types
//!
//! This module defines the error type used across the sync engine. The
//! scheduler itself never lets an error escape its loop; these values are
//! recorded against the operation or conflict that produced them and
//! surfaced through the status projection.
//!
//! # Error Categories
//!
//! - `Database` - local SQLite store failures
//! - `Network` - transport-level HTTP failures
//! - `Serialization` - JSON encode/decode failures
//! - Domain errors - unknown entities, missing records, auth state
//!
//! # Thread Safety
//!
//! `SyncError` is `Send + Sync` and can be safely moved across task
//! boundaries.

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the sync engine
#[derive(Debug, Error)]
pub enum SyncError {
    /// Local store (SQLite) error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Transport-level HTTP error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON serialization or deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid engine configuration
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// The queued payload does not match the entity kind it targets
    #[error("payload mismatch for entity kind '{kind}'")]
    PayloadMismatch {
        /// The entity kind the operation targets
        kind: String,
    },

    /// No queued operation with the given id
    #[error("operation not found: {0}")]
    OperationNotFound(Uuid),

    /// No conflict record with the given id
    #[error("conflict not found: {0}")]
    ConflictNotFound(Uuid),

    /// The conflict has already been resolved
    #[error("conflict already resolved: {0}")]
    ConflictAlreadyResolved(Uuid),

    /// A resolution was supplied without the data it requires
    #[error("resolution requires entity data")]
    ResolutionNeedsData,
}

impl SyncError {
    /// Create a payload-mismatch error
    pub fn payload_mismatch(kind: impl Into<String>) -> Self {
        Self::PayloadMismatch { kind: kind.into() }
    }

    /// Whether this error is transient and worth retrying.
    ///
    /// A busy or locked local store counts as transient; the per-operation
    /// retry budget bounds how long a genuinely broken store is retried.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Network(err) => {
                err.is_timeout() || err.is_connect() || err.is_request()
            }
            SyncError::Database(_) => true,
            _ => false,
        }
    }
}

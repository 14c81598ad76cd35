//! Error types for the fleetmend stores.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the queue, lock, and flag stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed job {name}: {reason}")]
    Malformed { name: String, reason: String },

    #[error("job {0} is no longer where it was expected")]
    Gone(String),

    #[error("timed out after {timeout:?} waiting for lock {name}")]
    LockTimeout { name: String, timeout: Duration },

    #[error("invalid node name {0:?}")]
    InvalidNode(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

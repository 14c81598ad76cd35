//! Error types for the restart workflow and node worker.

use thiserror::Error;

use fleetmend_core::CoreError;
use fleetmend_guard::GuardError;
use fleetmend_store::StoreError;

/// Result type alias for restart operations.
pub type RestartResult<T> = Result<T, RestartError>;

#[derive(Debug, Error)]
pub enum RestartError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

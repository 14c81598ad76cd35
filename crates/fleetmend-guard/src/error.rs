//! Error types for the admission guard.

use thiserror::Error;

use fleetmend_lb::LbError;
use fleetmend_store::StoreError;

/// Result type alias for guard operations.
pub type GuardResult<T> = Result<T, GuardError>;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error(transparent)]
    Lb(#[from] LbError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger error: {0}")]
    Ledger(#[from] csv::Error),
}

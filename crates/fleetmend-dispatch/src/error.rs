//! Error types for the queue consumers.

use thiserror::Error;

use fleetmend_core::{CoreError, JobOp, Scope};
use fleetmend_guard::GuardError;
use fleetmend_lb::LbError;
use fleetmend_restart::RestartError;
use fleetmend_store::StoreError;

/// Result type alias for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("backend {0} is not in the ops allow-list")]
    NotAllowed(String),

    #[error("{op} is not supported in {scope} scope")]
    Unsupported { op: JobOp, scope: Scope },

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error(transparent)]
    Lb(#[from] LbError),

    #[error(transparent)]
    Restart(#[from] RestartError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

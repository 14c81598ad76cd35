//! Error types for the log detector.

use thiserror::Error;

use fleetmend_core::CoreError;
use fleetmend_restart::RestartError;
use fleetmend_store::StoreError;

/// Result type alias for detector operations.
pub type DetectorResult<T> = Result<T, DetectorError>;

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("invalid rule pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("cannot parse rules file {path}: {reason}")]
    RulesFile { path: String, reason: String },

    #[error("detector misconfigured: {0}")]
    Config(String),

    #[error(transparent)]
    Restart(#[from] RestartError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

//! Error types for load-balancer control.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use fleetmend_store::StoreError;

/// Result type alias for load-balancer operations.
pub type LbResult<T> = Result<T, LbError>;

#[derive(Debug, Error)]
pub enum LbError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {timeout:?} connecting to {socket}")]
    ConnectTimeout { socket: PathBuf, timeout: Duration },

    /// The socket accepted the command but never answered.
    #[error("no reply to `{command}` within {timeout:?}")]
    ReadTimeout { command: String, timeout: Duration },

    /// The runtime API answered a mutating command with a message.
    #[error("load balancer rejected `{command}`: {reply}")]
    Rejected { command: String, reply: String },

    #[error("malformed stat output: {0}")]
    Stat(String),

    #[error("backend {0} not found in config")]
    BackendNotFound(String),

    #[error("server {server} not found in backend {backend}")]
    ServerNotFound { backend: String, server: String },

    #[error("config validation failed (rolled back): {output}")]
    ValidateFailed { output: String },

    #[error("reload failed: {output}")]
    ReloadFailed { output: String },

    #[error("{provider} provider does not support {operation}")]
    Unsupported {
        provider: &'static str,
        operation: &'static str,
    },

    #[error("{0}")]
    Command(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

//! Taking a node out of its pool and putting it back.

use std::time::Duration;

use fleetmend_core::GuardAction;
use fleetmend_core::command::run_shell;
use fleetmend_guard::{Admission, AdmissionGuard, Assessment};
use tracing::warn;

use crate::error::RestartResult;

/// Result of one pool step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolStep {
    Done { log: String },
    Failed { log: String },
    /// The capacity floor refused the take-out; nothing changed.
    Deferred(Assessment),
}

impl PoolStep {
    pub fn result_label(&self) -> &'static str {
        match self {
            Self::Done { .. } => "OK",
            Self::Failed { .. } => "FAIL",
            Self::Deferred(_) => "DEFERRED",
        }
    }

    pub fn log(&self) -> String {
        match self {
            Self::Done { log } | Self::Failed { log } => log.clone(),
            Self::Deferred(a) => a.reason(),
        }
    }
}

/// How a restart workflow removes and restores its node.
#[derive(Debug, Clone)]
pub enum PoolControl {
    /// Operator-supplied shell hooks (e.g. comment/uncomment a config line).
    Shell {
        take_out: String,
        restore: String,
        timeout: Duration,
    },
    /// Drain through the admission guard and re-enable afterwards.
    Guarded {
        guard: AdmissionGuard,
        backend: String,
        server: String,
    },
}

impl PoolControl {
    pub fn describe(&self) -> String {
        match self {
            Self::Shell { take_out, .. } => take_out.clone(),
            Self::Guarded { backend, server, .. } => format!("drain {backend}/{server}"),
        }
    }

    pub async fn take_out(&self) -> RestartResult<PoolStep> {
        match self {
            Self::Shell { take_out, timeout, .. } => shell_step(take_out, *timeout).await,
            Self::Guarded {
                guard,
                backend,
                server,
            } => match guard.try_apply(GuardAction::Drain, backend, server).await {
                Ok(Admission::Applied) => Ok(PoolStep::Done {
                    log: format!("drained {backend}/{server}"),
                }),
                Ok(Admission::Deferred(assessment)) => Ok(PoolStep::Deferred(assessment)),
                Err(e) => {
                    warn!(%backend, %server, error = %e, "guarded take-out failed");
                    Ok(PoolStep::Failed { log: e.to_string() })
                }
            },
        }
    }

    pub async fn restore(&self) -> RestartResult<PoolStep> {
        match self {
            Self::Shell { restore, timeout, .. } => shell_step(restore, *timeout).await,
            Self::Guarded {
                guard,
                backend,
                server,
            } => match guard.enable(backend, server).await {
                Ok(()) => Ok(PoolStep::Done {
                    log: format!("enabled {backend}/{server}"),
                }),
                Err(e) => {
                    warn!(%backend, %server, error = %e, "guarded restore failed");
                    Ok(PoolStep::Failed { log: e.to_string() })
                }
            },
        }
    }
}

async fn shell_step(cmd: &str, timeout: Duration) -> RestartResult<PoolStep> {
    let out = run_shell(cmd, timeout).await?;
    let log = format!("rc={} {}", out.code, out.log_text()).trim_end().to_string();
    Ok(if out.success() {
        PoolStep::Done { log }
    } else {
        PoolStep::Failed { log }
    })
}

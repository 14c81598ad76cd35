//! Node worker: the restarting side of the flag handshake.
//!
//! Polls for `restart_<node>.txt`, consumes it, restarts the local service
//! and answers with `done_<node>.txt`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use fleetmend_core::command::run_shell;
use fleetmend_core::config::WorkerConfig;
use fleetmend_core::{Verdict, host, time};
use fleetmend_store::FlagStore;
use tracing::{debug, info, warn};

use crate::error::RestartResult;

/// What one restart round produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub stop_rc: i32,
    /// `None` when start was skipped because stop failed.
    pub start_rc: Option<i32>,
    pub verdict: Verdict,
}

impl WorkerReport {
    /// Body of the completion flag.
    pub fn render(&self, node: &str) -> String {
        let start_rc = self
            .start_rc
            .map(|rc| rc.to_string())
            .unwrap_or_else(|| "skipped".to_string());
        format!(
            "ts={} host={} node={} stop_rc={} start_rc={} verify={}\n",
            time::stamp(),
            host::hostname(),
            node,
            self.stop_rc,
            start_rc,
            self.verdict
        )
    }
}

pub struct NodeWorker {
    node: String,
    flags: Arc<dyn FlagStore>,
    config: WorkerConfig,
}

impl NodeWorker {
    pub fn new(node: &str, flags: Arc<dyn FlagStore>, config: WorkerConfig) -> Self {
        Self {
            node: node.to_string(),
            flags,
            config,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Handle a pending request, if any. Returns `None` when there was none.
    pub async fn run_once(&self) -> RestartResult<Option<WorkerReport>> {
        let Some(request) = self.flags.take_request(&self.node)? else {
            return Ok(None);
        };
        info!(node = %self.node, request = %request.trim(), "restart requested");

        let report = self.restart().await?;
        self.flags.write_completion(&self.node, &report.render(&self.node))?;
        info!(
            node = %self.node,
            stop_rc = report.stop_rc,
            start_rc = ?report.start_rc,
            verify = %report.verdict,
            "restart answered"
        );
        Ok(Some(report))
    }

    async fn restart(&self) -> RestartResult<WorkerReport> {
        let timeout = self.config.command_timeout;

        let stop = run_shell(&self.config.stop_cmd, timeout).await?;
        if !stop.success() {
            warn!(node = %self.node, rc = stop.code, out = %stop.log_text(), "stop failed, skipping start");
            return Ok(WorkerReport {
                stop_rc: stop.code,
                start_rc: None,
                verdict: Verdict::Fail,
            });
        }

        tokio::time::sleep(self.config.settle).await;

        let start = run_shell(&self.config.start_cmd, timeout).await?;
        let verdict = if !start.success() {
            warn!(node = %self.node, rc = start.code, out = %start.log_text(), "start failed");
            Verdict::Fail
        } else if self.verify().await? {
            Verdict::Ok
        } else {
            Verdict::Fail
        };

        Ok(WorkerReport {
            stop_rc: stop.code,
            start_rc: Some(start.code),
            verdict,
        })
    }

    /// Poll the verify command until it succeeds or the verify window ends.
    async fn verify(&self) -> RestartResult<bool> {
        let Some(cmd) = &self.config.verify_cmd else {
            return Ok(true);
        };
        let deadline = Instant::now() + self.config.verify_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let out = run_shell(cmd, remaining.min(self.config.command_timeout).max(Duration::from_millis(1))).await?;
            if out.success() {
                return Ok(true);
            }
            debug!(node = %self.node, rc = out.code, "verify not yet passing");
            if Instant::now() + self.config.verify_every >= deadline {
                warn!(node = %self.node, timeout = ?self.config.verify_timeout, "verify timed out");
                return Ok(false);
            }
            tokio::time::sleep(self.config.verify_every).await;
        }
    }

    /// Poll for requests until shutdown.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(node = %self.node, interval = ?self.config.poll_interval, "node worker started");
        loop {
            if let Err(e) = self.run_once().await {
                warn!(node = %self.node, error = %e, "node worker pass failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {
                    info!(node = %self.node, "node worker shutting down");
                    break;
                }
            }
        }
    }
}

//! Restart workflow — the controller side of one node restart.
//!
//! ```text
//!  take out ──▶ restart_<node>.txt ──▶ wait for done_<node>.txt
//!                                        │
//!              verify=OK ◀───────────────┼──────────▶ verify=FAIL / timeout
//!              restore                   │            leave out (fail-safe)
//!                                        ▼
//!                              clean both flags, always
//! ```
//!
//! Every phase appends one audit row. A node whose restart could not be
//! verified stays out of the pool and raises an operator event.

use std::sync::Arc;
use std::time::Duration;

use fleetmend_core::{AuditLog, AuditRow, Event, EventSink, Severity, Verdict};
use fleetmend_guard::Assessment;
use fleetmend_store::{FlagStore, wait_for_completion};
use tracing::{error, info, warn};

use crate::error::RestartResult;
use crate::pool::{PoolControl, PoolStep};

/// Why a restart ended with the node still out of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeftOut {
    VerifyFailed,
    /// Completion flag present but without a verdict.
    NoVerdict,
    AckTimeout,
    RestoreFailed,
}

impl LeftOut {
    fn as_str(&self) -> &'static str {
        match self {
            Self::VerifyFailed => "verify=FAIL",
            Self::NoVerdict => "no verdict",
            Self::AckTimeout => "ack timeout",
            Self::RestoreFailed => "restore failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowOutcome {
    /// Restarted, verified, and back in the pool.
    Restored,
    LeftOut(LeftOut),
    /// Take-out refused by the capacity floor; nothing was signalled.
    Deferred(Assessment),
    /// Take-out failed; nothing was signalled.
    TakeOutFailed,
}

impl WorkflowOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Restored)
    }
}

/// What triggered a restart.
#[derive(Debug, Clone)]
pub struct RestartRequest {
    pub node: String,
    pub reason: String,
    pub severity: Severity,
    pub logfile: Option<String>,
    pub line: Option<String>,
}

impl RestartRequest {
    pub fn new(node: &str, reason: &str) -> Self {
        Self {
            node: node.to_string(),
            reason: reason.to_string(),
            severity: Severity::Critical,
            logfile: None,
            line: None,
        }
    }

    fn row(&self, phase: &str) -> AuditRow {
        let mut row = AuditRow::new(&self.node, phase).severity(self.severity);
        if let Some(logfile) = &self.logfile {
            row = row.logfile(logfile.clone());
        }
        if let Some(line) = &self.line {
            row = row.snippet(line);
        }
        row
    }
}

#[derive(Clone)]
pub struct RestartWorkflow {
    flags: Arc<dyn FlagStore>,
    audit: AuditLog,
    events: Arc<EventSink>,
    ack_timeout: Duration,
    poll_interval: Duration,
    restore_on_fail: bool,
    source: &'static str,
}

impl RestartWorkflow {
    pub fn new(flags: Arc<dyn FlagStore>, audit: AuditLog, events: Arc<EventSink>) -> Self {
        Self {
            flags,
            audit,
            events,
            ack_timeout: Duration::from_secs(900),
            poll_interval: Duration::from_secs(2),
            restore_on_fail: false,
            source: "restart",
        }
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration, poll_interval: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self.poll_interval = poll_interval;
        self
    }

    /// Restore the node even when its restart was not verified.
    pub fn with_restore_on_fail(mut self, restore_on_fail: bool) -> Self {
        self.restore_on_fail = restore_on_fail;
        self
    }

    /// Name recorded as the event source (`detector`, `dispatcher`).
    pub fn with_source(mut self, source: &'static str) -> Self {
        self.source = source;
        self
    }

    fn audit(&self, row: AuditRow) {
        if let Err(e) = self.audit.append(&row) {
            warn!(node = %row.node, phase = %row.phase, error = %e, "failed to append audit row");
        }
    }

    fn event(&self, severity: Severity, node: &str, text: String) {
        self.events.emit_or_log(Event::new(severity, self.source, node, text));
    }

    pub async fn run(&self, req: &RestartRequest, pool: &PoolControl) -> RestartResult<WorkflowOutcome> {
        let node = req.node.as_str();
        info!(%node, reason = %req.reason, "restart workflow starting");

        let step = match pool.take_out().await {
            Ok(step) => step,
            Err(e) => {
                error!(%node, error = %e, "take-out did not run, not signalling restart");
                self.audit(
                    req.row("comment")
                        .action("comment_node")
                        .result("FAIL")
                        .note(req.reason.clone())
                        .op_log(e.to_string()),
                );
                self.event(Severity::Critical, node, format!("take-out did not run: {e}"));
                return Err(e);
            }
        };
        self.audit(
            req.row("comment")
                .action("comment_node")
                .result(step.result_label())
                .note(req.reason.clone())
                .op_log(step.log()),
        );
        match step {
            PoolStep::Done { .. } => {}
            PoolStep::Deferred(assessment) => {
                info!(%node, reason = %assessment.reason(), "take-out deferred by capacity floor");
                return Ok(WorkflowOutcome::Deferred(assessment));
            }
            PoolStep::Failed { log } => {
                error!(%node, %log, "take-out failed, not signalling restart");
                self.event(Severity::Critical, node, format!("take-out failed: {log}"));
                return Ok(WorkflowOutcome::TakeOutFailed);
            }
        }

        let outcome = self.signal_and_wait(req, pool).await;

        // Flags are cleaned on every path, including errors above.
        let cleaned = self.flags.cleanup(node);
        self.audit(
            req.row("cleanup")
                .action("cleanup_flags")
                .result(if cleaned.is_ok() { "OK" } else { "FAIL" }),
        );
        if let Err(e) = cleaned {
            warn!(%node, error = %e, "flag cleanup failed");
        }

        let outcome = outcome?;
        info!(%node, ?outcome, "restart workflow finished");
        Ok(outcome)
    }

    async fn signal_and_wait(
        &self,
        req: &RestartRequest,
        pool: &PoolControl,
    ) -> RestartResult<WorkflowOutcome> {
        let node = req.node.as_str();

        // A stale answer from an earlier round must not be mistaken for ours.
        self.flags.cleanup(node)?;
        self.flags.write_request(node, &req.reason)?;
        self.audit(req.row("signal").action("restart_flag").result("OK").note(req.reason.clone()));

        let completion =
            wait_for_completion(self.flags.as_ref(), node, self.ack_timeout, self.poll_interval).await?;

        let left_out = match &completion {
            Some(done) if done.verdict == Verdict::Ok => {
                let step = pool.restore().await?;
                self.audit(
                    req.row("uncomment")
                        .action("uncomment_node")
                        .result(step.result_label())
                        .note("verify=OK")
                        .op_log(step.log()),
                );
                if matches!(step, PoolStep::Done { .. }) {
                    return Ok(WorkflowOutcome::Restored);
                }
                LeftOut::RestoreFailed
            }
            Some(done) => {
                let reason = if done.verdict == Verdict::Fail {
                    LeftOut::VerifyFailed
                } else {
                    LeftOut::NoVerdict
                };
                self.audit(
                    req.row("uncomment")
                        .action("uncomment_node")
                        .result("SKIP")
                        .note(reason.as_str())
                        .op_log(done.raw.clone()),
                );
                reason
            }
            None => {
                self.audit(
                    req.row("wait_ack")
                        .action("wait_done")
                        .result("TIMEOUT")
                        .note(format!("no completion within {:?}", self.ack_timeout)),
                );
                LeftOut::AckTimeout
            }
        };

        warn!(%node, reason = left_out.as_str(), "node left out of pool");
        self.event(
            Severity::Critical,
            node,
            format!("{node} left out of pool: {} (trigger: {})", left_out.as_str(), req.reason),
        );

        if self.restore_on_fail && left_out != LeftOut::RestoreFailed {
            let step = pool.restore().await?;
            self.audit(
                req.row("uncomment")
                    .action("restore_on_fail")
                    .result(step.result_label())
                    .op_log(step.log()),
            );
        }
        Ok(WorkflowOutcome::LeftOut(left_out))
    }
}

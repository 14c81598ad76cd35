//! Per-node detector: log lines in, restarts (or queued restart jobs) out.
//!
//! ```text
//!   LogFollower ×N ──mpsc──▶ classify ──▶ gate ──▶ inline: RestartWorkflow
//!                              │           │       queue:  enqueue restart job
//!                              │           └─ blocked: audit, drop
//!                              └─ notify: event   noop: audit
//! ```
//!
//! All lines funnel through one channel, so the gate and the workflow see a
//! single serialized stream per node.

use std::sync::Arc;
use std::time::Instant;

use fleetmend_core::{
    AuditLog, AuditRow, Event, EventSink, FleetConfig, Job, RestartSpec, RuleAction, Severity, host,
};
use fleetmend_guard::AdmissionGuard;
use fleetmend_restart::{PoolControl, RestartRequest, RestartWorkflow, WorkflowOutcome};
use fleetmend_store::{FileQueue, HandshakeFlags, JobStore, JobTicket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::{DetectorError, DetectorResult};
use crate::follower::{LogFollower, LogLine};
use crate::gate::{Blocked, Gate};
use crate::rules::RuleSet;

/// What the detector does once a restart is admitted.
pub enum Mode {
    /// Run the restart workflow in-process.
    Inline {
        workflow: RestartWorkflow,
        pool: PoolControl,
    },
    /// Hand a `restart` job to the dispatcher.
    Queue {
        queue: Arc<dyn JobStore>,
        backend: String,
        server: String,
        take_out_cmd: Option<String>,
        restore_cmd: Option<String>,
    },
}

/// How one line was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// No rule matched.
    Ignored,
    /// A `noop` rule matched.
    Recorded,
    Blocked(Blocked),
    Notified,
    Restarted(WorkflowOutcome),
    Enqueued(JobTicket),
}

pub struct Detector {
    node: String,
    rules: RuleSet,
    gate: Gate,
    mode: Mode,
    audit: AuditLog,
    events: Arc<EventSink>,
}

impl Detector {
    pub fn new(
        node: &str,
        rules: RuleSet,
        gate: Gate,
        mode: Mode,
        audit: AuditLog,
        events: Arc<EventSink>,
    ) -> Self {
        Self {
            node: node.to_string(),
            rules,
            gate,
            mode,
            audit,
            events,
        }
    }

    /// Build a detector from the `[detector]` section.
    ///
    /// Inline mode needs either shell take-out/restore commands or a
    /// backend/server pair to drain through the admission guard.
    pub fn from_config(config: &FleetConfig) -> DetectorResult<Self> {
        let dc = &config.detector;
        let node = dc
            .node
            .clone()
            .unwrap_or_else(|| host::hostname().to_string());
        let rules = RuleSet::from_config(&dc.rules)?;
        let gate = Gate::new(dc.debounce, dc.cooldown);
        let audit = AuditLog::new(config.paths.audit());
        let events = Arc::new(EventSink::new(config.paths.events()));

        let mode = if dc.queue_mode {
            Mode::Queue {
                queue: Arc::new(FileQueue::new(config.paths.restart_queue())),
                backend: dc.backend.clone().unwrap_or_default(),
                server: dc.server.clone().unwrap_or_else(|| node.clone()),
                take_out_cmd: dc.take_out_cmd.clone(),
                restore_cmd: dc.restore_cmd.clone(),
            }
        } else {
            let pool = match (&dc.take_out_cmd, &dc.restore_cmd, &dc.backend) {
                (Some(take_out), Some(restore), _) => PoolControl::Shell {
                    take_out: take_out.clone(),
                    restore: restore.clone(),
                    timeout: dc.cmd_timeout,
                },
                (None, None, Some(backend)) => PoolControl::Guarded {
                    guard: AdmissionGuard::from_config(config),
                    backend: backend.clone(),
                    server: dc.server.clone().unwrap_or_else(|| node.clone()),
                },
                _ => {
                    return Err(DetectorError::Config(
                        "inline mode needs take_out_cmd and restore_cmd, or a backend".to_string(),
                    ));
                }
            };
            let workflow = RestartWorkflow::new(
                Arc::new(HandshakeFlags::new(config.paths.flags())),
                audit.clone(),
                Arc::clone(&events),
            )
            .with_ack_timeout(dc.ack_timeout, dc.flag_poll_interval)
            .with_restore_on_fail(dc.restore_on_fail)
            .with_source("detector");
            Mode::Inline { workflow, pool }
        };

        Ok(Self::new(&node, rules, gate, mode, audit, events))
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    fn audit(&self, row: AuditRow) {
        if let Err(e) = self.audit.append(&row) {
            warn!(node = %self.node, error = %e, "failed to append audit row");
        }
    }

    /// Classify one line and act on it.
    pub async fn handle_line(&mut self, line: &LogLine) -> DetectorResult<Decision> {
        let Some(rule) = self.rules.classify(&line.line) else {
            return Ok(Decision::Ignored);
        };
        let (pattern, severity, action) = (rule.pattern().to_string(), rule.severity, rule.action);
        let logfile = line.path.display().to_string();
        let row = |phase: &str| {
            AuditRow::new(&self.node, phase)
                .severity(severity)
                .action(action.as_str())
                .logfile(logfile.clone())
                .snippet(&line.line)
        };

        if action == RuleAction::Noop {
            self.audit(row("match").result("NOOP").note(pattern));
            return Ok(Decision::Recorded);
        }

        if let Err(blocked) = self.gate.admit(Instant::now()) {
            debug!(node = %self.node, %pattern, %blocked, "match dropped");
            self.audit(row("skip").result("SKIP").note(format!("{blocked}: {pattern}")));
            return Ok(Decision::Blocked(blocked));
        }

        if action == RuleAction::Notify {
            info!(node = %self.node, %pattern, "notify rule matched");
            self.events.emit_or_log(Event::new(
                severity,
                "detector",
                &self.node,
                format!("{}: {} ({})", self.node, line.line.trim(), pattern),
            ));
            self.audit(row("notify").result("OK").note(pattern));
            return Ok(Decision::Notified);
        }

        info!(node = %self.node, %pattern, log = %logfile, "restart rule matched");
        let decision = match &self.mode {
            Mode::Inline { workflow, pool } => {
                let request = RestartRequest {
                    node: self.node.clone(),
                    reason: pattern,
                    severity,
                    logfile: Some(logfile.clone()),
                    line: Some(line.line.clone()),
                };
                let outcome = workflow.run(&request, pool).await;
                // Cooldown starts even when the workflow errored part-way.
                self.gate.action_completed(Instant::now());
                Decision::Restarted(outcome?)
            }
            Mode::Queue {
                queue,
                backend,
                server,
                take_out_cmd,
                restore_cmd,
            } => {
                let spec = RestartSpec {
                    node: self.node.clone(),
                    reason: pattern.clone(),
                    take_out_cmd: take_out_cmd.clone(),
                    restore_cmd: restore_cmd.clone(),
                };
                let job = Job::restart(&spec, backend, server);
                let enqueued = queue.enqueue(&job);
                self.audit(
                    row("enqueue")
                        .result(if enqueued.is_ok() { "OK" } else { "FAIL" })
                        .note(pattern),
                );
                let ticket = enqueued?;
                self.gate.action_completed(Instant::now());
                info!(node = %self.node, job = %ticket.name, "restart job queued");
                Decision::Enqueued(ticket)
            }
        };
        Ok(decision)
    }

    /// Follow `logs` and handle lines until shutdown.
    pub async fn run(
        mut self,
        logs: Vec<std::path::PathBuf>,
        poll_interval: std::time::Duration,
        shutdown: watch::Receiver<bool>,
    ) {
        let (tx, mut rx) = mpsc::channel::<LogLine>(1024);
        for path in &logs {
            let follower = LogFollower::new(path, poll_interval);
            tokio::spawn(follower.run(tx.clone(), shutdown.clone()));
        }
        drop(tx);
        info!(node = %self.node, logs = logs.len(), rules = self.rules.len(), "detector started");

        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                line = rx.recv() => {
                    let Some(line) = line else { break };
                    match self.handle_line(&line).await {
                        Ok(Decision::Ignored) => {}
                        Ok(decision) => debug!(node = %self.node, ?decision, "line handled"),
                        Err(e) => error!(node = %self.node, error = %e, "failed to handle match"),
                    }
                }
                _ = shutdown.changed() => {
                    info!(node = %self.node, "detector shutting down");
                    break;
                }
            }
        }
    }
}

//! Restart dispatcher: drains the restart queue under admission limits.
//!
//! Each pass reaps finished workflows, then walks `queue/` in file-name
//! order. A job whose node fails an admission check stays where it is; the
//! next pass looks again. An admitted job is claimed and its workflow runs
//! in a spawned task, so one slow node never blocks the pass.

use std::sync::Arc;
use std::time::Instant;

use fleetmend_core::config::DispatcherConfig;
use fleetmend_core::{AuditLog, AuditRow, EventSink, FleetConfig, Job, JobOp, Severity};
use fleetmend_guard::AdmissionGuard;
use fleetmend_restart::{PoolControl, RestartRequest, RestartWorkflow, WorkflowOutcome};
use fleetmend_store::{ClaimOutcome, FileQueue, FlagStore, HandshakeFlags, JobState, JobStore, JobTicket};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{DispatchError, DispatchResult};
use crate::scheduler::{Refusal, SchedulerState};

/// A workflow task's result, handed back to the dispatcher.
struct Finished {
    node: String,
    ticket: JobTicket,
    result: Result<WorkflowOutcome, String>,
}

/// What one pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassReport {
    /// Nodes whose workflow started this pass.
    pub started: Vec<String>,
    /// Jobs left queued, with the first failing check.
    pub held: Vec<(String, Refusal)>,
    /// Jobs that reached a terminal (or requeued) state this pass.
    pub finished: usize,
    pub malformed: usize,
}

pub struct Dispatcher {
    queue: Arc<dyn JobStore>,
    flags: Arc<dyn FlagStore>,
    workflow: RestartWorkflow,
    guard: Option<AdmissionGuard>,
    state: SchedulerState,
    config: DispatcherConfig,
    audit: AuditLog,
    tasks: JoinSet<Finished>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn JobStore>,
        flags: Arc<dyn FlagStore>,
        audit: AuditLog,
        events: Arc<EventSink>,
        config: DispatcherConfig,
    ) -> Self {
        let workflow = RestartWorkflow::new(Arc::clone(&flags), audit.clone(), events)
            .with_ack_timeout(config.worker_wait, config.poll_interval)
            .with_restore_on_fail(config.restore_on_fail)
            .with_source("dispatcher");
        Self {
            queue,
            flags,
            workflow,
            guard: None,
            state: SchedulerState::from_config(&config),
            config,
            audit,
            tasks: JoinSet::new(),
        }
    }

    /// Jobs without take-out/restore commands are drained through `guard`.
    pub fn with_guard(mut self, guard: AdmissionGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn from_config(config: &FleetConfig) -> Self {
        Self::new(
            Arc::new(FileQueue::new(config.paths.restart_queue())),
            Arc::new(HandshakeFlags::new(config.paths.flags())),
            AuditLog::new(config.paths.audit()),
            Arc::new(EventSink::new(config.paths.events())),
            config.dispatcher.clone(),
        )
        .with_guard(AdmissionGuard::from_config(config))
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    fn audit(&self, row: AuditRow) {
        if let Err(e) = self.audit.append(&row) {
            warn!(node = %row.node, error = %e, "failed to append audit row");
        }
    }

    /// One scheduling pass.
    pub async fn run_once(&mut self) -> DispatchResult<PassReport> {
        let mut report = PassReport {
            finished: self.reap().await,
            ..PassReport::default()
        };

        for ticket in self.queue.list(JobState::Queue)? {
            // Peek before claiming so a held job is never moved.
            let node = match self.queue.load(&ticket) {
                Ok(job) => job.node(),
                Err(fleetmend_store::StoreError::Gone(_)) => continue,
                Err(fleetmend_store::StoreError::Malformed { .. }) => String::new(),
                Err(e) => return Err(e.into()),
            };

            if !node.is_empty() {
                if let Err(refusal) = self.state.can_start(&node, Instant::now()) {
                    debug!(%node, job = %ticket.name, %refusal, "job held");
                    report.held.push((ticket.name.clone(), refusal));
                    continue;
                }
            }

            match self.queue.claim_and_load(&ticket)? {
                ClaimOutcome::Lost => {}
                ClaimOutcome::Malformed(failed, reason) => {
                    report.malformed += 1;
                    self.audit(
                        AuditRow::new("-", "dispatch")
                            .severity(Severity::Warn)
                            .action("claim")
                            .result("FAIL")
                            .note(format!("malformed job {}: {reason}", failed.name)),
                    );
                }
                ClaimOutcome::Claimed(claimed, job) => match self.start(claimed.clone(), &job) {
                    Ok(()) => report.started.push(job.node()),
                    Err(e) => {
                        warn!(job = %claimed.name, error = %e, "job rejected");
                        self.audit(
                            AuditRow::new(&job.node(), "dispatch")
                                .severity(Severity::Warn)
                                .action(job.op.as_str())
                                .result("FAIL")
                                .note(e.to_string()),
                        );
                        self.queue.transition(&claimed, JobState::Failed)?;
                        report.finished += 1;
                    }
                },
            }
        }
        Ok(report)
    }

    /// Build the request and pool control for a claimed job and spawn it.
    fn start(&mut self, ticket: JobTicket, job: &Job) -> DispatchResult<()> {
        if job.op != JobOp::Restart {
            return Err(DispatchError::InvalidJob(format!(
                "{} jobs belong in the ops queue",
                job.op
            )));
        }
        let spec = job
            .restart_spec()
            .ok_or_else(|| DispatchError::InvalidJob("restart job names no node".to_string()))?;

        let pool = match (&spec.take_out_cmd, &spec.restore_cmd) {
            (Some(take_out), Some(restore)) => PoolControl::Shell {
                take_out: take_out.clone(),
                restore: restore.clone(),
                timeout: self.config.command_timeout,
            },
            _ => {
                let guard = self.guard.clone().ok_or_else(|| {
                    DispatchError::InvalidJob("no take-out commands and no admission guard".to_string())
                })?;
                if job.backend.is_empty() {
                    return Err(DispatchError::InvalidJob("restart job names no backend".to_string()));
                }
                PoolControl::Guarded {
                    guard,
                    backend: job.backend.clone(),
                    server: if job.server.is_empty() {
                        spec.node.clone()
                    } else {
                        job.server.clone()
                    },
                }
            }
        };

        let node = spec.node.clone();
        let reason = if spec.reason.is_empty() {
            format!("queued job {}", ticket.name)
        } else {
            spec.reason.clone()
        };
        let request = RestartRequest::new(&node, &reason);
        let workflow = self.workflow.clone();

        self.state.mark_started(&node, Instant::now());
        info!(%node, job = %ticket.name, pool = %pool.describe(), "starting restart workflow");

        // The inner task isolates panics; the outer one always reports back.
        let inner = tokio::spawn(async move { workflow.run(&request, &pool).await });
        self.tasks.spawn(async move {
            let result = match inner.await {
                Ok(Ok(outcome)) => Ok(outcome),
                Ok(Err(e)) => Err(e.to_string()),
                Err(e) => Err(format!("workflow task failed: {e}")),
            };
            Finished {
                node,
                ticket,
                result,
            }
        });
        Ok(())
    }

    /// Collect every workflow that has finished, without waiting.
    async fn reap(&mut self) -> usize {
        let mut count = 0;
        loop {
            let joined = tokio::select! {
                biased;
                joined = self.tasks.join_next() => joined,
                _ = std::future::ready(()) => None,
            };
            let Some(joined) = joined else { break };
            count += 1;
            match joined {
                Ok(finished) => self.finish(finished),
                Err(e) => error!(error = %e, "dispatcher task failed"),
            }
        }
        count
    }

    /// Wait for every in-flight workflow to finish.
    pub async fn wait_idle(&mut self) -> usize {
        let mut count = 0;
        while let Some(joined) = self.tasks.join_next().await {
            count += 1;
            match joined {
                Ok(finished) => self.finish(finished),
                Err(e) => error!(error = %e, "dispatcher task failed"),
            }
        }
        count
    }

    fn finish(&mut self, finished: Finished) {
        let Finished { node, ticket, result } = finished;
        self.state.mark_finished(&node, Instant::now());
        if let Err(e) = self.flags.cleanup(&node) {
            warn!(%node, error = %e, "flag cleanup failed");
        }

        let (to, label) = match &result {
            Ok(WorkflowOutcome::Restored) => (JobState::Done, "DONE".to_string()),
            Ok(WorkflowOutcome::Deferred(a)) => (JobState::Queue, format!("REQUEUED {}", a.reason())),
            Ok(other) => (JobState::Failed, format!("FAILED {other:?}")),
            Err(e) => (JobState::Failed, format!("ERROR {e}")),
        };
        match self.queue.transition(&ticket, to) {
            Ok(moved) => info!(%node, job = %moved.name, state = %to, "job finished"),
            Err(e) => error!(%node, job = %ticket.name, error = %e, "cannot move finished job"),
        }
        self.audit(
            AuditRow::new(&node, "dispatch")
                .severity(if to == JobState::Done {
                    Severity::Info
                } else {
                    Severity::Warn
                })
                .action("job")
                .result(to.dir_name())
                .note(label)
                .op_log(ticket.name),
        );
    }

    /// Pass after pass until shutdown; in-flight workflows are awaited.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            max_concurrent = self.config.max_concurrent,
            interval = ?self.config.interval,
            "dispatcher started"
        );
        loop {
            match self.run_once().await {
                Ok(report) if !report.started.is_empty() => {
                    info!(started = ?report.started, held = report.held.len(), "dispatch pass");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "dispatch pass failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = shutdown.changed() => {
                    info!(in_flight = self.in_flight(), "dispatcher shutting down");
                    break;
                }
            }
        }
        self.wait_idle().await;
    }
}

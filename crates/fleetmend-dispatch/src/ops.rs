//! LB operations worker: drains the `ops` queue.
//!
//! | op              | runtime scope                | cfg scope                    |
//! |-----------------|------------------------------|------------------------------|
//! | drain, disable  | admission guard (ledgered)   | `disabled` token, floor-checked |
//! | enable          | backend lock, never refused  | remove `disabled` token      |
//! | weight          | backend lock                 | unsupported                  |
//! | comment         | skipped                      | comment the server line out  |
//! | uncomment       | skipped                      | uncomment the server line    |
//!
//! `both` runs the runtime step first and stops there if it was deferred
//! or failed. A deferred job still goes to `done`: the ledger owns its
//! retry.

use std::sync::Arc;

use fleetmend_core::config::OpsConfig;
use fleetmend_core::{AuditLog, AuditRow, FleetConfig, GuardAction, Job, JobOp, Scope, Severity};
use fleetmend_guard::{Admission, AdmissionGuard};
use fleetmend_lb::{ConfigPatcher, PatchOutcome, ToggleStyle};
use fleetmend_store::{ClaimOutcome, FileQueue, JobState, JobStore, LockManager};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{DispatchError, DispatchResult};

/// Result of one executed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutcome {
    Applied(String),
    /// Refused by the capacity floor.
    Deferred(String),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OpsReport {
    pub done: usize,
    pub deferred: usize,
    pub failed: usize,
}

pub struct OpsWorker {
    queue: Arc<dyn JobStore>,
    guard: AdmissionGuard,
    patcher: ConfigPatcher,
    config: OpsConfig,
    audit: AuditLog,
}

impl OpsWorker {
    pub fn new(
        queue: Arc<dyn JobStore>,
        guard: AdmissionGuard,
        patcher: ConfigPatcher,
        config: OpsConfig,
        audit: AuditLog,
    ) -> Self {
        Self {
            queue,
            guard,
            patcher,
            config,
            audit,
        }
    }

    pub fn from_config(config: &FleetConfig) -> Self {
        let patcher = ConfigPatcher::new(&config.lb.cfg_path, LockManager::new(config.paths.locks()))
            .with_commands(&config.lb.validate_cmd, &config.lb.reload_cmd)
            .with_timeouts(config.lb.command_timeout, config.guard.lock_timeout);
        Self::new(
            Arc::new(FileQueue::new(config.paths.ops_queue())),
            AdmissionGuard::from_config(config),
            patcher,
            config.ops.clone(),
            AuditLog::new(config.paths.audit()),
        )
    }

    pub fn guard(&self) -> &AdmissionGuard {
        &self.guard
    }

    /// Route one job by scope and op.
    pub async fn execute(&self, job: &Job) -> DispatchResult<OpOutcome> {
        if !self.config.allows(&job.backend) {
            return Err(DispatchError::NotAllowed(job.backend.clone()));
        }
        if job.backend.is_empty() || job.server.is_empty() {
            return Err(DispatchError::InvalidJob("backend and server are required".to_string()));
        }
        let (backend, server) = (job.backend.as_str(), job.server.as_str());
        let mut notes = Vec::new();

        if job.scope.includes_runtime() {
            match job.op {
                JobOp::Drain | JobOp::Disable => {
                    let action = GuardAction::try_from(job.op)
                        .map_err(|op| DispatchError::Unsupported { op, scope: job.scope })?;
                    if let Admission::Deferred(a) = self.guard.apply(action, backend, server).await? {
                        return Ok(OpOutcome::Deferred(a.reason()));
                    }
                    notes.push(format!("runtime {action}"));
                }
                JobOp::Enable => {
                    self.guard.enable(backend, server).await?;
                    notes.push("runtime enable".to_string());
                }
                JobOp::Weight => {
                    let weight = job
                        .weight()
                        .ok_or_else(|| DispatchError::InvalidJob("weight job without weight".to_string()))?;
                    self.guard.set_weight(backend, server, weight).await?;
                    notes.push(format!("runtime weight {weight}"));
                }
                JobOp::Comment | JobOp::Uncomment if job.scope == Scope::Both => {}
                op => return Err(DispatchError::Unsupported { op, scope: job.scope }),
            }
        }

        if job.scope.includes_cfg() {
            let (enable, style) = match job.op {
                JobOp::Drain | JobOp::Disable => (false, ToggleStyle::DisabledToken),
                JobOp::Enable => (true, ToggleStyle::DisabledToken),
                JobOp::Comment => (false, ToggleStyle::CommentOut),
                JobOp::Uncomment => (true, ToggleStyle::CommentOut),
                op => return Err(DispatchError::Unsupported { op, scope: job.scope }),
            };
            // Runtime already went through the guard for `both`.
            if !enable && job.scope == Scope::Cfg {
                let assessment = self.guard.assess(backend, server).await?;
                if !assessment.allowed() {
                    return Ok(OpOutcome::Deferred(assessment.reason()));
                }
            }
            match self.patcher.toggle(backend, server, enable, style).await? {
                PatchOutcome::Unchanged => notes.push("cfg unchanged".to_string()),
                PatchOutcome::Applied { backup } => {
                    notes.push(format!("cfg patched (backup {})", backup.display()));
                }
            }
        }

        Ok(OpOutcome::Applied(notes.join("; ")))
    }

    /// Claim and execute every queued job once.
    pub async fn run_once(&self) -> DispatchResult<OpsReport> {
        let mut report = OpsReport::default();
        for ticket in self.queue.list(JobState::Queue)? {
            let (claimed, job) = match self.queue.claim_and_load(&ticket)? {
                ClaimOutcome::Lost => continue,
                ClaimOutcome::Malformed(failed, reason) => {
                    report.failed += 1;
                    self.audit(
                        AuditRow::new("-", "lb_op")
                            .severity(Severity::Warn)
                            .result("FAIL")
                            .note(format!("malformed job {}: {reason}", failed.name)),
                    );
                    continue;
                }
                ClaimOutcome::Claimed(claimed, job) => (claimed, job),
            };

            let outcome = self.execute(&job).await;
            let (to, result, note) = match &outcome {
                Ok(OpOutcome::Applied(note)) => {
                    report.done += 1;
                    (JobState::Done, "OK", note.clone())
                }
                Ok(OpOutcome::Deferred(reason)) => {
                    report.deferred += 1;
                    (JobState::Done, "DEFERRED", reason.clone())
                }
                Err(e) => {
                    report.failed += 1;
                    (JobState::Failed, "FAIL", e.to_string())
                }
            };
            info!(job = %claimed.name, op = %job.op, scope = %job.scope, result, "ops job handled");
            self.audit(
                AuditRow::new(&job.server, "lb_op")
                    .severity(if to == JobState::Failed {
                        Severity::Warn
                    } else {
                        Severity::Info
                    })
                    .action(format!("{}/{}", job.scope, job.op))
                    .result(result)
                    .note(note)
                    .op_log(claimed.name.clone()),
            );
            self.queue.transition(&claimed, to)?;
        }
        Ok(report)
    }

    fn audit(&self, row: AuditRow) {
        if let Err(e) = self.audit.append(&row) {
            warn!(error = %e, "failed to append audit row");
        }
    }

    /// Process the queue and retry the deferred ledger on every pass.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.config.interval, "ops worker started");
        loop {
            if let Err(e) = self.run_once().await {
                warn!(error = %e, "ops pass failed");
            }
            if let Err(e) = self.guard.retry_deferred().await {
                warn!(error = %e, "deferred retry failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = shutdown.changed() => {
                    info!("ops worker shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fleetmend_guard::{CapacityFloor, DeferredLedger};
    use fleetmend_lb::testing::FakeLb;
    use fleetmend_lb::{Provider, Providers};

    use super::*;

    const CFG: &str = "\
backend api
    server web1 10.0.0.1:80 check
    server web2 10.0.0.2:80 check
    server web3 10.0.0.3:80 check
";

    struct Fixture {
        _dir: tempfile::TempDir,
        lb: FakeLb,
        queue: FileQueue,
        worker: OpsWorker,
        cfg: std::path::PathBuf,
    }

    async fn fixture(min_enabled: usize, allowed: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let lb = FakeLb::start(root, &[("api", &["web1", "web2", "web3"]), ("other", &["x1"])]).await;
        let locks = LockManager::new(root.join("locks"));
        let guard = AdmissionGuard::new(
            Providers::new(Provider::Haproxy(lb.client())),
            locks.clone(),
            DeferredLedger::new(root.join("deferred.csv"), locks.clone(), Duration::from_secs(2)),
            CapacityFloor::uniform(min_enabled),
        );
        let cfg = root.join("haproxy.cfg");
        std::fs::write(&cfg, CFG).unwrap();
        let patcher = ConfigPatcher::new(&cfg, locks).with_commands("true", "true");
        let queue = FileQueue::new(root.join("ops"));
        let worker = OpsWorker::new(
            Arc::new(queue.clone()),
            guard,
            patcher,
            OpsConfig {
                allowed_backends: allowed.iter().map(|s| s.to_string()).collect(),
                interval: Duration::from_millis(10),
            },
            AuditLog::new(root.join("audit.csv")),
        );
        Fixture {
            lb,
            queue,
            worker,
            cfg,
            _dir: dir,
        }
    }

    fn audit_results(f: &Fixture) -> Vec<String> {
        AuditLog::new(f._dir.path().join("audit.csv"))
            .read_all()
            .unwrap()
            .into_iter()
            .map(|r| r.result)
            .collect()
    }

    #[tokio::test]
    async fn runtime_drain_goes_through_guard() {
        let f = fixture(2, &[]).await;
        f.queue.enqueue(&Job::new(JobOp::Drain, "api", "web1")).unwrap();

        let report = f.worker.run_once().await.unwrap();
        assert_eq!(report.done, 1);
        assert_eq!(f.lb.status("api", "web1").as_deref(), Some("DRAIN"));
        assert_eq!(f.queue.list(JobState::Done).unwrap().len(), 1);
        assert_eq!(audit_results(&f), ["OK"]);
    }

    #[tokio::test]
    async fn deferred_drain_is_done_and_ledgered() {
        let f = fixture(3, &[]).await;
        f.queue.enqueue(&Job::new(JobOp::Disable, "api", "web2")).unwrap();

        let report = f.worker.run_once().await.unwrap();
        assert_eq!(report.deferred, 1);
        assert!(f.lb.mutations().is_empty());
        assert_eq!(f.queue.list(JobState::Done).unwrap().len(), 1);
        assert_eq!(f.worker.guard().ledger().read().unwrap().len(), 1);
        assert_eq!(audit_results(&f), ["DEFERRED"]);
    }

    #[tokio::test]
    async fn weight_and_enable_bypass_floor() {
        let f = fixture(3, &[]).await;
        f.lb.set_status("api", "web3", "MAINT");
        f.queue.enqueue(&Job::new(JobOp::Enable, "api", "web3")).unwrap();
        f.queue
            .enqueue(&Job::new(JobOp::Weight, "api", "web1").with_weight(50))
            .unwrap();

        assert_eq!(f.worker.run_once().await.unwrap().done, 2);
        assert_eq!(f.lb.status("api", "web3").as_deref(), Some("UP"));
        assert!(f.lb.mutations().contains(&"set server api/web1 weight 50".to_string()));
    }

    #[tokio::test]
    async fn cfg_comment_patches_file() {
        let f = fixture(2, &[]).await;
        f.queue
            .enqueue(&Job::new(JobOp::Comment, "api", "web2").with_scope(Scope::Cfg))
            .unwrap();

        assert_eq!(f.worker.run_once().await.unwrap().done, 1);
        let text = std::fs::read_to_string(&f.cfg).unwrap();
        assert!(text.contains("    # server web2 10.0.0.2:80 check\n"), "{text}");
        assert!(f.lb.mutations().is_empty());
    }

    #[tokio::test]
    async fn both_scope_skips_cfg_when_deferred() {
        let f = fixture(3, &[]).await;
        f.queue
            .enqueue(&Job::new(JobOp::Disable, "api", "web1").with_scope(Scope::Both))
            .unwrap();

        assert_eq!(f.worker.run_once().await.unwrap().deferred, 1);
        assert_eq!(std::fs::read_to_string(&f.cfg).unwrap(), CFG);
    }

    #[tokio::test]
    async fn both_scope_applies_runtime_then_cfg() {
        let f = fixture(2, &[]).await;
        f.queue
            .enqueue(&Job::new(JobOp::Disable, "api", "web1").with_scope(Scope::Both))
            .unwrap();

        assert_eq!(f.worker.run_once().await.unwrap().done, 1);
        assert_eq!(f.lb.status("api", "web1").as_deref(), Some("MAINT"));
        let text = std::fs::read_to_string(&f.cfg).unwrap();
        assert!(text.contains("server web1 10.0.0.1:80 check disabled\n"), "{text}");
    }

    #[tokio::test]
    async fn disallowed_backend_and_bad_ops_fail() {
        let f = fixture(1, &["api"]).await;
        f.queue.enqueue(&Job::new(JobOp::Drain, "other", "x1")).unwrap();
        f.queue.enqueue(&Job::new(JobOp::Comment, "api", "web1")).unwrap();
        f.queue
            .enqueue(&Job::new(JobOp::Weight, "api", "web1").with_scope(Scope::Cfg))
            .unwrap();

        let report = f.worker.run_once().await.unwrap();
        assert_eq!(report.failed, 3);
        assert_eq!(f.queue.list(JobState::Failed).unwrap().len(), 3);
        assert!(f.lb.mutations().is_empty());
    }

    #[tokio::test]
    async fn validate_failure_fails_job_and_keeps_file() {
        let mut f = fixture(1, &[]).await;
        let locks = LockManager::new(f._dir.path().join("locks"));
        f.worker.patcher = ConfigPatcher::new(&f.cfg, locks).with_commands("false", "true");
        f.queue
            .enqueue(&Job::new(JobOp::Comment, "api", "web1").with_scope(Scope::Cfg))
            .unwrap();

        assert_eq!(f.worker.run_once().await.unwrap().failed, 1);
        assert_eq!(std::fs::read_to_string(&f.cfg).unwrap(), CFG);
    }
}

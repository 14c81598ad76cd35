//! Stuck-job and stale-flag reconciler.
//!
//! An in-progress job older than `stale_after` gets one second chance: it
//! goes back to `queue` with a `.requeued` infix. If it gets stuck again it
//! goes to `failed`. A restart flag older than `flag_stale_after` with no
//! completion means the node never answered; that raises an event once per
//! flag. Only one watchdog pass runs at a time across processes.

use std::collections::HashSet;
use std::sync::Arc;

use fleetmend_core::config::WatchdogConfig;
use fleetmend_core::{AuditLog, AuditRow, Event, EventSink, FleetConfig, Severity, time};
use fleetmend_store::{FileQueue, FlagStore, HandshakeFlags, JobState, JobStore, LockManager};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::DispatchResult;

pub const WATCHDOG_LOCK: &str = "watchdog";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WatchdogReport {
    /// Another watchdog held the lock; nothing was done.
    pub skipped: bool,
    pub requeued: Vec<String>,
    pub failed: Vec<String>,
    /// Nodes newly reported for an unanswered restart flag.
    pub stale_flags: Vec<String>,
    pub pruned: usize,
}

pub struct Watchdog {
    queues: Vec<Arc<dyn JobStore>>,
    flags: Arc<dyn FlagStore>,
    events: Arc<EventSink>,
    audit: AuditLog,
    locks: LockManager,
    config: WatchdogConfig,
    reported: HashSet<String>,
}

impl Watchdog {
    pub fn new(
        queues: Vec<Arc<dyn JobStore>>,
        flags: Arc<dyn FlagStore>,
        events: Arc<EventSink>,
        audit: AuditLog,
        locks: LockManager,
        config: WatchdogConfig,
    ) -> Self {
        Self {
            queues,
            flags,
            events,
            audit,
            locks,
            config,
            reported: HashSet::new(),
        }
    }

    /// Watches both the restart queue and the ops queue.
    pub fn from_config(config: &FleetConfig) -> Self {
        Self::new(
            vec![
                Arc::new(FileQueue::new(config.paths.restart_queue())),
                Arc::new(FileQueue::new(config.paths.ops_queue())),
            ],
            Arc::new(HandshakeFlags::new(config.paths.flags())),
            Arc::new(EventSink::new(config.paths.events())),
            AuditLog::new(config.paths.audit()),
            LockManager::new(config.paths.locks()),
            config.watchdog.clone(),
        )
    }

    fn event(&self, node: &str, text: String) {
        self.events
            .emit_or_log(Event::new(Severity::Warn, "watchdog", node, text));
    }

    fn audit(&self, row: AuditRow) {
        if let Err(e) = self.audit.append(&row) {
            warn!(error = %e, "failed to append audit row");
        }
    }

    pub fn run_once(&mut self) -> DispatchResult<WatchdogReport> {
        let Some(_lock) = self.locks.try_acquire(WATCHDOG_LOCK)? else {
            debug!("another watchdog pass is running");
            return Ok(WatchdogReport {
                skipped: true,
                ..WatchdogReport::default()
            });
        };
        let mut report = WatchdogReport::default();

        for queue in &self.queues {
            for (ticket, age) in queue.aged(JobState::InProgress)? {
                if age < self.config.stale_after {
                    continue;
                }
                if ticket.is_requeued() {
                    let moved = match queue.transition(&ticket, JobState::Failed) {
                        Ok(moved) => moved,
                        // Finished between scan and move.
                        Err(fleetmend_store::StoreError::Gone(_)) => continue,
                        Err(e) => return Err(e.into()),
                    };
                    warn!(job = %moved.name, age = %time::format_duration(age), "job stuck twice, failing it");
                    self.event("-", format!("stuck job moved to failed: {}", moved.name));
                    self.audit(
                        AuditRow::new("-", "watchdog")
                            .severity(Severity::Warn)
                            .action("fail_stuck")
                            .result("OK")
                            .note(moved.name.clone()),
                    );
                    report.failed.push(moved.name);
                } else {
                    let moved = match queue.requeue_stale(&ticket) {
                        Ok(moved) => moved,
                        Err(fleetmend_store::StoreError::Gone(_)) => continue,
                        Err(e) => return Err(e.into()),
                    };
                    info!(job = %moved.name, age = %time::format_duration(age), "stuck job requeued");
                    self.audit(
                        AuditRow::new("-", "watchdog")
                            .action("requeue_stuck")
                            .result("OK")
                            .note(moved.name.clone()),
                    );
                    report.requeued.push(moved.name);
                }
            }

            for state in [JobState::Done, JobState::Failed] {
                report.pruned += queue.prune(state, self.config.retention)?;
            }
        }

        let stale = self.flags.stale_requests(self.config.flag_stale_after)?;
        let current: HashSet<String> = stale.iter().map(|(node, _)| node.clone()).collect();
        for (node, age) in stale {
            if self.reported.contains(&node) {
                continue;
            }
            warn!(%node, age = %time::format_duration(age), "restart flag unanswered");
            self.event(
                &node,
                format!(
                    "restart flag for {node} unanswered for {}",
                    time::format_duration(age)
                ),
            );
            report.stale_flags.push(node);
        }
        self.reported = current;

        Ok(report)
    }

    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.config.interval, "watchdog started");
        loop {
            match self.run_once() {
                Ok(report) if !report.requeued.is_empty() || !report.failed.is_empty() => {
                    info!(requeued = report.requeued.len(), failed = report.failed.len(), "watchdog pass");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "watchdog pass failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = shutdown.changed() => {
                    info!("watchdog shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use fleetmend_core::{Job, JobOp};

    use super::*;

    fn watchdog(dir: &Path, stale_after: Duration) -> (FileQueue, HandshakeFlags, Watchdog) {
        let queue = FileQueue::new(dir.join("signals"));
        let flags = HandshakeFlags::new(dir.join("signals"));
        let w = Watchdog::new(
            vec![Arc::new(queue.clone())],
            Arc::new(flags.clone()),
            Arc::new(EventSink::new(dir.join("events"))),
            AuditLog::new(dir.join("audit.csv")),
            LockManager::new(dir.join("locks")),
            WatchdogConfig {
                stale_after,
                flag_stale_after: Duration::ZERO,
                interval: Duration::from_millis(10),
                retention: Duration::from_secs(3600),
            },
        );
        (queue, flags, w)
    }

    fn claim_one(queue: &FileQueue) {
        let ticket = queue.list(JobState::Queue).unwrap().remove(0);
        queue.claim(&ticket).unwrap().unwrap();
    }

    #[test]
    fn fresh_jobs_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, _flags, mut w) = watchdog(dir.path(), Duration::from_secs(600));
        queue.enqueue(&Job::new(JobOp::Drain, "api", "web1")).unwrap();
        claim_one(&queue);

        let report = w.run_once().unwrap();
        assert!(report.requeued.is_empty());
        assert_eq!(queue.list(JobState::InProgress).unwrap().len(), 1);
    }

    #[test]
    fn stuck_job_requeued_once_then_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, _flags, mut w) = watchdog(dir.path(), Duration::ZERO);
        queue.enqueue(&Job::new(JobOp::Drain, "api", "web1")).unwrap();

        claim_one(&queue);
        let report = w.run_once().unwrap();
        assert_eq!(report.requeued.len(), 1);
        assert!(report.requeued[0].ends_with(".requeued.json"));
        let requeued = queue.list(JobState::Queue).unwrap();
        assert!(requeued[0].is_requeued());

        claim_one(&queue);
        let report = w.run_once().unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(queue.list(JobState::Queue).unwrap().is_empty());
        assert_eq!(queue.list(JobState::Failed).unwrap().len(), 1);

        let events = EventSink::new(dir.path().join("events")).read_all().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].text.contains("stuck job"));
    }

    #[test]
    fn unanswered_flag_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let (_queue, flags, mut w) = watchdog(dir.path(), Duration::from_secs(600));
        flags.write_request("web3", "FATAL").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(w.run_once().unwrap().stale_flags, ["web3"]);
        assert!(w.run_once().unwrap().stale_flags.is_empty());

        // Answered flags are not stale.
        flags.write_request("web4", "FATAL").unwrap();
        flags.write_completion("web4", "verify=OK").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(w.run_once().unwrap().stale_flags.is_empty());
    }

    #[test]
    fn concurrent_pass_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (_queue, _flags, mut w) = watchdog(dir.path(), Duration::ZERO);
        let _held = LockManager::new(dir.path().join("locks"))
            .try_acquire(WATCHDOG_LOCK)
            .unwrap()
            .unwrap();
        assert!(w.run_once().unwrap().skipped);
    }

    #[test]
    fn prunes_old_terminal_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, _flags, mut w) = watchdog(dir.path(), Duration::from_secs(600));
        w.config.retention = Duration::ZERO;
        let ticket = queue.enqueue(&Job::new(JobOp::Enable, "api", "web1")).unwrap();
        queue.transition(&ticket, JobState::Done).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(w.run_once().unwrap().pruned, 1);
        assert!(queue.list(JobState::Done).unwrap().is_empty());
    }
}

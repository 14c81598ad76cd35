//! Auto-drain policy: take servers out when a failed restart verification
//! coincides with a burst of 5xx responses, and put them back once the
//! node has verified OK for long enough and errors have calmed down.
//!
//! Each server named after a node is tracked through
//!
//! ```text
//! idle | healed --(verify=FAIL, 5xx delta > drain_5xx)--> drained
//! drained --(verify=OK held heal_after, 5xx delta < heal_5xx)--> healed
//! ```
//!
//! The policy never touches the load balancer directly. It enqueues
//! `drain` + `weight 0` (or `weight 1` + `enable`) jobs on the ops queue,
//! so the admission guard still has the final word. `hrsp_5xx` is a
//! cumulative counter; the delta is taken over samples kept in the state
//! file, which survives restarts of the policy process.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fleetmend_core::config::PolicyConfig;
use fleetmend_core::fsutil::write_atomic;
use fleetmend_core::{
    AuditLog, AuditRow, Event, EventSink, FleetConfig, Job, JobOp, ProviderConfig, ServerState,
    Severity, Verdict,
};
use fleetmend_lb::RuntimeClient;
use fleetmend_store::{FileQueue, FlagStore, HandshakeFlags, JobStore, LockManager, StoreError};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::DispatchResult;

pub const POLICY_LOCK: &str = "policy";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Idle,
    Drained,
    Healed,
}

/// Per-server memory kept between passes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub phase: Phase,
    /// Unix seconds of the last phase change.
    #[serde(default)]
    pub changed_at: u64,
    /// Unix seconds since which `verify=OK` has been seen continuously.
    #[serde(default)]
    pub ok_since: Option<u64>,
    /// `(unix seconds, hrsp_5xx)` samples, oldest first: everything inside
    /// the window plus the newest one before it as the baseline.
    #[serde(default)]
    pub samples: Vec<(u64, u64)>,
}

impl Track {
    /// Record `count` at `now` and return the increase over `window`.
    /// A counter that went backwards (LB reload) restarts the history.
    fn observe(&mut self, now: u64, count: u64, window: Duration) -> u64 {
        if self.samples.last().is_some_and(|&(_, last)| count < last) {
            self.samples.clear();
        }
        let horizon = now.saturating_sub(window.as_secs());
        let baseline = self
            .samples
            .iter()
            .rposition(|&(ts, _)| ts <= horizon)
            .unwrap_or(0);
        self.samples.drain(..baseline);
        self.samples.push((now, count));
        let oldest = self.samples.first().map_or(count, |&(_, c)| c);
        count - oldest.min(count)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyState {
    #[serde(default)]
    pub servers: BTreeMap<String, Track>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PolicyReport {
    /// Another policy pass held the lock; nothing was done.
    pub skipped: bool,
    pub drained: Vec<String>,
    pub healed: Vec<String>,
}

pub struct PolicyWorker {
    runtime: RuntimeClient,
    flags: Arc<dyn FlagStore>,
    queue: Arc<dyn JobStore>,
    events: Arc<EventSink>,
    audit: AuditLog,
    locks: LockManager,
    state_path: PathBuf,
    config: PolicyConfig,
}

impl PolicyWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: RuntimeClient,
        flags: Arc<dyn FlagStore>,
        queue: Arc<dyn JobStore>,
        events: Arc<EventSink>,
        audit: AuditLog,
        locks: LockManager,
        state_path: impl Into<PathBuf>,
        config: PolicyConfig,
    ) -> Self {
        Self {
            runtime,
            flags,
            queue,
            events,
            audit,
            locks,
            state_path: state_path.into(),
            config,
        }
    }

    /// Reads stats from the policy backend's HAProxy socket and enqueues on
    /// the ops queue.
    pub fn from_config(config: &FleetConfig) -> Self {
        let socket = match config.clusters.get(&config.policy.backend).map(|c| &c.provider) {
            Some(ProviderConfig::Haproxy { socket: Some(socket) }) => socket,
            _ => &config.lb.socket,
        };
        Self::new(
            RuntimeClient::new(socket).with_timeouts(config.lb.connect_timeout, config.lb.read_timeout),
            Arc::new(HandshakeFlags::new(config.paths.flags())),
            Arc::new(FileQueue::new(config.paths.ops_queue())),
            Arc::new(EventSink::new(config.paths.events())),
            AuditLog::new(config.paths.audit()),
            LockManager::new(config.paths.locks()),
            config.paths.policy_state(),
            config.policy.clone(),
        )
    }

    pub fn load_state(&self) -> DispatchResult<PolicyState> {
        let bytes = match fs::read(&self.state_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(PolicyState::default()),
            Err(e) => return Err(StoreError::from(e).into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!(path = %self.state_path.display(), error = %e, "unreadable policy state, starting fresh");
                Ok(PolicyState::default())
            }
        }
    }

    fn save_state(&self, state: &PolicyState) -> DispatchResult<()> {
        let body = serde_json::to_vec_pretty(state).map_err(StoreError::from)?;
        write_atomic(&self.state_path, &body).map_err(StoreError::from)?;
        Ok(())
    }

    pub async fn run_once(&self) -> DispatchResult<PolicyReport> {
        self.run_at(SystemTime::now()).await
    }

    /// One pass as of `now`.
    pub async fn run_at(&self, now: SystemTime) -> DispatchResult<PolicyReport> {
        let Some(_lock) = self.locks.try_acquire(POLICY_LOCK)? else {
            debug!("another policy pass is running");
            return Ok(PolicyReport {
                skipped: true,
                ..PolicyReport::default()
            });
        };
        let now = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let servers = self.runtime.servers(&self.config.backend).await?;
        let mut state = self.load_state()?;
        let mut report = PolicyReport::default();

        for server in &servers {
            let track = state.servers.entry(server.server.clone()).or_default();
            let delta = track.observe(now, server.http_5xx, self.config.window);
            let verdict = match self.flags.read_completion(&server.server) {
                Ok(done) => done.map(|d| d.verdict),
                // Not a node name the flag directory can hold.
                Err(StoreError::InvalidNode(_)) => None,
                Err(e) => return Err(e.into()),
            };
            if verdict == Some(Verdict::Ok) {
                track.ok_since.get_or_insert(now);
            } else {
                track.ok_since = None;
            }

            match track.phase {
                Phase::Idle | Phase::Healed
                    if verdict == Some(Verdict::Fail) && delta > self.config.drain_5xx =>
                {
                    let jobs = [
                        Job::new(JobOp::Drain, &self.config.backend, &server.server),
                        Job::new(JobOp::Weight, &self.config.backend, &server.server).with_weight(0),
                    ];
                    if self.enqueue_all(server, &jobs, "drain+weight0", delta) {
                        track.phase = Phase::Drained;
                        track.changed_at = now;
                        report.drained.push(server.server.clone());
                    }
                }
                Phase::Drained
                    if track
                        .ok_since
                        .is_some_and(|since| now.saturating_sub(since) >= self.config.heal_after.as_secs())
                        && delta < self.config.heal_5xx =>
                {
                    let jobs = [
                        Job::new(JobOp::Weight, &self.config.backend, &server.server).with_weight(1),
                        Job::new(JobOp::Enable, &self.config.backend, &server.server),
                    ];
                    if self.enqueue_all(server, &jobs, "enable+weight1", delta) {
                        track.phase = Phase::Healed;
                        track.changed_at = now;
                        report.healed.push(server.server.clone());
                    }
                }
                _ => {}
            }
        }

        self.save_state(&state)?;
        Ok(report)
    }

    /// Enqueue `jobs` for `server`. The transition counts when at least one
    /// job made it onto the queue.
    fn enqueue_all(&self, server: &ServerState, jobs: &[Job], label: &str, delta: u64) -> bool {
        let key = format!("{}/{}", server.backend, server.server);
        let mut queued = 0;
        for job in jobs {
            match self.queue.enqueue(job) {
                Ok(ticket) => {
                    debug!(job = %ticket.name, "policy job queued");
                    queued += 1;
                }
                Err(e) => warn!(%key, op = %job.op, error = %e, "failed to queue policy job"),
            }
        }
        if queued == 0 {
            return false;
        }

        let (severity, action) = if label.starts_with("drain") {
            (Severity::Warn, "auto_drain")
        } else {
            (Severity::Info, "auto_heal")
        };
        info!(%key, %label, delta_5xx = delta, "policy transition queued");
        self.events.emit_or_log(Event::new(
            severity,
            "policy",
            &server.server,
            format!("auto-drain: {label} {key} (5xx +{delta})"),
        ));
        if let Err(e) = self.audit.append(
            &AuditRow::new(&server.server, "policy")
                .severity(severity)
                .action(action)
                .result(if queued == jobs.len() { "QUEUED" } else { "PARTIAL" })
                .note(format!("{label} {key} 5xx+{delta}")),
        ) {
            warn!(error = %e, "failed to append audit row");
        }
        true
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(backend = %self.config.backend, interval = ?self.config.interval, "policy worker started");
        loop {
            match self.run_once().await {
                Ok(report) if !report.drained.is_empty() || !report.healed.is_empty() => {
                    info!(drained = ?report.drained, healed = ?report.healed, "policy pass");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "policy pass failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = shutdown.changed() => {
                    info!("policy worker shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use fleetmend_lb::testing::FakeLb;
    use fleetmend_store::JobState;

    use super::*;

    struct Fixture {
        lb: FakeLb,
        flags: HandshakeFlags,
        queue: FileQueue,
        events: Arc<EventSink>,
        policy: PolicyWorker,
    }

    async fn fixture(dir: &Path) -> Fixture {
        let lb = FakeLb::start(dir, &[("api", &["web1", "web2"])]).await;
        let flags = HandshakeFlags::new(dir.join("signals"));
        let queue = FileQueue::new(dir.join("signals/ops"));
        let events = Arc::new(EventSink::new(dir.join("events")));
        let policy = PolicyWorker::new(
            lb.client(),
            Arc::new(flags.clone()),
            Arc::new(queue.clone()),
            Arc::clone(&events),
            AuditLog::new(dir.join("audit.csv")),
            LockManager::new(dir.join("locks")),
            dir.join("report/policy_state.json"),
            PolicyConfig {
                backend: "api".to_string(),
                drain_5xx: 20,
                heal_5xx: 2,
                heal_after: Duration::from_secs(600),
                window: Duration::from_secs(300),
                interval: Duration::from_millis(10),
            },
        );
        Fixture {
            lb,
            flags,
            queue,
            events,
            policy,
        }
    }

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_800_000_000 + secs)
    }

    fn queued_ops(queue: &FileQueue) -> Vec<(JobOp, Option<u32>)> {
        let mut ops: Vec<_> = queue
            .list(JobState::Queue)
            .unwrap()
            .iter()
            .map(|t| {
                let job = queue.load(t).unwrap();
                (job.op, job.weight())
            })
            .collect();
        ops.sort_by_key(|(op, w)| (op.as_str(), *w));
        ops
    }

    fn clear_queue(queue: &FileQueue) {
        for ticket in queue.list(JobState::Queue).unwrap() {
            std::fs::remove_file(&ticket.path).unwrap();
        }
    }

    #[tokio::test]
    async fn failed_verify_with_5xx_burst_drains() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path()).await;
        f.flags.write_completion("web1", "stop_rc=0 start_rc=0 verify=FAIL").unwrap();

        // First sample only sets the baseline.
        assert!(f.policy.run_at(at(0)).await.unwrap().drained.is_empty());
        f.lb.add_5xx("api", "web1", 25);
        let report = f.policy.run_at(at(60)).await.unwrap();

        assert_eq!(report.drained, ["web1"]);
        assert_eq!(
            queued_ops(&f.queue),
            [(JobOp::Drain, None), (JobOp::Weight, Some(0))]
        );
        let state = f.policy.load_state().unwrap();
        assert_eq!(state.servers["web1"].phase, Phase::Drained);
        assert_eq!(state.servers["web2"].phase, Phase::Idle);
        // Jobs are only queued; the ops worker applies them.
        assert!(f.lb.mutations().is_empty());
        assert!(
            f.events
                .read_all()
                .unwrap()
                .iter()
                .any(|e| e.node == "web1" && e.severity == Severity::Warn)
        );

        // Already drained: no second round of jobs.
        clear_queue(&f.queue);
        f.lb.add_5xx("api", "web1", 50);
        assert!(f.policy.run_at(at(120)).await.unwrap().drained.is_empty());
        assert!(queued_ops(&f.queue).is_empty());
    }

    #[tokio::test]
    async fn errors_without_failed_verify_do_not_drain() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path()).await;
        f.flags.write_completion("web2", "verify=OK").unwrap();

        f.policy.run_at(at(0)).await.unwrap();
        f.lb.add_5xx("api", "web1", 100);
        f.lb.add_5xx("api", "web2", 100);
        let report = f.policy.run_at(at(60)).await.unwrap();

        assert!(report.drained.is_empty());
        assert!(queued_ops(&f.queue).is_empty());
    }

    #[tokio::test]
    async fn burst_older_than_window_does_not_count() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path()).await;
        f.flags.write_completion("web1", "verify=FAIL").unwrap();

        f.policy.run_at(at(0)).await.unwrap();
        f.lb.add_5xx("api", "web1", 30);
        f.policy.run_at(at(10)).await.unwrap();
        clear_queue(&f.queue);

        // Back to idle, then look again a window later with no new errors.
        let mut state = f.policy.load_state().unwrap();
        state.servers.get_mut("web1").unwrap().phase = Phase::Idle;
        f.policy.save_state(&state).unwrap();
        let report = f.policy.run_at(at(10 + 301)).await.unwrap();
        assert!(report.drained.is_empty());
    }

    #[tokio::test]
    async fn verified_node_heals_after_quiet_period() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path()).await;
        f.flags.write_completion("web1", "verify=FAIL").unwrap();
        f.policy.run_at(at(0)).await.unwrap();
        f.lb.add_5xx("api", "web1", 25);
        assert_eq!(f.policy.run_at(at(60)).await.unwrap().drained, ["web1"]);
        clear_queue(&f.queue);

        // Restart verified; errors stop.
        f.flags.write_completion("web1", "verify=OK").unwrap();
        f.policy.run_at(at(400)).await.unwrap();
        // OK has held for less than heal_after.
        assert!(f.policy.run_at(at(700)).await.unwrap().healed.is_empty());
        let report = f.policy.run_at(at(1000)).await.unwrap();

        assert_eq!(report.healed, ["web1"]);
        assert_eq!(
            queued_ops(&f.queue),
            [(JobOp::Enable, None), (JobOp::Weight, Some(1))]
        );
        assert_eq!(f.policy.load_state().unwrap().servers["web1"].phase, Phase::Healed);
    }

    #[tokio::test]
    async fn heal_waits_for_errors_to_calm_down() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path()).await;
        f.flags.write_completion("web1", "verify=FAIL").unwrap();
        f.policy.run_at(at(0)).await.unwrap();
        f.lb.add_5xx("api", "web1", 25);
        f.policy.run_at(at(60)).await.unwrap();
        clear_queue(&f.queue);

        f.flags.write_completion("web1", "verify=OK").unwrap();
        f.policy.run_at(at(100)).await.unwrap();
        f.lb.add_5xx("api", "web1", 5);
        assert!(f.policy.run_at(at(800)).await.unwrap().healed.is_empty());
        assert!(queued_ops(&f.queue).is_empty());

        // A window later with no new errors.
        assert_eq!(f.policy.run_at(at(1200)).await.unwrap().healed, ["web1"]);
    }

    #[tokio::test]
    async fn losing_the_ok_verdict_restarts_the_heal_clock() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path()).await;
        f.flags.write_completion("web1", "verify=FAIL").unwrap();
        f.policy.run_at(at(0)).await.unwrap();
        f.lb.add_5xx("api", "web1", 25);
        f.policy.run_at(at(60)).await.unwrap();

        f.flags.write_completion("web1", "verify=OK").unwrap();
        f.policy.run_at(at(100)).await.unwrap();
        f.flags.cleanup("web1").unwrap();
        f.policy.run_at(at(200)).await.unwrap();
        f.flags.write_completion("web1", "verify=OK").unwrap();
        f.policy.run_at(at(300)).await.unwrap();

        // 800s after the first OK, but only 500s after the current one.
        assert!(f.policy.run_at(at(800)).await.unwrap().healed.is_empty());
        assert_eq!(f.policy.run_at(at(900)).await.unwrap().healed, ["web1"]);
    }

    #[test]
    fn counter_reset_restarts_history() {
        let window = Duration::from_secs(300);
        let mut track = Track::default();
        assert_eq!(track.observe(0, 100, window), 0);
        assert_eq!(track.observe(60, 130, window), 30);
        // LB reloaded: counters start over.
        assert_eq!(track.observe(120, 4, window), 0);
        assert_eq!(track.observe(180, 10, window), 6);
        assert_eq!(track.observe(1000, 10, window), 0);
    }

    #[tokio::test]
    async fn unreadable_state_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path()).await;
        std::fs::create_dir_all(dir.path().join("report")).unwrap();
        std::fs::write(dir.path().join("report/policy_state.json"), "{not json").unwrap();

        f.policy.run_at(at(0)).await.unwrap();
        let state = f.policy.load_state().unwrap();
        assert_eq!(state.servers.len(), 2);
    }
}

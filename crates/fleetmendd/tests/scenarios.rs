//! End-to-end scenarios across crates, against a fake HAProxy admin socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fleetmend_core::config::{DispatcherConfig, OpsConfig, PolicyConfig, WatchdogConfig, WorkerConfig};
use fleetmend_core::{AuditLog, EventSink, GuardAction, Job, JobOp, RestartSpec, Severity};
use fleetmend_detector::{Decision, Detector, Gate, LogLine, Mode, RuleSet};
use fleetmend_dispatch::{Dispatcher, OpsWorker, PolicyWorker, Watchdog};
use fleetmend_guard::{Admission, AdmissionGuard, CapacityFloor, DeferredLedger};
use fleetmend_lb::testing::FakeLb;
use fleetmend_lb::{ConfigPatcher, Provider, Providers};
use fleetmend_restart::NodeWorker;
use fleetmend_store::{FileQueue, FlagStore, HandshakeFlags, JobState, JobStore, LockManager};
use tokio::sync::watch;

const SERVERS: [&str; 5] = ["web1", "web2", "web3", "web4", "web5"];

struct Site {
    dir: tempfile::TempDir,
    lb: FakeLb,
    guard: AdmissionGuard,
}

impl Site {
    async fn new(servers: &[&str], min_enabled: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let lb = FakeLb::start(dir.path(), &[("api", servers)]).await;
        let locks = LockManager::new(dir.path().join("locks"));
        let guard = AdmissionGuard::new(
            Providers::new(Provider::Haproxy(lb.client())),
            locks.clone(),
            DeferredLedger::new(dir.path().join("deferred.csv"), locks, Duration::from_secs(2)),
            CapacityFloor::uniform(min_enabled),
        );
        Self { dir, lb, guard }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn queue(&self) -> FileQueue {
        FileQueue::new(self.path("queue"))
    }

    fn flags(&self) -> HandshakeFlags {
        HandshakeFlags::new(self.path("flags"))
    }

    fn audit(&self) -> AuditLog {
        AuditLog::new(self.path("audit.csv"))
    }

    fn events(&self) -> EventSink {
        EventSink::new(self.path("events"))
    }

    fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            Arc::new(self.queue()),
            Arc::new(self.flags()),
            self.audit(),
            Arc::new(self.events()),
            DispatcherConfig {
                stagger: Duration::ZERO,
                worker_wait: Duration::from_secs(5),
                poll_interval: Duration::from_millis(20),
                ..DispatcherConfig::default()
            },
        )
        .with_guard(self.guard.clone())
    }

    /// Spawn a node worker answering restart flags for `node`.
    fn spawn_worker(&self, node: &str, stop_cmd: &str) -> watch::Sender<bool> {
        let worker = NodeWorker::new(
            node,
            Arc::new(self.flags()),
            WorkerConfig {
                stop_cmd: stop_cmd.to_string(),
                start_cmd: "true".to_string(),
                verify_cmd: None,
                settle: Duration::ZERO,
                poll_interval: Duration::from_millis(20),
                command_timeout: Duration::from_secs(5),
                ..WorkerConfig::default()
            },
        );
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move { worker.run(rx).await });
        tx
    }

    fn phases(&self) -> Vec<(String, String)> {
        self.audit()
            .read_all()
            .unwrap()
            .into_iter()
            .map(|r| (r.phase, r.result))
            .collect()
    }
}

fn restart_job(node: &str) -> Job {
    let spec = RestartSpec {
        node: node.to_string(),
        reason: "FATAL in app.log".to_string(),
        ..RestartSpec::default()
    };
    Job::restart(&spec, "api", node)
}

#[tokio::test]
async fn scenario_a_drain_at_floor_is_deferred() {
    let site = Site::new(&SERVERS[..4], 4).await;

    let admission = site.guard.apply(GuardAction::Drain, "api", "web1").await.unwrap();

    let Admission::Deferred(assessment) = admission else {
        panic!("expected deferral, got {admission:?}");
    };
    assert_eq!((assessment.enabled_now, assessment.would_left), (4, 3));
    assert!(site.lb.mutations().is_empty());
    let ledger = site.guard.ledger().read().unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].action, GuardAction::Drain);
    assert_eq!(ledger[0].server, "web1");
}

#[tokio::test]
async fn scenario_b_drain_above_floor_is_applied() {
    let site = Site::new(&SERVERS, 4).await;

    let admission = site.guard.apply(GuardAction::Drain, "api", "web1").await.unwrap();

    assert_eq!(admission, Admission::Applied);
    assert_eq!(site.lb.mutations(), ["set server api/web1 state drain"]);
    assert_eq!(site.lb.enabled_count("api"), 4);
    assert!(site.guard.ledger().read().unwrap().is_empty());

    // A second drain would now cross the floor.
    let second = site.guard.apply(GuardAction::Drain, "api", "web2").await.unwrap();
    assert!(!second.is_applied());
}

#[tokio::test]
async fn scenario_c_verified_restart_restores_node() {
    let site = Site::new(&SERVERS, 4).await;
    let _worker = site.spawn_worker("web1", "true");
    site.queue().enqueue(&restart_job("web1")).unwrap();

    let mut dispatcher = site.dispatcher();
    let report = dispatcher.run_once().await.unwrap();
    assert_eq!(report.started, ["web1"]);
    dispatcher.wait_idle().await;

    assert_eq!(site.queue().list(JobState::Done).unwrap().len(), 1);
    assert_eq!(
        site.lb.mutations(),
        ["set server api/web1 state drain", "set server api/web1 state ready"]
    );
    assert_eq!(site.lb.status("api", "web1").as_deref(), Some("UP"));
    assert!(!site.path("flags/restart_web1.txt").exists());
    assert!(!site.path("flags/done_web1.txt").exists());

    let phases = site.phases();
    assert!(phases.contains(&("uncomment".to_string(), "OK".to_string())), "{phases:?}");
    assert!(phases.contains(&("dispatch".to_string(), "done".to_string())), "{phases:?}");
    assert_eq!(dispatcher.state().active_count(), 0);
}

#[tokio::test]
async fn scenario_d_failed_verify_leaves_node_out() {
    let site = Site::new(&SERVERS, 4).await;
    let _worker = site.spawn_worker("web2", "false");
    site.queue().enqueue(&restart_job("web2")).unwrap();

    let mut dispatcher = site.dispatcher();
    dispatcher.run_once().await.unwrap();
    dispatcher.wait_idle().await;

    assert_eq!(site.queue().list(JobState::Failed).unwrap().len(), 1);
    // Drained and never re-enabled.
    assert_eq!(site.lb.mutations(), ["set server api/web2 state drain"]);
    assert_eq!(site.lb.status("api", "web2").as_deref(), Some("DRAIN"));
    assert!(!site.path("flags/restart_web2.txt").exists());
    assert!(!site.path("flags/done_web2.txt").exists());

    let events = site.events().read_all().unwrap();
    assert!(
        events
            .iter()
            .any(|e| e.node == "web2" && e.severity == Severity::Critical),
        "{events:?}"
    );
}

#[tokio::test]
async fn scenario_e_stuck_job_requeued_then_failed() {
    let site = Site::new(&SERVERS, 4).await;
    let queue = site.queue();
    queue.enqueue(&Job::new(JobOp::Drain, "api", "web1")).unwrap();
    let mut watchdog = Watchdog::new(
        vec![Arc::new(queue.clone())],
        Arc::new(site.flags()),
        Arc::new(site.events()),
        site.audit(),
        LockManager::new(site.path("locks")),
        WatchdogConfig {
            stale_after: Duration::ZERO,
            flag_stale_after: Duration::from_secs(3600),
            interval: Duration::from_millis(10),
            retention: Duration::from_secs(3600),
        },
    );

    claim_first(&queue);
    let first = watchdog.run_once().unwrap();
    assert_eq!(first.requeued.len(), 1);
    assert!(queue.list(JobState::Queue).unwrap()[0].is_requeued());

    claim_first(&queue);
    let second = watchdog.run_once().unwrap();
    assert_eq!(second.failed.len(), 1);
    assert!(queue.list(JobState::Queue).unwrap().is_empty());
    assert!(queue.list(JobState::InProgress).unwrap().is_empty());
    assert_eq!(queue.list(JobState::Failed).unwrap().len(), 1);
}

fn claim_first(queue: &FileQueue) {
    let ticket = queue.list(JobState::Queue).unwrap().remove(0);
    queue.claim(&ticket).unwrap().unwrap();
}

#[tokio::test]
async fn detector_queue_mode_feeds_dispatcher() {
    let site = Site::new(&SERVERS, 4).await;
    let _worker = site.spawn_worker("web3", "true");
    let mut detector = Detector::new(
        "web3",
        RuleSet::defaults().unwrap(),
        Gate::new(Duration::from_secs(5), Duration::from_secs(60)),
        Mode::Queue {
            queue: Arc::new(site.queue()),
            backend: "api".to_string(),
            server: "web3".to_string(),
            take_out_cmd: None,
            restore_cmd: None,
        },
        site.audit(),
        Arc::new(site.events()),
    );
    let line = |text: &str| LogLine {
        path: Path::new("/var/log/app/app.log").to_path_buf(),
        line: text.to_string(),
    };

    let decision = detector
        .handle_line(&line("2024-05-01 FATAL: out of memory"))
        .await
        .unwrap();
    assert!(matches!(decision, Decision::Enqueued(_)), "{decision:?}");
    // Same signature again right away: debounced, nothing enqueued.
    let again = detector
        .handle_line(&line("2024-05-01 FATAL: out of memory"))
        .await
        .unwrap();
    assert!(matches!(again, Decision::Blocked(_)), "{again:?}");
    assert_eq!(site.queue().list(JobState::Queue).unwrap().len(), 1);

    let mut dispatcher = site.dispatcher();
    dispatcher.run_once().await.unwrap();
    dispatcher.wait_idle().await;

    assert_eq!(site.queue().list(JobState::Done).unwrap().len(), 1);
    assert_eq!(site.lb.status("api", "web3").as_deref(), Some("UP"));
}

#[tokio::test]
async fn policy_drain_goes_through_ops_worker() {
    let site = Site::new(&SERVERS, 4).await;
    let ops_queue = FileQueue::new(site.path("queue/ops"));
    let policy = PolicyWorker::new(
        site.lb.client(),
        Arc::new(site.flags()),
        Arc::new(ops_queue.clone()),
        Arc::new(site.events()),
        site.audit(),
        LockManager::new(site.path("locks")),
        site.path("report/policy_state.json"),
        PolicyConfig::default(),
    );
    let ops = OpsWorker::new(
        Arc::new(ops_queue.clone()),
        site.guard.clone(),
        ConfigPatcher::new(site.path("haproxy.cfg"), LockManager::new(site.path("locks"))),
        OpsConfig::default(),
        site.audit(),
    );
    let start = std::time::SystemTime::now();

    site.flags().write_completion("web2", "stop_rc=0 start_rc=1 verify=FAIL").unwrap();
    policy.run_at(start).await.unwrap();
    site.lb.add_5xx("api", "web2", 40);
    let report = policy.run_at(start + Duration::from_secs(60)).await.unwrap();
    assert_eq!(report.drained, ["web2"]);

    let applied = ops.run_once().await.unwrap();
    assert_eq!(applied.done, 2);
    assert_eq!(site.lb.status("api", "web2").as_deref(), Some("DRAIN"));
    assert_eq!(site.lb.weight("api", "web2"), Some(0));
    assert_eq!(ops_queue.list(JobState::Done).unwrap().len(), 2);
}

//! Directory-backed job queue.
//!
//! A job is a JSON file living in exactly one of four state directories
//! under the queue root. Moving between states is a single `rename(2)`
//! within one filesystem, so a claim has exactly one winner and a crashed
//! process never leaves a half-moved job behind.

use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use fleetmend_core::Job;
use fleetmend_core::fsutil::age_of;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

/// Infix marking a job that the watchdog has already requeued once.
pub const REQUEUED_INFIX: &str = ".requeued";

/// State directory a job currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Queue,
    InProgress,
    Done,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 4] = [Self::Queue, Self::InProgress, Self::Done, Self::Failed];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::InProgress => "inprogress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Handle to a job file in a known state. Cheap to clone; holds no lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTicket {
    pub name: String,
    pub state: JobState,
    pub path: PathBuf,
}

impl JobTicket {
    /// Whether the watchdog has already requeued this job once.
    pub fn is_requeued(&self) -> bool {
        self.name.contains(&format!("{REQUEUED_INFIX}."))
    }
}

/// Result of claiming and parsing a job in one step.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// Another consumer renamed the file first.
    Lost,
    /// Exclusively owned and parsed.
    Claimed(JobTicket, Job),
    /// Claimed but unparseable; already moved to `failed`.
    Malformed(JobTicket, String),
}

/// Storage interface for jobs. The directory queue is the only
/// implementation; a broker or database slots in here.
pub trait JobStore: Send + Sync {
    /// Persist a new job into `queue`.
    fn enqueue(&self, job: &Job) -> StoreResult<JobTicket>;

    /// Tickets in `state`, sorted by file name (oldest first).
    fn list(&self, state: JobState) -> StoreResult<Vec<JobTicket>>;

    /// Move a queued job to `inprogress`. `None` means another consumer won.
    fn claim(&self, ticket: &JobTicket) -> StoreResult<Option<JobTicket>>;

    fn load(&self, ticket: &JobTicket) -> StoreResult<Job>;

    fn transition(&self, ticket: &JobTicket, to: JobState) -> StoreResult<JobTicket>;

    /// Move a stale in-progress job back to `queue`, tagging its name.
    fn requeue_stale(&self, ticket: &JobTicket) -> StoreResult<JobTicket>;

    /// Tickets in `state` with their age since last state change.
    fn aged(&self, state: JobState) -> StoreResult<Vec<(JobTicket, Duration)>>;

    /// Delete entries in `state` older than `older_than`. Returns the count.
    fn prune(&self, state: JobState, older_than: Duration) -> StoreResult<usize>;

    /// Claim, then parse. A claimed job that fails to parse goes straight
    /// to `failed` so it never lingers in `inprogress`.
    fn claim_and_load(&self, ticket: &JobTicket) -> StoreResult<ClaimOutcome> {
        let Some(claimed) = self.claim(ticket)? else {
            return Ok(ClaimOutcome::Lost);
        };
        match self.load(&claimed) {
            Ok(job) => Ok(ClaimOutcome::Claimed(claimed, job)),
            Err(StoreError::Malformed { reason, .. }) => {
                warn!(job = %claimed.name, %reason, "malformed job, moving to failed");
                let failed = self.transition(&claimed, JobState::Failed)?;
                Ok(ClaimOutcome::Malformed(failed, reason))
            }
            Err(e) => Err(e),
        }
    }
}

/// [`JobStore`] over `<root>/{queue,inprogress,done,failed}`.
#[derive(Debug, Clone)]
pub struct FileQueue {
    root: PathBuf,
}

impl FileQueue {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, state: JobState) -> PathBuf {
        self.root.join(state.dir_name())
    }

    fn ensure_dir(&self, state: JobState) -> io::Result<PathBuf> {
        let dir = self.dir(state);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn ticket(&self, name: &str, state: JobState) -> JobTicket {
        JobTicket {
            name: name.to_string(),
            state,
            path: self.dir(state).join(name),
        }
    }

    /// Rename a ticket into `to` under `new_name`. A missing source maps
    /// to `None`.
    fn move_to(
        &self,
        ticket: &JobTicket,
        to: JobState,
        new_name: &str,
    ) -> StoreResult<Option<JobTicket>> {
        self.ensure_dir(to)?;
        let dest = self.ticket(new_name, to);
        match fs::rename(&ticket.path, &dest.path) {
            Ok(()) => {
                debug!(job = %ticket.name, from = %ticket.state, to = %to, "job moved");
                Ok(Some(dest))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_job_file(name: &str) -> bool {
    !name.starts_with('.') && name.ends_with(".json")
}

/// Refresh mtime so staleness is measured from the latest state change.
fn touch(path: &Path) -> io::Result<()> {
    File::options()
        .write(true)
        .open(path)?
        .set_modified(SystemTime::now())
}

impl JobStore for FileQueue {
    fn enqueue(&self, job: &Job) -> StoreResult<JobTicket> {
        let dir = self.ensure_dir(JobState::Queue)?;
        let name = job.file_name();
        let body = serde_json::to_vec_pretty(job)?;
        // Dot-prefixed temp in the same directory: list() ignores it and
        // the rename is atomic.
        let tmp = dir.join(format!(".{name}.tmp"));
        fs::write(&tmp, body)?;
        let ticket = self.ticket(&name, JobState::Queue);
        if let Err(e) = fs::rename(&tmp, &ticket.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        info!(job = %name, op = %job.op, backend = %job.backend, server = %job.server, "job enqueued");
        Ok(ticket)
    }

    fn list(&self, state: JobState) -> StoreResult<Vec<JobTicket>> {
        let entries = match fs::read_dir(self.dir(state)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| is_job_file(n))
            .collect();
        names.sort();
        Ok(names.iter().map(|n| self.ticket(n, state)).collect())
    }

    fn claim(&self, ticket: &JobTicket) -> StoreResult<Option<JobTicket>> {
        let claimed = self.move_to(ticket, JobState::InProgress, &ticket.name)?;
        if let Some(claimed) = &claimed {
            if let Err(e) = touch(&claimed.path) {
                warn!(job = %claimed.name, error = %e, "failed to refresh claim time");
            }
        }
        Ok(claimed)
    }

    fn load(&self, ticket: &JobTicket) -> StoreResult<Job> {
        let bytes = match fs::read(&ticket.path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::Gone(ticket.name.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Malformed {
            name: ticket.name.clone(),
            reason: e.to_string(),
        })
    }

    fn transition(&self, ticket: &JobTicket, to: JobState) -> StoreResult<JobTicket> {
        let moved = self
            .move_to(ticket, to, &ticket.name)?
            .ok_or_else(|| StoreError::Gone(ticket.name.clone()))?;
        if let Err(e) = touch(&moved.path) {
            warn!(job = %moved.name, error = %e, "failed to refresh transition time");
        }
        Ok(moved)
    }

    fn requeue_stale(&self, ticket: &JobTicket) -> StoreResult<JobTicket> {
        let new_name = if ticket.is_requeued() {
            ticket.name.clone()
        } else {
            let stem = ticket.name.strip_suffix(".json").unwrap_or(&ticket.name);
            format!("{stem}{REQUEUED_INFIX}.json")
        };
        let moved = self
            .move_to(ticket, JobState::Queue, &new_name)?
            .ok_or_else(|| StoreError::Gone(ticket.name.clone()))?;
        info!(job = %moved.name, "stale job requeued");
        Ok(moved)
    }

    fn aged(&self, state: JobState) -> StoreResult<Vec<(JobTicket, Duration)>> {
        let mut out = Vec::new();
        for ticket in self.list(state)? {
            match age_of(&ticket.path) {
                Ok(age) => out.push((ticket, age)),
                // Moved by someone else between list and stat.
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }

    fn prune(&self, state: JobState, older_than: Duration) -> StoreResult<usize> {
        let mut removed = 0;
        for (ticket, age) in self.aged(state)? {
            if age > older_than && fleetmend_core::fsutil::remove_if_exists(&ticket.path)? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(state = %state, removed, "pruned old jobs");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fleetmend_core::JobOp;

    use super::*;

    fn job_at(ts: &str, server: &str) -> Job {
        let mut job = Job::new(JobOp::Drain, "api", server);
        job.created_at = ts.to_string();
        job
    }

    #[test]
    fn enqueue_list_is_fifo_and_ignores_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let q = FileQueue::new(dir.path());
        q.enqueue(&job_at("20261017_100000002", "b")).unwrap();
        q.enqueue(&job_at("20261017_100000001", "a")).unwrap();
        q.enqueue(&job_at("20261017_100000003", "c")).unwrap();
        fs::write(q.dir(JobState::Queue).join(".partial.json.tmp"), "{").unwrap();
        fs::write(q.dir(JobState::Queue).join("README"), "x").unwrap();

        let servers: Vec<String> = q
            .list(JobState::Queue)
            .unwrap()
            .iter()
            .map(|t| q.load(t).unwrap().server)
            .collect();
        assert_eq!(servers, ["a", "b", "c"]);
    }

    #[test]
    fn list_on_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let q = FileQueue::new(dir.path().join("nowhere"));
        assert!(q.list(JobState::Failed).unwrap().is_empty());
    }

    #[test]
    fn second_claim_loses() {
        let dir = tempfile::tempdir().unwrap();
        let q = FileQueue::new(dir.path());
        let ticket = q.enqueue(&Job::new(JobOp::Enable, "api", "web1")).unwrap();

        let first = q.claim(&ticket).unwrap();
        assert!(first.is_some());
        assert!(q.claim(&ticket).unwrap().is_none());
        assert!(matches!(q.claim_and_load(&ticket).unwrap(), ClaimOutcome::Lost));
        assert_eq!(q.list(JobState::InProgress).unwrap().len(), 1);
        assert!(q.list(JobState::Queue).unwrap().is_empty());
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let q = Arc::new(FileQueue::new(dir.path()));
        let ticket = q.enqueue(&Job::new(JobOp::Disable, "api", "web1")).unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let q = Arc::clone(&q);
                let ticket = ticket.clone();
                std::thread::spawn(move || q.claim(&ticket).unwrap().is_some())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn malformed_job_goes_to_failed() {
        let dir = tempfile::tempdir().unwrap();
        let q = FileQueue::new(dir.path());
        let queue_dir = q.ensure_dir(JobState::Queue).unwrap();
        fs::write(queue_dir.join("rq_20261017_000000000_be_srv_bad.json"), "{nope").unwrap();

        let ticket = q.list(JobState::Queue).unwrap().remove(0);
        match q.claim_and_load(&ticket).unwrap() {
            ClaimOutcome::Malformed(t, _) => assert_eq!(t.state, JobState::Failed),
            other => panic!("expected malformed, got {other:?}"),
        }
        assert!(q.list(JobState::InProgress).unwrap().is_empty());
        assert_eq!(q.list(JobState::Failed).unwrap().len(), 1);
    }

    #[test]
    fn requeue_adds_sentinel_once() {
        let dir = tempfile::tempdir().unwrap();
        let q = FileQueue::new(dir.path());
        let job = Job::new(JobOp::Restart, "api", "web1");
        let ticket = q.enqueue(&job).unwrap();
        let claimed = q.claim(&ticket).unwrap().unwrap();
        assert!(!claimed.is_requeued());

        let requeued = q.requeue_stale(&claimed).unwrap();
        assert_eq!(requeued.state, JobState::Queue);
        assert!(requeued.is_requeued());
        assert!(requeued.name.ends_with(".requeued.json"));
        // Still a valid job and still sorts by its original timestamp.
        assert_eq!(q.load(&requeued).unwrap().id, job.id);
        assert!(requeued.name.starts_with(&ticket.name[..ticket.name.len() - 5]));

        let again = q.claim(&requeued).unwrap().unwrap();
        let done = q.transition(&again, JobState::Done).unwrap();
        assert!(done.is_requeued());
    }

    #[test]
    fn transition_of_missing_job_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let q = FileQueue::new(dir.path());
        let ghost = q.ticket("rq_x.json", JobState::InProgress);
        assert!(matches!(
            q.transition(&ghost, JobState::Done),
            Err(StoreError::Gone(_))
        ));
    }

    #[test]
    fn prune_removes_only_old_entries() {
        let dir = tempfile::tempdir().unwrap();
        let q = FileQueue::new(dir.path());
        let t = q.enqueue(&Job::new(JobOp::Enable, "api", "web1")).unwrap();
        let claimed = q.claim(&t).unwrap().unwrap();
        q.transition(&claimed, JobState::Done).unwrap();

        assert_eq!(q.prune(JobState::Done, Duration::from_secs(3600)).unwrap(), 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(q.prune(JobState::Done, Duration::from_millis(1)).unwrap(), 1);
        assert!(q.list(JobState::Done).unwrap().is_empty());
    }
}

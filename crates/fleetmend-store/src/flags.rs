//! Request/completion handshake between the controller and node workers.
//!
//! The controller drops `restart_<node>.txt` (timestamp + reason); the
//! worker on that node consumes it, restarts its service, and answers with
//! `done_<node>.txt`. Only the case-insensitive `verify=ok` /
//! `verify=fail` substrings of the answer are authoritative. Either side
//! may delete a flag that is already gone.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fleetmend_core::fsutil::{age_of, remove_if_exists, write_atomic};
use fleetmend_core::{Completion, host, time};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

const REQUEST_PREFIX: &str = "restart_";
const COMPLETION_PREFIX: &str = "done_";
const FLAG_SUFFIX: &str = ".txt";

/// Flag storage interface; the flag directory is the only implementation.
pub trait FlagStore: Send + Sync {
    /// Ask `node` to restart. Overwrites a previous request.
    fn write_request(&self, node: &str, reason: &str) -> StoreResult<()>;

    fn has_request(&self, node: &str) -> bool;

    /// Consume a pending request, returning its text.
    fn take_request(&self, node: &str) -> StoreResult<Option<String>>;

    fn write_completion(&self, node: &str, text: &str) -> StoreResult<()>;

    fn read_completion(&self, node: &str) -> StoreResult<Option<Completion>>;

    /// Remove both flags for `node`. Idempotent.
    fn cleanup(&self, node: &str) -> StoreResult<()>;

    /// Requests older than `older_than` with no completion, as
    /// `(node, age)`.
    fn stale_requests(&self, older_than: Duration) -> StoreResult<Vec<(String, Duration)>>;
}

/// Poll for `node`'s completion flag every `interval` until `timeout`.
/// `None` means the node never answered.
pub async fn wait_for_completion(
    flags: &dyn FlagStore,
    node: &str,
    timeout: Duration,
    interval: Duration,
) -> StoreResult<Option<Completion>> {
    let started = Instant::now();
    loop {
        if let Some(done) = flags.read_completion(node)? {
            debug!(%node, verdict = %done.verdict, "completion flag seen");
            return Ok(Some(done));
        }
        let elapsed = started.elapsed();
        if elapsed >= timeout {
            return Ok(None);
        }
        tokio::time::sleep(interval.min(timeout - elapsed)).await;
    }
}

/// [`FlagStore`] over a flag directory.
#[derive(Debug, Clone)]
pub struct HandshakeFlags {
    dir: PathBuf,
}

impl HandshakeFlags {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Node names are used as-is; callers should go through
    /// [`check_node`] before touching the filesystem.
    pub fn request_path(&self, node: &str) -> PathBuf {
        self.dir.join(format!("{REQUEST_PREFIX}{node}{FLAG_SUFFIX}"))
    }

    pub fn completion_path(&self, node: &str) -> PathBuf {
        self.dir.join(format!("{COMPLETION_PREFIX}{node}{FLAG_SUFFIX}"))
    }
}

/// Reject node names that would escape the flag directory. Everything else,
/// underscores included, is kept verbatim so both sides agree on the name.
pub fn check_node(node: &str) -> StoreResult<&str> {
    if node.is_empty() || node == "." || node == ".." || node.contains(['/', '\0']) {
        return Err(StoreError::InvalidNode(node.to_string()));
    }
    Ok(node)
}

fn read_optional(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

impl FlagStore for HandshakeFlags {
    fn write_request(&self, node: &str, reason: &str) -> StoreResult<()> {
        // Reasons are free text; keep the flag a single line.
        let reason = reason.replace(['\n', '\r'], " ");
        let node = check_node(node)?;
        let body = format!("ts={} host={} reason={reason}\n", time::stamp(), host::hostname());
        write_atomic(&self.request_path(node), body.as_bytes())?;
        info!(%node, "restart flag written");
        Ok(())
    }

    fn has_request(&self, node: &str) -> bool {
        check_node(node).is_ok_and(|node| self.request_path(node).exists())
    }

    fn take_request(&self, node: &str) -> StoreResult<Option<String>> {
        let path = self.request_path(check_node(node)?);
        let Some(text) = read_optional(&path)? else {
            return Ok(None);
        };
        remove_if_exists(&path)?;
        Ok(Some(text))
    }

    fn write_completion(&self, node: &str, text: &str) -> StoreResult<()> {
        write_atomic(&self.completion_path(check_node(node)?), text.as_bytes())?;
        info!(%node, "completion flag written");
        Ok(())
    }

    fn read_completion(&self, node: &str) -> StoreResult<Option<Completion>> {
        let path = self.completion_path(check_node(node)?);
        Ok(read_optional(&path)?.map(|t| Completion::parse(&t)))
    }

    fn cleanup(&self, node: &str) -> StoreResult<()> {
        let node = check_node(node)?;
        let request = remove_if_exists(&self.request_path(node))?;
        let completion = remove_if_exists(&self.completion_path(node))?;
        debug!(%node, request, completion, "flags cleaned");
        Ok(())
    }

    fn stale_requests(&self, older_than: Duration) -> StoreResult<Vec<(String, Duration)>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut stale = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let Some(node) = name
                .strip_prefix(REQUEST_PREFIX)
                .and_then(|n| n.strip_suffix(FLAG_SUFFIX))
            else {
                continue;
            };
            if self.completion_path(node).exists() {
                continue;
            }
            match age_of(&entry.path()) {
                Ok(age) if age > older_than => stale.push((node.to_string(), age)),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        stale.sort();
        Ok(stale)
    }
}

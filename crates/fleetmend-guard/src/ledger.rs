//! Deferred-action ledger.
//!
//! A `;`-delimited CSV (`ts;action;backend;server;reason`) of actions the
//! guard refused. Appends happen under the `ledger` lock; the retry pass
//! replaces the whole file atomically and never edits it in place.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fleetmend_core::DeferredAction;
use fleetmend_core::fsutil::{remove_if_exists, write_atomic};
use fleetmend_store::{LockGuard, LockManager};
use tracing::debug;

use crate::error::GuardResult;

pub const LEDGER_LOCK: &str = "ledger";

#[derive(Debug, Clone)]
pub struct DeferredLedger {
    path: PathBuf,
    locks: LockManager,
    lock_timeout: Duration,
}

impl DeferredLedger {
    pub fn new(path: impl Into<PathBuf>, locks: LockManager, lock_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            locks,
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) async fn lock(&self) -> GuardResult<LockGuard> {
        Ok(self.locks.acquire(LEDGER_LOCK, Some(self.lock_timeout)).await?)
    }

    /// Append one row under the ledger lock.
    pub async fn append(&self, row: &DeferredAction) -> GuardResult<()> {
        let _lock = self.lock().await?;
        self.append_locked(row)
    }

    fn append_locked(&self, row: &DeferredAction) -> GuardResult<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let new = file.metadata()?.len() == 0;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b';')
            .has_headers(new)
            .from_writer(file);
        writer.serialize(row)?;
        writer.flush()?;
        debug!(backend = %row.backend, server = %row.server, action = %row.action, "ledger row appended");
        Ok(())
    }

    /// Current rows; a missing file is an empty ledger.
    pub fn read(&self) -> GuardResult<Vec<DeferredAction>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut reader = csv::ReaderBuilder::new().delimiter(b';').from_reader(file);
        let mut rows = Vec::new();
        for row in reader.deserialize() {
            rows.push(row?);
        }
        Ok(rows)
    }

    /// Replace the ledger with `rows`. Caller holds the ledger lock.
    pub(crate) fn rewrite_locked(&self, rows: &[DeferredAction]) -> GuardResult<()> {
        if rows.is_empty() {
            remove_if_exists(&self.path)?;
            return Ok(());
        }
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b';')
            .from_writer(Vec::new());
        for row in rows {
            writer.serialize(row)?;
        }
        let bytes = writer.into_inner().map_err(|e| e.into_error())?;
        write_atomic(&self.path, &bytes)?;
        Ok(())
    }
}

/// Render the ledger for the CLI.
pub fn render(rows: &[DeferredAction]) -> String {
    let mut out = Vec::new();
    for row in rows {
        let _ = writeln!(
            out,
            "{} {:<8} {}/{}  {}",
            row.ts, row.action, row.backend, row.server, row.reason
        );
    }
    String::from_utf8_lossy(&out).into_owned()
}

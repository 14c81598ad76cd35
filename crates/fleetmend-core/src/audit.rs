//! Append-only CSV audit trail.
//!
//! Every phase transition of every workflow lands here as one row. Several
//! processes append to the same file, so each append takes an exclusive
//! `flock` on the file for the duration of the write; the header is written
//! by whoever finds the file empty.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CoreResult;
use crate::host;
use crate::time;
use crate::types::Severity;

/// Column order of the audit log.
pub const AUDIT_HEADER: [&str; 11] = [
    "timestamp",
    "host",
    "node",
    "phase",
    "severity",
    "action",
    "result",
    "note",
    "op_log",
    "logfile",
    "line_snippet",
];

const SNIPPET_LIMIT: usize = 400;

/// One audit record. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRow {
    pub timestamp: String,
    pub host: String,
    pub node: String,
    pub phase: String,
    pub severity: String,
    pub action: String,
    pub result: String,
    pub note: String,
    pub op_log: String,
    pub logfile: String,
    pub line_snippet: String,
}

impl AuditRow {
    /// Start a row for `node` in `phase`; unset columns render as `-`.
    pub fn new(node: &str, phase: &str) -> Self {
        Self {
            timestamp: time::stamp(),
            host: host::hostname().to_string(),
            node: node.to_string(),
            phase: phase.to_string(),
            severity: Severity::Info.to_string(),
            action: "-".to_string(),
            result: "-".to_string(),
            note: "-".to_string(),
            op_log: "-".to_string(),
            logfile: "-".to_string(),
            line_snippet: "-".to_string(),
        }
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity.to_string();
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    pub fn result(mut self, result: impl Into<String>) -> Self {
        self.result = result.into();
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }

    pub fn op_log(mut self, op_log: impl Into<String>) -> Self {
        self.op_log = op_log.into();
        self
    }

    pub fn logfile(mut self, logfile: impl Into<String>) -> Self {
        self.logfile = logfile.into();
        self
    }

    /// Attach the triggering log line, truncated on a char boundary.
    pub fn snippet(mut self, line: &str) -> Self {
        let line = line.trim_end();
        self.line_snippet = match line.char_indices().nth(SNIPPET_LIMIT) {
            Some((cut, _)) => line[..cut].to_string(),
            None => line.to_string(),
        };
        self
    }
}

/// Handle to the shared audit CSV.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row, writing the header first if the file is new.
    pub fn append(&self, row: &AuditRow) -> CoreResult<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let result = self.write_locked(&file, row);
        let _ = FileExt::unlock(&file);
        result?;
        debug!(node = %row.node, phase = %row.phase, result = %row.result, "audit");
        Ok(())
    }

    fn write_locked(&self, file: &fs::File, row: &AuditRow) -> CoreResult<()> {
        let needs_header = file.metadata()?.len() == 0;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);
        writer.serialize(row)?;
        writer.flush()?;
        let mut inner = writer.into_inner().map_err(|e| e.into_error())?;
        inner.flush()?;
        Ok(())
    }

    /// Read every row back (for tests and the `rules` dry-run report).
    pub fn read_all(&self) -> CoreResult<Vec<AuditRow>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&self.path)?;
        let mut rows = Vec::new();
        for row in reader.deserialize() {
            rows.push(row?);
        }
        Ok(rows)
    }
}

//! Operator-visible events.
//!
//! Events are small JSON files dropped into a directory that external
//! notifiers (chat bots, dashboards) pick up. Writing one never blocks on
//! a consumer.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CoreResult;
use crate::fsutil::{sanitize_component, write_atomic};
use crate::time;
use crate::types::Severity;

/// A single operator notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub ts: String,
    pub severity: Severity,
    /// Component that raised the event (`detector`, `dispatcher`, ...).
    pub source: String,
    pub node: String,
    pub text: String,
}

impl Event {
    pub fn new(severity: Severity, source: &str, node: &str, text: impl Into<String>) -> Self {
        Self {
            ts: time::stamp(),
            severity,
            source: source.to_string(),
            node: node.to_string(),
            text: text.into(),
        }
    }
}

/// Writes events as `ev_<ts>_<node>_<seq>.json`.
#[derive(Debug)]
pub struct EventSink {
    dir: PathBuf,
    seq: AtomicU64,
}

impl EventSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist an event and return the file it was written to.
    pub fn emit(&self, event: &Event) -> CoreResult<PathBuf> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "ev_{}_{}_{}_{seq}.json",
            time::file_stamp(),
            sanitize_component(&event.node),
            std::process::id(),
        );
        let path = self.dir.join(name);
        write_atomic(&path, &serde_json::to_vec_pretty(event)?)?;
        Ok(path)
    }

    /// Emit, logging instead of failing. For callers already on an error path.
    pub fn emit_or_log(&self, event: Event) {
        if let Err(e) = self.emit(&event) {
            warn!(node = %event.node, error = %e, text = %event.text, "failed to write event");
        }
    }

    /// Load all events currently in the directory, oldest first.
    pub fn read_all(&self) -> CoreResult<Vec<Event>> {
        let mut paths = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with("ev_") && n.ends_with(".json"))
                })
                .collect::<Vec<_>>(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        paths.sort();
        let mut events = Vec::with_capacity(paths.len());
        for path in paths {
            events.push(serde_json::from_slice(&std::fs::read(path)?)?);
        }
        Ok(events)
    }
}

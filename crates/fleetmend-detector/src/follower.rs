//! Polling log tailer.
//!
//! Starts at the end of the file, emits complete lines only, and survives
//! rotation (the path now names a different inode: reopen from the start)
//! and truncation (the file shrank below our offset: rewind).

use std::io::{self, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// One complete line read from a followed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub path: PathBuf,
    pub line: String,
}

struct Tail {
    reader: BufReader<File>,
    inode: u64,
    offset: u64,
    partial: Vec<u8>,
}

pub struct LogFollower {
    path: PathBuf,
    poll_interval: Duration,
    from_start: bool,
}

impl LogFollower {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
            from_start: false,
        }
    }

    /// Read existing content too, instead of starting at the end.
    pub fn from_start(mut self) -> Self {
        self.from_start = true;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open(&self, seek_end: bool) -> io::Result<Tail> {
        let mut file = File::open(&self.path).await?;
        let inode = file.metadata().await?.ino();
        let offset = if seek_end {
            file.seek(SeekFrom::End(0)).await?
        } else {
            0
        };
        Ok(Tail {
            reader: BufReader::new(file),
            inode,
            offset,
            partial: Vec::new(),
        })
    }

    /// Send every complete line currently available. Returns `false` once
    /// the receiver is gone.
    async fn drain(&self, tail: &mut Tail, tx: &mpsc::Sender<LogLine>) -> io::Result<bool> {
        loop {
            let n = tail.reader.read_until(b'\n', &mut tail.partial).await?;
            if n == 0 {
                return Ok(true);
            }
            tail.offset += n as u64;
            if tail.partial.last() != Some(&b'\n') {
                // Writer is mid-line; keep the fragment for the next poll.
                return Ok(true);
            }
            let line = String::from_utf8_lossy(&tail.partial)
                .trim_end_matches(['\n', '\r'])
                .to_string();
            tail.partial.clear();
            let sent = tx
                .send(LogLine {
                    path: self.path.clone(),
                    line,
                })
                .await;
            if sent.is_err() {
                return Ok(false);
            }
        }
    }

    /// Reopen or rewind if the file was rotated or truncated.
    async fn check_rotation(&self, tail: &mut Tail) -> io::Result<Option<Tail>> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(m) => m,
            // Rotated away and not yet recreated; keep reading the old handle.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if meta.ino() != tail.inode {
            info!(path = %self.path.display(), "log rotated, reopening");
            return self.open(false).await.map(Some);
        }
        if meta.len() < tail.offset {
            info!(path = %self.path.display(), "log truncated, rewinding");
            tail.reader.seek(SeekFrom::Start(0)).await?;
            tail.offset = 0;
            tail.partial.clear();
        }
        Ok(None)
    }

    /// Follow the file until shutdown or until the receiver is dropped.
    pub async fn run(self, tx: mpsc::Sender<LogLine>, mut shutdown: watch::Receiver<bool>) {
        debug!(path = %self.path.display(), "following log");
        let mut tail: Option<Tail> = None;
        // Only a file present at startup is skipped to its end; one that
        // appears later is read from its first line.
        let mut seek_end = !self.from_start;

        loop {
            if tail.is_none() {
                match self.open(seek_end).await {
                    Ok(t) => tail = Some(t),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => warn!(path = %self.path.display(), error = %e, "cannot open log"),
                }
                seek_end = false;
            }

            if let Some(t) = tail.as_mut() {
                match self.drain(t, &tx).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        warn!(path = %self.path.display(), error = %e, "log read failed, reopening");
                        tail = None;
                    }
                }
            }

            if let Some(t) = tail.as_mut() {
                match self.check_rotation(t).await {
                    Ok(Some(fresh)) => {
                        tail = Some(fresh);
                        // Read the new file right away.
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(path = %self.path.display(), error = %e, "log stat failed"),
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!(path = %self.path.display(), "log follower stopped");
    }
}

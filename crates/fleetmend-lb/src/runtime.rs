//! HAProxy runtime API client over the admin Unix socket.
//!
//! One command per connection: connect, write `<command>\n`, read until the
//! peer closes (or a read stalls past the read timeout), close. A stall
//! before any byte arrives is an error, never an empty reply. Errors are
//! returned as-is; retrying is the caller's loop's job.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fleetmend_core::ServerState;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, info};

use crate::error::{LbError, LbResult};
use crate::stat::{StatTable, parse_stat, servers_of};

/// Target for `set server <b>/<s> state ...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminState {
    Ready,
    Drain,
    Maint,
}

impl AdminState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Drain => "drain",
            Self::Maint => "maint",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeClient {
    socket: PathBuf,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl RuntimeClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.connect_timeout = connect;
        self.read_timeout = read;
        self
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Send one raw command and return the full reply.
    pub async fn command(&self, command: &str) -> LbResult<String> {
        let mut stream = tokio::time::timeout(self.connect_timeout, UnixStream::connect(&self.socket))
            .await
            .map_err(|_| LbError::ConnectTimeout {
                socket: self.socket.clone(),
                timeout: self.connect_timeout,
            })??;

        stream.write_all(format!("{command}\n").as_bytes()).await?;

        let mut reply = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            match tokio::time::timeout(self.read_timeout, stream.read(&mut chunk)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => reply.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) if reply.is_empty() => {
                    return Err(LbError::ReadTimeout {
                        command: command.to_string(),
                        timeout: self.read_timeout,
                    });
                }
                Err(_) => {
                    debug!(%command, bytes = reply.len(), "read timeout, using partial reply");
                    break;
                }
            }
        }
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }

    /// Run a mutating command. HAProxy acknowledges success with an empty
    /// line; anything else is a refusal.
    async fn mutate(&self, command: String) -> LbResult<()> {
        let reply = self.command(&command).await?;
        let reply = reply.trim();
        if !reply.is_empty() {
            return Err(LbError::Rejected {
                command,
                reply: reply.to_string(),
            });
        }
        info!(%command, socket = %self.socket.display(), "runtime command applied");
        Ok(())
    }

    pub async fn show_stat(&self) -> LbResult<StatTable> {
        parse_stat(&self.command("show stat").await?)
    }

    /// Raw `show servers state` dump.
    pub async fn show_servers_state(&self) -> LbResult<String> {
        self.command("show servers state").await
    }

    pub async fn servers(&self, backend: &str) -> LbResult<Vec<ServerState>> {
        Ok(servers_of(&self.show_stat().await?, backend))
    }

    pub async fn set_state(&self, backend: &str, server: &str, state: AdminState) -> LbResult<()> {
        self.mutate(format!("set server {backend}/{server} state {}", state.as_str()))
            .await
    }

    pub async fn enable_server(&self, backend: &str, server: &str) -> LbResult<()> {
        self.mutate(format!("enable server {backend}/{server}")).await
    }

    pub async fn disable_server(&self, backend: &str, server: &str) -> LbResult<()> {
        self.mutate(format!("disable server {backend}/{server}")).await
    }

    pub async fn set_weight(&self, backend: &str, server: &str, weight: u32) -> LbResult<()> {
        self.mutate(format!("set server {backend}/{server} weight {weight}"))
            .await
    }
}

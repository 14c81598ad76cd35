//! In-process fake of the HAProxy admin socket.
//!
//! Serves `show stat` from an in-memory server table and applies the
//! mutating commands fleetmend issues, recording every command received.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

use crate::runtime::RuntimeClient;

const STAT_HEADER: &str = "# pxname,svname,qcur,qmax,scur,smax,slim,stot,bin,bout,dreq,dresp,ereq,econ,eresp,wretr,wredis,status,weight,act,bck,hrsp_5xx,";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeServer {
    pub status: String,
    pub weight: u32,
    pub sessions: u64,
    pub http_5xx: u64,
}

impl Default for FakeServer {
    fn default() -> Self {
        Self {
            status: "UP".to_string(),
            weight: 1,
            sessions: 0,
            http_5xx: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    servers: BTreeMap<(String, String), FakeServer>,
    commands: Vec<String>,
}

/// A listening fake admin socket. Stops serving when dropped.
pub struct FakeLb {
    socket: PathBuf,
    inner: Arc<Mutex<Inner>>,
    task: JoinHandle<()>,
}

impl FakeLb {
    /// Bind `<dir>/admin.sock` serving the given backends, all servers UP.
    pub async fn start(dir: &Path, backends: &[(&str, &[&str])]) -> Self {
        let mut inner = Inner::default();
        for (backend, servers) in backends {
            for server in *servers {
                inner
                    .servers
                    .insert((backend.to_string(), server.to_string()), FakeServer::default());
            }
        }
        let inner = Arc::new(Mutex::new(inner));
        let socket = dir.join("admin.sock");
        let listener = UnixListener::bind(&socket).expect("bind fake admin socket");

        let shared = Arc::clone(&inner);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    let _ = serve(stream, shared).await;
                });
            }
        });

        Self {
            socket,
            inner,
            task,
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn client(&self) -> RuntimeClient {
        RuntimeClient::new(&self.socket)
    }

    /// Every command received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Commands other than `show ...` queries.
    pub fn mutations(&self) -> Vec<String> {
        self.lock()
            .commands
            .iter()
            .filter(|c| !c.starts_with("show "))
            .cloned()
            .collect()
    }

    pub fn status(&self, backend: &str, server: &str) -> Option<String> {
        self.lock()
            .servers
            .get(&(backend.to_string(), server.to_string()))
            .map(|s| s.status.clone())
    }

    /// Force a server's status, e.g. to simulate a node that is already down.
    pub fn set_status(&self, backend: &str, server: &str, status: &str) {
        self.lock()
            .servers
            .entry((backend.to_string(), server.to_string()))
            .or_default()
            .status = status.to_string();
    }

    /// Bump a server's cumulative `hrsp_5xx` counter.
    pub fn add_5xx(&self, backend: &str, server: &str, count: u64) {
        self.lock()
            .servers
            .entry((backend.to_string(), server.to_string()))
            .or_default()
            .http_5xx += count;
    }

    pub fn weight(&self, backend: &str, server: &str) -> Option<u32> {
        self.lock()
            .servers
            .get(&(backend.to_string(), server.to_string()))
            .map(|s| s.weight)
    }

    pub fn enabled_count(&self, backend: &str) -> usize {
        self.lock()
            .servers
            .iter()
            .filter(|((b, _), s)| b == backend && matches!(s.status.as_str(), "UP" | "OPEN"))
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for FakeLb {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: UnixStream, shared: Arc<Mutex<Inner>>) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut line = String::new();
    BufReader::new(read).read_line(&mut line).await?;
    let command = line.trim().to_string();
    let reply = {
        let mut inner = shared.lock().unwrap_or_else(|p| p.into_inner());
        inner.commands.push(command.clone());
        handle(&mut inner, &command)
    };
    write.write_all(reply.as_bytes()).await?;
    write.shutdown().await
}

fn handle(inner: &mut Inner, command: &str) -> String {
    let words: Vec<&str> = command.split_whitespace().collect();
    match words.as_slice() {
        ["show", "stat", ..] => render_stat(inner),
        ["show", "servers", "state", ..] => render_servers_state(inner),
        ["set", "server", target, "state", state] => {
            let status = match *state {
                "ready" => "UP",
                "drain" => "DRAIN",
                "maint" => "MAINT",
                _ => return "'set server <srv> state' expects 'ready', 'drain' and 'maint'.\n".to_string(),
            };
            update(inner, target, |s| s.status = status.to_string())
        }
        ["set", "server", target, "weight", weight] => match weight.parse::<u32>() {
            Ok(w) => update(inner, target, |s| s.weight = w),
            Err(_) => "Require <weight> or <weight%>.\n".to_string(),
        },
        ["enable", "server", target] => update(inner, target, |s| s.status = "UP".to_string()),
        ["disable", "server", target] => update(inner, target, |s| s.status = "MAINT".to_string()),
        _ => "Unknown command.\n".to_string(),
    }
}

fn update(inner: &mut Inner, target: &str, apply: impl FnOnce(&mut FakeServer)) -> String {
    let Some((backend, server)) = target.split_once('/') else {
        return "Require 'backend/server'.\n".to_string();
    };
    match inner
        .servers
        .get_mut(&(backend.to_string(), server.to_string()))
    {
        Some(s) => {
            apply(s);
            "\n".to_string()
        }
        None => "No such server.\n".to_string(),
    }
}

fn render_stat(inner: &Inner) -> String {
    let mut out = format!("{STAT_HEADER}\n");
    let mut backends: BTreeMap<&str, (usize, u64)> = BTreeMap::new();
    for ((backend, server), s) in &inner.servers {
        out.push_str(&format!(
            "{backend},{server},0,0,{},0,,0,0,0,,0,,0,0,0,0,{},{},1,0,{},\n",
            s.sessions, s.status, s.weight, s.http_5xx
        ));
        let entry = backends.entry(backend).or_default();
        if s.status == "UP" {
            entry.0 += 1;
        }
        entry.1 += s.sessions;
    }
    for (backend, (up, sessions)) in backends {
        let status = if up > 0 { "UP" } else { "DOWN" };
        out.push_str(&format!(
            "{backend},BACKEND,0,0,{sessions},0,,0,0,0,0,0,,0,0,0,0,{status},{up},{up},0,0,\n"
        ));
    }
    out.push('\n');
    out
}

fn render_servers_state(inner: &Inner) -> String {
    let mut out = String::from("1\n# be_name srv_name srv_op_state srv_admin_state srv_uweight\n");
    for ((backend, server), s) in &inner.servers {
        let (op, admin) = match s.status.as_str() {
            "UP" => (2, 0),
            "DRAIN" => (2, 8),
            "MAINT" => (0, 1),
            _ => (0, 0),
        };
        out.push_str(&format!("{backend} {server} {op} {admin} {}\n", s.weight));
    }
    out.push('\n');
    out
}

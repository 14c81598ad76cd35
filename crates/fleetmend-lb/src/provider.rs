//! Pool providers: the different ways a backend's membership is controlled.
//!
//! A provider is chosen per backend when the registry is built and never
//! changes afterwards. All of them answer the same two questions the
//! admission guard asks: which servers are in the pool and in what state,
//! and how to move one of them in or out.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use fleetmend_core::command::run_shell;
use fleetmend_core::config::{FleetConfig, ProviderConfig};
use fleetmend_core::fsutil::write_atomic;
use fleetmend_core::{GuardAction, ServerState};
use regex::Regex;
use tracing::info;

use crate::error::{LbError, LbResult};
use crate::runtime::{AdminState, RuntimeClient};

static UPSTREAM_SERVER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*)(#\s*)?server\s+([^;\s]+)[^;]*;\s*$").expect("static regex")
});

/// nginx upstream file; a server is out of the pool when its line is
/// commented.
#[derive(Debug, Clone)]
pub struct NginxUpstream {
    pub upstream_conf: PathBuf,
    pub reload_cmd: String,
    pub command_timeout: Duration,
}

impl NginxUpstream {
    fn servers(&self, backend: &str) -> LbResult<Vec<ServerState>> {
        let text = fs::read_to_string(&self.upstream_conf)?;
        Ok(text
            .lines()
            .filter_map(|line| UPSTREAM_SERVER_RE.captures(line))
            .map(|caps| ServerState {
                backend: backend.to_string(),
                server: caps[3].to_string(),
                status: if caps.get(2).is_some() { "MAINT" } else { "UP" }.to_string(),
                admin: String::new(),
                weight: 1,
                sessions: 0,
                http_5xx: 0,
            })
            .collect())
    }

    async fn set_state(&self, server: &str, action: GuardAction) -> LbResult<()> {
        let text = fs::read_to_string(&self.upstream_conf)?;
        let enable = action == GuardAction::Enable;
        let mut found = false;
        let mut changed = false;
        let mut out = String::with_capacity(text.len() + 2);
        for line in text.split_inclusive('\n') {
            let body = line.trim_end_matches(['\r', '\n']);
            let ending = &line[body.len()..];
            match UPSTREAM_SERVER_RE.captures(body) {
                Some(caps) if !found && &caps[3] == server => {
                    found = true;
                    let indent = caps.get(1).map_or("", |m| m.as_str());
                    let commented = caps.get(2).is_some();
                    if enable && commented {
                        let rest = &body[indent.len()..];
                        let rest = rest.trim_start_matches('#').trim_start();
                        out.push_str(&format!("{indent}{rest}{ending}"));
                        changed = true;
                    } else if !enable && !commented {
                        out.push_str(&format!("{indent}# {}{ending}", &body[indent.len()..]));
                        changed = true;
                    } else {
                        out.push_str(line);
                    }
                }
                _ => out.push_str(line),
            }
        }
        if !found {
            return Err(LbError::ServerNotFound {
                backend: self.upstream_conf.display().to_string(),
                server: server.to_string(),
            });
        }
        if !changed {
            return Ok(());
        }
        write_atomic(&self.upstream_conf, out.as_bytes())?;
        let reload = run_shell(&self.reload_cmd, self.command_timeout).await?;
        if !reload.success() {
            return Err(LbError::ReloadFailed {
                output: reload.log_text(),
            });
        }
        info!(%server, %action, conf = %self.upstream_conf.display(), "nginx upstream updated");
        Ok(())
    }
}

/// Pool of systemd units; a server is in the pool while its unit is active.
#[derive(Debug, Clone)]
pub struct SystemdGroup {
    pub units: Vec<String>,
    pub systemctl: String,
    pub command_timeout: Duration,
}

/// `systemctl is-active` output meaning "serving".
pub fn unit_is_active(output: &str) -> bool {
    matches!(output.trim(), "active" | "activating")
}

impl SystemdGroup {
    async fn servers(&self, backend: &str) -> LbResult<Vec<ServerState>> {
        let mut states = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            let out = run_shell(&format!("{} is-active {unit}", self.systemctl), self.command_timeout).await?;
            states.push(ServerState {
                backend: backend.to_string(),
                server: unit.clone(),
                status: if unit_is_active(&out.stdout) { "UP" } else { "DOWN" }.to_string(),
                admin: String::new(),
                weight: 1,
                sessions: 0,
                http_5xx: 0,
            });
        }
        Ok(states)
    }

    async fn set_state(&self, server: &str, action: GuardAction) -> LbResult<()> {
        if !self.units.iter().any(|u| u == server) {
            return Err(LbError::ServerNotFound {
                backend: "systemd group".to_string(),
                server: server.to_string(),
            });
        }
        let verb = match action {
            GuardAction::Enable => "start",
            GuardAction::Drain | GuardAction::Disable => "stop",
        };
        let out = run_shell(&format!("{} {verb} {server}", self.systemctl), self.command_timeout).await?;
        if !out.success() {
            return Err(LbError::Command(format!(
                "systemctl {verb} {server} exited {}: {}",
                out.code,
                out.log_text()
            )));
        }
        info!(unit = %server, %verb, "systemd unit toggled");
        Ok(())
    }
}

/// How one backend's pool is read and changed.
#[derive(Debug, Clone)]
pub enum Provider {
    Haproxy(RuntimeClient),
    Nginx(NginxUpstream),
    SystemdGroup(SystemdGroup),
}

impl Provider {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Haproxy(_) => "haproxy",
            Self::Nginx(_) => "nginx",
            Self::SystemdGroup(_) => "systemd_group",
        }
    }

    pub async fn servers(&self, backend: &str) -> LbResult<Vec<ServerState>> {
        match self {
            Self::Haproxy(client) => client.servers(backend).await,
            Self::Nginx(nginx) => nginx.servers(backend),
            Self::SystemdGroup(group) => group.servers(backend).await,
        }
    }

    /// `(enabled, total)` for a backend.
    pub async fn count_enabled(&self, backend: &str) -> LbResult<(usize, usize)> {
        let servers = self.servers(backend).await?;
        let enabled = servers.iter().filter(|s| s.is_enabled()).count();
        Ok((enabled, servers.len()))
    }

    pub async fn set_state(&self, backend: &str, server: &str, action: GuardAction) -> LbResult<()> {
        match self {
            Self::Haproxy(client) => match action {
                GuardAction::Drain => client.set_state(backend, server, AdminState::Drain).await,
                GuardAction::Disable => client.disable_server(backend, server).await,
                // `ready` clears both drain and maintenance.
                GuardAction::Enable => client.set_state(backend, server, AdminState::Ready).await,
            },
            Self::Nginx(nginx) => nginx.set_state(server, action).await,
            Self::SystemdGroup(group) => group.set_state(server, action).await,
        }
    }

    pub async fn set_weight(&self, backend: &str, server: &str, weight: u32) -> LbResult<()> {
        match self {
            Self::Haproxy(client) => client.set_weight(backend, server, weight).await,
            _ => Err(LbError::Unsupported {
                provider: self.kind(),
                operation: "weight",
            }),
        }
    }
}

/// Provider registry: per-backend overrides over a default HAProxy socket.
#[derive(Debug, Clone)]
pub struct Providers {
    default: Provider,
    overrides: HashMap<String, Provider>,
}

impl Providers {
    pub fn new(default: Provider) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, backend: &str, provider: Provider) -> Self {
        self.overrides.insert(backend.to_string(), provider);
        self
    }

    pub fn from_config(config: &FleetConfig) -> Self {
        let lb = &config.lb;
        let runtime = |socket: &PathBuf| {
            RuntimeClient::new(socket).with_timeouts(lb.connect_timeout, lb.read_timeout)
        };
        let mut providers = Self::new(Provider::Haproxy(runtime(&lb.socket)));
        for (backend, cluster) in &config.clusters {
            let provider = match &cluster.provider {
                ProviderConfig::Haproxy { socket } => {
                    Provider::Haproxy(runtime(socket.as_ref().unwrap_or(&lb.socket)))
                }
                ProviderConfig::Nginx {
                    upstream_conf,
                    reload_cmd,
                } => Provider::Nginx(NginxUpstream {
                    upstream_conf: upstream_conf.clone(),
                    reload_cmd: reload_cmd.clone(),
                    command_timeout: lb.command_timeout,
                }),
                ProviderConfig::SystemdGroup { units, systemctl } => {
                    Provider::SystemdGroup(SystemdGroup {
                        units: units.clone(),
                        systemctl: systemctl.clone(),
                        command_timeout: lb.command_timeout,
                    })
                }
            };
            providers.overrides.insert(backend.clone(), provider);
        }
        providers
    }

    pub fn for_backend(&self, backend: &str) -> &Provider {
        self.overrides.get(backend).unwrap_or(&self.default)
    }
}

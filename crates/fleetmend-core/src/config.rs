//! fleetmend.toml configuration.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all) yields a usable configuration. Durations are written as strings
//! such as `"500ms"`, `"30s"`, `"10m"` or as bare integer seconds.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::time::serde_duration;
use crate::types::{RuleAction, Severity};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub paths: PathsConfig,
    pub lb: LbConfig,
    pub guard: GuardConfig,
    /// Per-backend provider overrides, keyed by backend name.
    pub clusters: HashMap<String, ClusterConfig>,
    pub dispatcher: DispatcherConfig,
    pub ops: OpsConfig,
    pub detector: DetectorConfig,
    pub watchdog: WatchdogConfig,
    pub worker: WorkerConfig,
    pub policy: PolicyConfig,
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        let config: FleetConfig =
            toml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> CoreResult<String> {
        toml::to_string_pretty(self).map_err(|e| CoreError::Config(e.to_string()))
    }

    fn validate(&self) -> CoreResult<()> {
        if self.dispatcher.max_concurrent == 0 {
            return Err(CoreError::Config(
                "dispatcher.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.dispatcher.burst_limit == 0 {
            return Err(CoreError::Config(
                "dispatcher.burst_limit must be at least 1".to_string(),
            ));
        }
        if self.policy.heal_5xx > self.policy.drain_5xx {
            return Err(CoreError::Config(
                "policy.heal_5xx must not exceed policy.drain_5xx".to_string(),
            ));
        }
        for (group, members) in &self.dispatcher.groups {
            if members.is_empty() {
                return Err(CoreError::Config(format!("dispatcher group {group} is empty")));
            }
        }
        Ok(())
    }

    /// Capacity floor for a backend: cluster override, then
    /// `[guard.backends]`, then the global `guard.min_enabled`.
    pub fn min_enabled_for(&self, backend: &str) -> usize {
        self.clusters
            .get(backend)
            .and_then(|c| c.min_enabled)
            .or_else(|| self.guard.backends.get(backend).copied())
            .unwrap_or(self.guard.min_enabled)
    }

    /// Restart group a node belongs to, if any.
    pub fn group_of(&self, node: &str) -> Option<&str> {
        self.dispatcher
            .groups
            .iter()
            .find(|(_, members)| members.iter().any(|m| m == node))
            .map(|(name, _)| name.as_str())
    }
}

// ── Paths ──────────────────────────────────────────────────────────

/// On-disk layout. Everything hangs off `base`:
///
/// ```text
/// <base>/signals/{queue,inprogress,done,failed}   restart jobs
/// <base>/signals/ops/{queue,...}                  LB operation jobs
/// <base>/signals/restart_<node>.txt               handshake flags
/// <base>/signals/locks/                           named locks
/// <base>/signals/deferred.csv                     deferred-action ledger
/// <base>/signals/events/                          operator events
/// <base>/report/controller_summary.csv            audit log
/// <base>/report/policy_state.json                 auto-drain policy state
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub base: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            base: PathBuf::from("/var/lib/fleetmend"),
        }
    }
}

impl PathsConfig {
    pub fn signals(&self) -> PathBuf {
        self.base.join("signals")
    }

    pub fn restart_queue(&self) -> PathBuf {
        self.signals()
    }

    pub fn ops_queue(&self) -> PathBuf {
        self.signals().join("ops")
    }

    pub fn flags(&self) -> PathBuf {
        self.signals()
    }

    pub fn locks(&self) -> PathBuf {
        self.signals().join("locks")
    }

    pub fn ledger(&self) -> PathBuf {
        self.signals().join("deferred.csv")
    }

    pub fn events(&self) -> PathBuf {
        self.signals().join("events")
    }

    pub fn audit(&self) -> PathBuf {
        self.base.join("report").join("controller_summary.csv")
    }

    pub fn policy_state(&self) -> PathBuf {
        self.base.join("report").join("policy_state.json")
    }
}

// ── Load balancer ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LbConfig {
    /// HAProxy admin socket.
    pub socket: PathBuf,
    #[serde(with = "serde_duration")]
    pub connect_timeout: Duration,
    #[serde(with = "serde_duration")]
    pub read_timeout: Duration,
    pub cfg_path: PathBuf,
    /// Run after every config write; `{cfg}` expands to the config path.
    pub validate_cmd: String,
    pub reload_cmd: String,
    #[serde(with = "serde_duration")]
    pub command_timeout: Duration,
}

impl Default for LbConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/run/haproxy/admin.sock"),
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(3),
            cfg_path: PathBuf::from("/etc/haproxy/haproxy.cfg"),
            validate_cmd: "haproxy -c -f {cfg}".to_string(),
            reload_cmd: "systemctl reload haproxy".to_string(),
            command_timeout: Duration::from_secs(30),
        }
    }
}

// ── Admission guard ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Global capacity floor.
    pub min_enabled: usize,
    /// Per-backend floors.
    pub backends: HashMap<String, usize>,
    /// How long to wait for a backend lock before giving up.
    #[serde(with = "serde_duration")]
    pub lock_timeout: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            min_enabled: 4,
            backends: HashMap::new(),
            lock_timeout: Duration::from_secs(30),
        }
    }
}

// ── Clusters / providers ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(flatten)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub min_enabled: Option<usize>,
}

/// How a backend's pool is controlled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// HAProxy runtime socket; falls back to `[lb].socket`.
    Haproxy {
        #[serde(default)]
        socket: Option<PathBuf>,
    },
    /// nginx upstream file whose `server` lines are commented out, then reloaded.
    Nginx {
        upstream_conf: PathBuf,
        #[serde(default = "default_nginx_reload")]
        reload_cmd: String,
    },
    /// Each server is a systemd unit; enabled means active.
    SystemdGroup {
        units: Vec<String>,
        #[serde(default = "default_systemctl")]
        systemctl: String,
    },
}

fn default_systemctl() -> String {
    "systemctl".to_string()
}

fn default_nginx_reload() -> String {
    "nginx -s reload".to_string()
}

// ── Dispatcher ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Global concurrency cap on running restart workflows.
    pub max_concurrent: usize,
    /// Minimum spacing between two workflow starts.
    #[serde(with = "serde_duration")]
    pub stagger: Duration,
    /// Minimum time between two restarts of the same node.
    #[serde(with = "serde_duration")]
    pub per_node_cooldown: Duration,
    #[serde(with = "serde_duration")]
    pub burst_window: Duration,
    /// Maximum starts inside `burst_window`.
    pub burst_limit: usize,
    /// Maximum concurrently restarting nodes per group.
    pub per_group_max: usize,
    /// group name → member nodes
    pub groups: HashMap<String, Vec<String>>,
    /// How long to wait for a node's completion flag.
    #[serde(with = "serde_duration")]
    pub worker_wait: Duration,
    #[serde(with = "serde_duration")]
    pub poll_interval: Duration,
    /// Pause between dispatch passes in loop mode.
    #[serde(with = "serde_duration")]
    pub interval: Duration,
    /// Timeout for take-out/restore hook commands.
    #[serde(with = "serde_duration")]
    pub command_timeout: Duration,
    pub restore_on_fail: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            stagger: Duration::from_secs(30),
            per_node_cooldown: Duration::from_secs(600),
            burst_window: Duration::from_secs(900),
            burst_limit: 3,
            per_group_max: 1,
            groups: HashMap::new(),
            worker_wait: Duration::from_secs(900),
            poll_interval: Duration::from_secs(2),
            interval: Duration::from_secs(1),
            command_timeout: Duration::from_secs(90),
            restore_on_fail: false,
        }
    }
}

// ── Ops worker ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsConfig {
    /// When non-empty, jobs for other backends are rejected.
    pub allowed_backends: Vec<String>,
    #[serde(with = "serde_duration")]
    pub interval: Duration,
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            allowed_backends: Vec::new(),
            interval: Duration::from_secs(1),
        }
    }
}

impl OpsConfig {
    pub fn allows(&self, backend: &str) -> bool {
        self.allowed_backends.is_empty() || self.allowed_backends.iter().any(|b| b == backend)
    }
}

// ── Detector ───────────────────────────────────────────────────────

/// One classification rule, compiled by the detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub pattern: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub action: RuleAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Node this detector watches; defaults to the local hostname.
    pub node: Option<String>,
    pub logs: Vec<PathBuf>,
    pub take_out_cmd: Option<String>,
    pub restore_cmd: Option<String>,
    /// Backend/server used for guarded take-out in queue mode.
    pub backend: Option<String>,
    pub server: Option<String>,
    #[serde(with = "serde_duration")]
    pub ack_timeout: Duration,
    #[serde(with = "serde_duration")]
    pub cmd_timeout: Duration,
    #[serde(with = "serde_duration")]
    pub cooldown: Duration,
    #[serde(with = "serde_duration")]
    pub debounce: Duration,
    /// Enqueue restart jobs instead of running the workflow inline.
    pub queue_mode: bool,
    pub restore_on_fail: bool,
    #[serde(with = "serde_duration")]
    pub poll_interval: Duration,
    #[serde(with = "serde_duration")]
    pub flag_poll_interval: Duration,
    /// Ordered rules; empty means the built-in defaults.
    pub rules: Vec<RuleConfig>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            node: None,
            logs: Vec::new(),
            take_out_cmd: None,
            restore_cmd: None,
            backend: None,
            server: None,
            ack_timeout: Duration::from_secs(900),
            cmd_timeout: Duration::from_secs(60),
            cooldown: Duration::from_secs(600),
            debounce: Duration::from_secs(10),
            queue_mode: false,
            restore_on_fail: false,
            poll_interval: Duration::from_millis(500),
            flag_poll_interval: Duration::from_secs(2),
            rules: Vec::new(),
        }
    }
}

// ── Watchdog ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// In-progress jobs older than this are requeued (once) or failed.
    #[serde(with = "serde_duration")]
    pub stale_after: Duration,
    /// Restart flags older than this without a completion raise an event.
    #[serde(with = "serde_duration")]
    pub flag_stale_after: Duration,
    #[serde(with = "serde_duration")]
    pub interval: Duration,
    /// `done`/`failed` entries older than this are pruned.
    #[serde(with = "serde_duration")]
    pub retention: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(600),
            flag_stale_after: Duration::from_secs(900),
            interval: Duration::from_secs(60),
            retention: Duration::from_secs(7 * 86_400),
        }
    }
}

// ── Node worker ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub node: Option<String>,
    pub stop_cmd: String,
    pub start_cmd: String,
    /// Polled until it exits 0; absent means "start succeeded is enough".
    pub verify_cmd: Option<String>,
    #[serde(with = "serde_duration")]
    pub settle: Duration,
    #[serde(with = "serde_duration")]
    pub verify_timeout: Duration,
    #[serde(with = "serde_duration")]
    pub verify_every: Duration,
    #[serde(with = "serde_duration")]
    pub poll_interval: Duration,
    #[serde(with = "serde_duration")]
    pub command_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            node: None,
            stop_cmd: "systemctl stop app".to_string(),
            start_cmd: "systemctl start app".to_string(),
            verify_cmd: None,
            settle: Duration::from_secs(5),
            verify_timeout: Duration::from_secs(240),
            verify_every: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
            command_timeout: Duration::from_secs(180),
        }
    }
}

// ── Auto-drain policy ──────────────────────────────────────────────

/// Thresholds for draining servers whose restart failed verification while
/// they keep serving errors, and for healing them once they recover.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Backend whose servers carry the names of the nodes behind them.
    pub backend: String,
    /// Drain when the 5xx increase over `window` exceeds this.
    pub drain_5xx: u64,
    /// Heal only while the 5xx increase over `window` stays below this.
    pub heal_5xx: u64,
    /// How long `verify=OK` must have held before healing.
    #[serde(with = "serde_duration")]
    pub heal_after: Duration,
    #[serde(with = "serde_duration")]
    pub window: Duration,
    #[serde(with = "serde_duration")]
    pub interval: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            backend: "api".to_string(),
            drain_5xx: 20,
            heal_5xx: 2,
            heal_after: Duration::from_secs(600),
            window: Duration::from_secs(300),
            interval: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_valid() {
        let config = FleetConfig::from_toml_str("").unwrap();
        assert_eq!(config.guard.min_enabled, 4);
        assert_eq!(config.dispatcher.max_concurrent, 1);
        assert_eq!(
            config.paths.ledger(),
            PathBuf::from("/var/lib/fleetmend/signals/deferred.csv")
        );
    }

    #[test]
    fn parses_sections_and_durations() {
        let toml_str = r#"
[paths]
base = "/tmp/fm"

[guard]
min_enabled = 2
lock_timeout = "5s"

[guard.backends]
api = 3

[clusters.edge]
provider = "nginx"
upstream_conf = "/etc/nginx/conf.d/edge.conf"
min_enabled = 1

[clusters.jobs]
provider = "systemd_group"
units = ["worker@1.service", "worker@2.service"]

[dispatcher]
max_concurrent = 2
stagger = "500ms"
per_node_cooldown = 60
groups = { rack1 = ["web1", "web2"] }

[[detector.rules]]
pattern = "OutOfMemoryError"
severity = "critical"
action = "restart"
"#;
        let config = FleetConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.paths.audit(), PathBuf::from("/tmp/fm/report/controller_summary.csv"));
        assert_eq!(config.guard.lock_timeout, Duration::from_secs(5));
        assert_eq!(config.dispatcher.stagger, Duration::from_millis(500));
        assert_eq!(config.dispatcher.per_node_cooldown, Duration::from_secs(60));
        assert_eq!(config.min_enabled_for("api"), 3);
        assert_eq!(config.min_enabled_for("edge"), 1);
        assert_eq!(config.min_enabled_for("other"), 2);
        assert_eq!(config.group_of("web2"), Some("rack1"));
        assert_eq!(config.group_of("web9"), None);
        assert!(matches!(
            config.clusters["edge"].provider,
            ProviderConfig::Nginx { ref reload_cmd, .. } if reload_cmd == "nginx -s reload"
        ));
        assert!(matches!(
            config.clusters["jobs"].provider,
            ProviderConfig::SystemdGroup { .. }
        ));
        assert_eq!(config.detector.rules[0].action, RuleAction::Restart);
    }

    #[test]
    fn rejects_zero_concurrency() {
        let err = FleetConfig::from_toml_str("[dispatcher]\nmax_concurrent = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_concurrent"));
    }

    #[test]
    fn policy_section_parses_and_checks_thresholds() {
        let config =
            FleetConfig::from_toml_str("[policy]\nbackend = \"Jboss_client\"\nheal_after = \"15m\"\n").unwrap();
        assert_eq!(config.policy.backend, "Jboss_client");
        assert_eq!(config.policy.heal_after, Duration::from_secs(900));
        assert_eq!(config.policy.drain_5xx, 20);
        assert_eq!(
            config.paths.policy_state(),
            PathBuf::from("/var/lib/fleetmend/report/policy_state.json")
        );

        let err = FleetConfig::from_toml_str("[policy]\ndrain_5xx = 1\nheal_5xx = 5\n").unwrap_err();
        assert!(err.to_string().contains("heal_5xx"));
    }

    #[test]
    fn rejects_bad_duration() {
        assert!(FleetConfig::from_toml_str("[watchdog]\ninterval = \"soon\"\n").is_err());
    }

    #[test]
    fn serializes_back_to_toml() {
        let config = FleetConfig::default();
        let text = config.to_toml_string().unwrap();
        let back = FleetConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.watchdog.retention, config.watchdog.retention);
    }
}

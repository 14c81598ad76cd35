//! Domain types shared across the fleetmend workspace.
//!
//! Jobs and ledger rows are serialized to disk (JSON and `;`-CSV
//! respectively); server states are parsed from the load balancer and never
//! written back.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::fsutil::sanitize_component;
use crate::time;

// ── Jobs ───────────────────────────────────────────────────────────

/// Operation carried by a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOp {
    Drain,
    Disable,
    Enable,
    Weight,
    Comment,
    Uncomment,
    /// Full restart workflow for one node (take out, signal, wait, restore).
    Restart,
}

impl JobOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drain => "drain",
            Self::Disable => "disable",
            Self::Enable => "enable",
            Self::Weight => "weight",
            Self::Comment => "comment",
            Self::Uncomment => "uncomment",
            Self::Restart => "restart",
        }
    }
}

impl fmt::Display for JobOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an LB operation is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Runtime admin socket only (lost on reload).
    #[default]
    Runtime,
    /// Config file only (applied on reload).
    Cfg,
    /// Runtime first, then config file.
    Both,
}

impl Scope {
    pub fn includes_runtime(&self) -> bool {
        matches!(self, Self::Runtime | Self::Both)
    }

    pub fn includes_cfg(&self) -> bool {
        matches!(self, Self::Cfg | Self::Both)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Runtime => "runtime",
            Self::Cfg => "cfg",
            Self::Both => "both",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work in a file queue.
///
/// On disk: `{"id", "ts", "op", "scope", "backend", "server", ...payload}`.
/// The file name (see [`Job::file_name`]) starts with `ts`, which gives the
/// queue its rough FIFO order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "ts")]
    pub created_at: String,
    pub op: JobOp,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub server: String,
    /// Op-specific extras (`weight`, restart `node`/`reason`/commands, ...).
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Job {
    /// Create a job stamped with the current time and a fresh short id.
    pub fn new(op: JobOp, backend: &str, server: &str) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            id,
            created_at: time::file_stamp(),
            op,
            scope: Scope::default(),
            backend: backend.to_string(),
            server: server.to_string(),
            payload: Map::new(),
        }
    }

    /// Create a restart job for a node.
    pub fn restart(spec: &RestartSpec, backend: &str, server: &str) -> Self {
        let mut job = Self::new(JobOp::Restart, backend, server);
        if let Ok(Value::Object(fields)) = serde_json::to_value(spec) {
            job.payload.extend(fields);
        }
        job
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.payload.insert("weight".to_string(), Value::from(weight));
        self
    }

    /// File name in the queue: `rq_<ts>_<backend>_<server>_<id>.json`.
    pub fn file_name(&self) -> String {
        let backend = if self.backend.is_empty() { "be" } else { &self.backend };
        let server = if self.server.is_empty() { "srv" } else { &self.server };
        format!(
            "rq_{}_{}_{}_{}.json",
            self.created_at,
            sanitize_component(backend),
            sanitize_component(server),
            sanitize_component(&self.id),
        )
    }

    /// Weight requested by a `weight` job.
    pub fn weight(&self) -> Option<u32> {
        self.payload
            .get("weight")
            .and_then(Value::as_u64)
            .and_then(|w| u32::try_from(w).ok())
    }

    /// Restart parameters; the node falls back to `server` when unset.
    pub fn restart_spec(&self) -> Option<RestartSpec> {
        let mut spec: RestartSpec =
            serde_json::from_value(Value::Object(self.payload.clone())).ok()?;
        if spec.node.is_empty() {
            spec.node = self.server.clone();
        }
        if spec.node.is_empty() {
            return None;
        }
        Some(spec)
    }

    /// Node this job acts on, for scheduling and audit purposes.
    pub fn node(&self) -> String {
        self.restart_spec()
            .map(|s| s.node)
            .unwrap_or_else(|| self.server.clone())
    }
}

/// Payload of a `restart` job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartSpec {
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub reason: String,
    /// Shell command that removes the node from the pool. When absent the
    /// dispatcher drains it through the admission guard instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_out_cmd: Option<String>,
    /// Shell command that returns the node to the pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_cmd: Option<String>,
}

// ── Load balancer state ────────────────────────────────────────────

/// Capacity-affecting action on a single backend server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardAction {
    Drain,
    Disable,
    Enable,
}

impl GuardAction {
    /// Whether performing this action can lower live capacity.
    pub fn reduces_capacity(&self) -> bool {
        matches!(self, Self::Drain | Self::Disable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drain => "drain",
            Self::Disable => "disable",
            Self::Enable => "enable",
        }
    }
}

impl fmt::Display for GuardAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GuardAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drain" => Ok(Self::Drain),
            "disable" => Ok(Self::Disable),
            "enable" => Ok(Self::Enable),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

impl TryFrom<JobOp> for GuardAction {
    type Error = JobOp;

    fn try_from(op: JobOp) -> Result<Self, Self::Error> {
        match op {
            JobOp::Drain => Ok(Self::Drain),
            JobOp::Disable => Ok(Self::Disable),
            JobOp::Enable => Ok(Self::Enable),
            other => Err(other),
        }
    }
}

/// One server row as reported by the load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    pub backend: String,
    pub server: String,
    /// Operational status (`UP`, `DOWN`, `DRAIN`, `MAINT`, `OPEN`, ...).
    pub status: String,
    /// Administrative state; empty when the source does not report one.
    pub admin: String,
    pub weight: u32,
    /// Current sessions.
    pub sessions: u64,
    /// Cumulative HTTP 5xx responses (`hrsp_5xx`); 0 when not reported.
    #[serde(default)]
    pub http_5xx: u64,
}

impl ServerState {
    /// A server counts toward live capacity when it is UP/OPEN and not in
    /// maintenance.
    pub fn is_enabled(&self) -> bool {
        let status = self
            .status
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        matches!(status.as_str(), "UP" | "OPEN") && !self.admin.to_ascii_uppercase().contains("MAINT")
    }
}

/// Row of the deferred-action ledger (`ts;action;backend;server;reason`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredAction {
    pub ts: String,
    pub action: GuardAction,
    pub backend: String,
    pub server: String,
    pub reason: String,
}

impl DeferredAction {
    pub fn new(action: GuardAction, backend: &str, server: &str, reason: String) -> Self {
        Self {
            ts: time::stamp(),
            action,
            backend: backend.to_string(),
            server: server.to_string(),
            reason,
        }
    }
}

// ── Classification ─────────────────────────────────────────────────

/// Severity attached to rule matches and audit rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warn,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a matching detector rule asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Restart,
    #[default]
    Notify,
    Noop,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::Notify => "notify",
            Self::Noop => "noop",
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Handshake ──────────────────────────────────────────────────────

/// Outcome reported by a node worker in its completion flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    Fail,
    /// Completion flag present but carries no recognizable verdict.
    Unknown,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Fail => "FAIL",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed content of a `done_<node>` flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub verdict: Verdict,
    pub stop_rc: Option<String>,
    pub start_rc: Option<String>,
    pub raw: String,
}

impl Completion {
    /// Parse flag text. Only the case-insensitive `verify=ok` /
    /// `verify=fail` substrings are authoritative.
    pub fn parse(text: &str) -> Self {
        let lower = text.to_ascii_lowercase();
        let verdict = if lower.contains("verify=ok") {
            Verdict::Ok
        } else if lower.contains("verify=fail") {
            Verdict::Fail
        } else {
            Verdict::Unknown
        };
        let token = |key: &str| {
            text.split_whitespace()
                .find_map(|t| t.strip_prefix(key))
                .map(str::to_string)
        };
        Self {
            verdict,
            stop_rc: token("stop_rc="),
            start_rc: token("start_rc="),
            raw: text.trim().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_file_name_is_prefixed_by_timestamp() {
        let mut job = Job::new(JobOp::Drain, "Jboss_client", "node1");
        job.created_at = "20261017_101500123".to_string();
        job.id = "abcd1234".to_string();
        assert_eq!(
            job.file_name(),
            "rq_20261017_101500123_Jboss-client_node1_abcd1234.json"
        );
    }

    #[test]
    fn job_on_disk_shape() {
        let job = Job::new(JobOp::Weight, "api", "web2").with_weight(0);
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["op"], "weight");
        assert_eq!(value["scope"], "runtime");
        assert_eq!(value["weight"], 0);
        assert!(value.get("ts").is_some());

        let back: Job = serde_json::from_value(value).unwrap();
        assert_eq!(back.weight(), Some(0));
    }

    #[test]
    fn restart_spec_falls_back_to_server() {
        let spec = RestartSpec {
            reason: "ECONNRESET".to_string(),
            take_out_cmd: Some("true".to_string()),
            ..Default::default()
        };
        let job = Job::restart(&spec, "api", "web3");
        let parsed = job.restart_spec().unwrap();
        assert_eq!(parsed.node, "web3");
        assert_eq!(parsed.reason, "ECONNRESET");
        assert_eq!(parsed.take_out_cmd.as_deref(), Some("true"));
        assert_eq!(job.node(), "web3");
    }

    #[test]
    fn server_enabled_rules() {
        let mut s = ServerState {
            backend: "b".into(),
            server: "s".into(),
            status: "UP".into(),
            admin: String::new(),
            weight: 1,
            sessions: 0,
            http_5xx: 0,
        };
        assert!(s.is_enabled());
        s.status = "UP 1/3".into();
        assert!(s.is_enabled());
        s.status = "open".into();
        assert!(s.is_enabled());
        s.admin = "MAINT".into();
        assert!(!s.is_enabled());
        s.admin.clear();
        s.status = "DRAIN".into();
        assert!(!s.is_enabled());
    }

    #[test]
    fn completion_parsing_is_case_insensitive() {
        let c = Completion::parse("ts=2026 host=h node=n stop_rc=0 start_rc=0 Verify=OK\n");
        assert_eq!(c.verdict, Verdict::Ok);
        assert_eq!(c.stop_rc.as_deref(), Some("0"));
        assert_eq!(c.start_rc.as_deref(), Some("0"));

        assert_eq!(Completion::parse("VERIFY=FAIL").verdict, Verdict::Fail);
        assert_eq!(Completion::parse("ack").verdict, Verdict::Unknown);
    }

    #[test]
    fn guard_action_from_job_op() {
        assert_eq!(GuardAction::try_from(JobOp::Drain), Ok(GuardAction::Drain));
        assert_eq!(GuardAction::try_from(JobOp::Weight), Err(JobOp::Weight));
        assert_eq!("DISABLE".parse::<GuardAction>(), Ok(GuardAction::Disable));
        assert!("retry".parse::<GuardAction>().is_err());
    }
}

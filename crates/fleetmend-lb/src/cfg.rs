//! Line-oriented HAProxy config patching.
//!
//! [`toggle_server`] is a pure text transform that touches exactly one
//! `server` line inside one `backend` section and leaves every other byte
//! alone (indentation, line endings, trailing newline). [`ConfigPatcher`]
//! wraps it in the write protocol: lock, backup, atomic replace, validate,
//! reload. A config that fails validation is rolled back.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use fleetmend_core::command::{fill_placeholders, run_shell};
use fleetmend_core::fsutil::write_atomic;
use fleetmend_core::time;
use fleetmend_store::LockManager;
use regex::Regex;
use tracing::{error, info, warn};

use crate::error::{LbError, LbResult};

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(frontend|backend|listen|global|defaults)\b").expect("static regex")
});
static BACKEND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*backend\s+(\S+)").expect("static regex"));
static SERVER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*)(#\s*)?server\s+(\S+)").expect("static regex"));

/// How a server is marked out of rotation in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleStyle {
    /// Trailing `disabled` keyword on the server line.
    DisabledToken,
    /// The whole server line commented out with a leading `# `.
    CommentOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToggleOutcome {
    Changed(String),
    /// Server already in the requested state; nothing to write.
    Unchanged,
}

/// Split a line into content and its terminator (`\n`, `\r\n`, or none).
fn split_ending(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}

/// Byte spans of whitespace-separated tokens.
fn token_spans(s: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = None;
    for (i, c) in s.char_indices() {
        match (c.is_whitespace(), start) {
            (true, Some(st)) => {
                spans.push((st, i));
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(st) = start {
        spans.push((st, s.len()));
    }
    spans
}

/// Flip the `disabled` keyword. `None` when already in state.
fn toggle_disabled_token(content: &str, enable: bool) -> Option<String> {
    let spans = token_spans(content);
    // Options start after `server <name>`.
    let disabled: Vec<usize> = spans
        .iter()
        .enumerate()
        .skip(2)
        .filter(|(_, (s, e))| &content[*s..*e] == "disabled")
        .map(|(i, _)| i)
        .collect();

    if enable {
        if disabled.is_empty() {
            return None;
        }
        let mut out = String::with_capacity(content.len());
        let mut cursor = 0;
        for i in disabled {
            // Drop the token together with the whitespace before it.
            let cut_from = spans[i - 1].1;
            out.push_str(&content[cursor..cut_from]);
            cursor = spans[i].1;
        }
        out.push_str(&content[cursor..]);
        Some(out)
    } else {
        if !disabled.is_empty() {
            return None;
        }
        let end = content.trim_end().len();
        Some(format!("{} disabled{}", &content[..end], &content[end..]))
    }
}

/// Flip a leading `# `. `None` when already in state.
fn toggle_comment(content: &str, indent: &str, commented: bool, enable: bool) -> Option<String> {
    match (commented, enable) {
        (true, true) => {
            let rest = &content[indent.len()..];
            let rest = rest.strip_prefix('#').unwrap_or(rest);
            let rest = rest.strip_prefix(' ').unwrap_or(rest);
            Some(format!("{indent}{rest}"))
        }
        (false, false) => Some(format!("{indent}# {}", &content[indent.len()..])),
        _ => None,
    }
}

/// Enable or disable `server` inside `backend <backend>`.
pub fn toggle_server(
    text: &str,
    backend: &str,
    server: &str,
    enable: bool,
    style: ToggleStyle,
) -> LbResult<ToggleOutcome> {
    let mut out = String::with_capacity(text.len() + 16);
    let mut in_backend = false;
    let mut saw_backend = false;
    let mut outcome: Option<bool> = None;

    for line in text.split_inclusive('\n') {
        let (content, ending) = split_ending(line);

        if SECTION_RE.is_match(content) {
            in_backend = BACKEND_RE
                .captures(content)
                .is_some_and(|c| &c[1] == backend);
            saw_backend |= in_backend;
        } else if in_backend && outcome.is_none() {
            if let Some(caps) = SERVER_RE.captures(content) {
                let commented = caps.get(2).is_some();
                let applies = &caps[3] == server
                    && match style {
                        ToggleStyle::DisabledToken => !commented,
                        ToggleStyle::CommentOut => true,
                    };
                if applies {
                    let indent = caps.get(1).map_or("", |m| m.as_str());
                    let patched = match style {
                        ToggleStyle::DisabledToken => toggle_disabled_token(content, enable),
                        ToggleStyle::CommentOut => toggle_comment(content, indent, commented, enable),
                    };
                    outcome = Some(patched.is_some());
                    if let Some(patched) = patched {
                        out.push_str(&patched);
                        out.push_str(ending);
                        continue;
                    }
                }
            }
        }
        out.push_str(line);
    }

    match outcome {
        Some(true) => Ok(ToggleOutcome::Changed(out)),
        Some(false) => Ok(ToggleOutcome::Unchanged),
        None if !saw_backend => Err(LbError::BackendNotFound(backend.to_string())),
        None => Err(LbError::ServerNotFound {
            backend: backend.to_string(),
            server: server.to_string(),
        }),
    }
}

/// Result of a [`ConfigPatcher`] write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    Unchanged,
    /// Written, validated, and reloaded.
    Applied { backup: PathBuf },
}

/// Applies [`toggle_server`] to a config file on disk.
#[derive(Debug, Clone)]
pub struct ConfigPatcher {
    cfg_path: PathBuf,
    validate_cmd: String,
    reload_cmd: String,
    command_timeout: Duration,
    locks: LockManager,
    lock_timeout: Duration,
}

impl ConfigPatcher {
    pub fn new(cfg_path: impl Into<PathBuf>, locks: LockManager) -> Self {
        Self {
            cfg_path: cfg_path.into(),
            validate_cmd: "haproxy -c -f {cfg}".to_string(),
            reload_cmd: "systemctl reload haproxy".to_string(),
            command_timeout: Duration::from_secs(30),
            locks,
            lock_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_commands(mut self, validate: &str, reload: &str) -> Self {
        self.validate_cmd = validate.to_string();
        self.reload_cmd = reload.to_string();
        self
    }

    pub fn with_timeouts(mut self, command: Duration, lock: Duration) -> Self {
        self.command_timeout = command;
        self.lock_timeout = lock;
        self
    }

    pub fn cfg_path(&self) -> &Path {
        &self.cfg_path
    }

    pub async fn toggle(
        &self,
        backend: &str,
        server: &str,
        enable: bool,
        style: ToggleStyle,
    ) -> LbResult<PatchOutcome> {
        let _lock = self
            .locks
            .acquire(
                &format!("cfg:{}", self.cfg_path.display()),
                Some(self.lock_timeout),
            )
            .await?;

        let original = fs::read_to_string(&self.cfg_path)?;
        let patched = match toggle_server(&original, backend, server, enable, style)? {
            ToggleOutcome::Unchanged => {
                info!(%backend, %server, enable, "config already in requested state");
                return Ok(PatchOutcome::Unchanged);
            }
            ToggleOutcome::Changed(text) => text,
        };

        let backup = self.backup_path();
        fs::copy(&self.cfg_path, &backup)?;
        write_atomic(&self.cfg_path, patched.as_bytes())?;

        let cfg = self.cfg_path.display().to_string();
        let validate = run_shell(
            &fill_placeholders(&self.validate_cmd, &[("cfg", &cfg)]),
            self.command_timeout,
        )
        .await;
        let failure = match validate {
            Ok(outcome) if outcome.success() => None,
            Ok(outcome) => {
                error!(%backend, %server, code = outcome.code, "config validation failed, rolling back");
                Some(outcome.log_text())
            }
            Err(e) => {
                error!(%backend, %server, error = %e, "config validation did not run, rolling back");
                Some(format!("validate command did not run: {e}"))
            }
        };
        if let Some(output) = failure {
            write_atomic(&self.cfg_path, original.as_bytes())?;
            return Err(LbError::ValidateFailed { output });
        }

        let reload = run_shell(
            &fill_placeholders(&self.reload_cmd, &[("cfg", &cfg)]),
            self.command_timeout,
        )
        .await?;
        if !reload.success() {
            warn!(%backend, %server, code = reload.code, "reload failed after valid config write");
            return Err(LbError::ReloadFailed {
                output: reload.log_text(),
            });
        }

        info!(%backend, %server, enable, backup = %backup.display(), "config patched and reloaded");
        Ok(PatchOutcome::Applied { backup })
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self
            .cfg_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".bak_{}", time::file_stamp()));
        self.cfg_path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CFG: &str = "\
global
    daemon

defaults
    mode http

frontend http-in
    bind *:80
    default_backend api

backend api
    balance roundrobin
    server web1 10.0.0.1:8080 check
    server web2 10.0.0.2:8080 check disabled
\t# server web3 10.0.0.3:8080 check

backend other
    server web1 10.0.1.1:8080 check
";

    fn changed(outcome: ToggleOutcome) -> String {
        match outcome {
            ToggleOutcome::Changed(text) => text,
            ToggleOutcome::Unchanged => panic!("expected a change"),
        }
    }

    #[test]
    fn disable_appends_token_in_target_backend_only() {
        let text = changed(toggle_server(CFG, "api", "web1", false, ToggleStyle::DisabledToken).unwrap());
        assert!(text.contains("    server web1 10.0.0.1:8080 check disabled\n"));
        assert!(text.contains("    server web1 10.0.1.1:8080 check\n"));
        assert_eq!(text.len(), CFG.len() + " disabled".len());
    }

    #[test]
    fn disabled_token_round_trip_is_byte_exact() {
        let off = changed(toggle_server(CFG, "api", "web1", false, ToggleStyle::DisabledToken).unwrap());
        let on = changed(toggle_server(&off, "api", "web1", true, ToggleStyle::DisabledToken).unwrap());
        assert_eq!(on, CFG);

        let on = changed(toggle_server(CFG, "api", "web2", true, ToggleStyle::DisabledToken).unwrap());
        assert!(on.contains("    server web2 10.0.0.2:8080 check\n"));
        let off = changed(toggle_server(&on, "api", "web2", false, ToggleStyle::DisabledToken).unwrap());
        assert_eq!(off, CFG);
    }

    #[test]
    fn already_in_state_is_unchanged() {
        assert_eq!(
            toggle_server(CFG, "api", "web2", false, ToggleStyle::DisabledToken).unwrap(),
            ToggleOutcome::Unchanged
        );
        assert_eq!(
            toggle_server(CFG, "api", "web1", true, ToggleStyle::DisabledToken).unwrap(),
            ToggleOutcome::Unchanged
        );
        assert_eq!(
            toggle_server(CFG, "api", "web3", false, ToggleStyle::CommentOut).unwrap(),
            ToggleOutcome::Unchanged
        );
    }

    #[test]
    fn comment_out_round_trip_preserves_indent_and_crlf() {
        let crlf = CFG.replace('\n', "\r\n");
        let off = changed(toggle_server(&crlf, "api", "web1", false, ToggleStyle::CommentOut).unwrap());
        assert!(off.contains("    # server web1 10.0.0.1:8080 check\r\n"));
        let on = changed(toggle_server(&off, "api", "web1", true, ToggleStyle::CommentOut).unwrap());
        assert_eq!(on, crlf);

        let on = changed(toggle_server(CFG, "api", "web3", true, ToggleStyle::CommentOut).unwrap());
        assert!(on.contains("\tserver web3 10.0.0.3:8080 check\n"));
    }

    #[test]
    fn missing_trailing_newline_is_kept() {
        let text = "backend api\n    server web1 10.0.0.1:80";
        let off = changed(toggle_server(text, "api", "web1", false, ToggleStyle::DisabledToken).unwrap());
        assert_eq!(off, "backend api\n    server web1 10.0.0.1:80 disabled");
    }

    #[test]
    fn missing_backend_or_server_is_an_error() {
        assert!(matches!(
            toggle_server(CFG, "nope", "web1", false, ToggleStyle::DisabledToken),
            Err(LbError::BackendNotFound(_))
        ));
        assert!(matches!(
            toggle_server(CFG, "api", "web9", false, ToggleStyle::DisabledToken),
            Err(LbError::ServerNotFound { .. })
        ));
        // A commented-out server is invisible to the token style.
        assert!(matches!(
            toggle_server(CFG, "api", "web3", false, ToggleStyle::DisabledToken),
            Err(LbError::ServerNotFound { .. })
        ));
    }

    fn patcher(dir: &Path, validate: &str) -> ConfigPatcher {
        let cfg = dir.join("haproxy.cfg");
        fs::write(&cfg, CFG).unwrap();
        ConfigPatcher::new(&cfg, LockManager::new(dir.join("locks")))
            .with_commands(validate, &format!("touch {}", dir.join("reloaded").display()))
    }

    #[tokio::test]
    async fn patch_validates_backs_up_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let p = patcher(dir.path(), "grep -q 'web1 10.0.0.1:8080 check disabled' {cfg}");

        let backup = match p.toggle("api", "web1", false, ToggleStyle::DisabledToken).await.unwrap() {
            PatchOutcome::Applied { backup } => backup,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(fs::read_to_string(&backup).unwrap(), CFG);
        assert!(fs::read_to_string(p.cfg_path()).unwrap().contains("check disabled\n    server web2"));
        assert!(dir.path().join("reloaded").exists());

        assert_eq!(
            p.toggle("api", "web1", false, ToggleStyle::DisabledToken).await.unwrap(),
            PatchOutcome::Unchanged
        );
    }

    #[tokio::test]
    async fn validate_failure_rolls_back_and_skips_reload() {
        let dir = tempfile::tempdir().unwrap();
        let p = patcher(dir.path(), "echo 'parse error' >&2; exit 1");

        let err = p
            .toggle("api", "web1", false, ToggleStyle::DisabledToken)
            .await
            .unwrap_err();
        match err {
            LbError::ValidateFailed { output } => assert_eq!(output, "parse error"),
            other => panic!("unexpected {other}"),
        }
        assert_eq!(fs::read_to_string(p.cfg_path()).unwrap(), CFG);
        assert!(!dir.path().join("reloaded").exists());
    }

    #[tokio::test]
    async fn validate_that_cannot_start_still_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        // A NUL byte makes the spawn itself fail.
        let p = patcher(dir.path(), "true\0");

        let err = p
            .toggle("api", "web1", false, ToggleStyle::DisabledToken)
            .await
            .unwrap_err();
        match err {
            LbError::ValidateFailed { output } => assert!(output.contains("did not run"), "{output}"),
            other => panic!("unexpected {other}"),
        }
        assert_eq!(fs::read_to_string(p.cfg_path()).unwrap(), CFG);
        assert!(!dir.path().join("reloaded").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn patched_config_keeps_its_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let p = patcher(dir.path(), "true");
        fs::set_permissions(p.cfg_path(), fs::Permissions::from_mode(0o644)).unwrap();

        p.toggle("api", "web1", false, ToggleStyle::DisabledToken).await.unwrap();
        let mode = fs::metadata(p.cfg_path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
    }
}

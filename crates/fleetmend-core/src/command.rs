//! Timeout-bounded shell command execution.
//!
//! Take-out/restore hooks, config validate/reload commands, and the node
//! worker's stop/start/verify commands are all operator-supplied shell
//! strings run through `/bin/sh -c`.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

/// Exit code reported when a command is killed for exceeding its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Result of one shell invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Combined output, trimmed, for audit `op_log` columns.
    pub fn log_text(&self) -> String {
        let out = self.stdout.trim();
        let err = self.stderr.trim();
        match (out.is_empty(), err.is_empty()) {
            (true, true) => String::new(),
            (false, true) => out.to_string(),
            (true, false) => err.to_string(),
            (false, false) => format!("{out} | {err}"),
        }
    }
}

/// Run `cmd` via `/bin/sh -c`, killing it after `timeout`.
///
/// Spawn failures are returned as errors; a non-zero exit is not an error.
pub async fn run_shell(cmd: &str, timeout: Duration) -> io::Result<CommandOutcome> {
    debug!(%cmd, ?timeout, "running shell command");
    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output?;
            Ok(CommandOutcome {
                // Killed by a signal: report it the way a shell would.
                code: output.status.code().unwrap_or(128),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                timed_out: false,
            })
        }
        Err(_) => {
            warn!(%cmd, ?timeout, "shell command timed out");
            Ok(CommandOutcome {
                code: TIMEOUT_EXIT_CODE,
                stdout: String::new(),
                stderr: format!("timed out after {}", crate::time::format_duration(timeout)),
                timed_out: true,
            })
        }
    }
}

/// Substitute `{key}` placeholders in a command template.
pub fn fill_placeholders(template: &str, values: &[(&str, &str)]) -> String {
    values.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_exit_code_and_output() {
        let out = run_shell("echo hello; echo oops >&2; exit 3", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.code, 3);
        assert!(!out.success());
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.log_text(), "hello | oops");
    }

    #[tokio::test]
    async fn timeout_reports_124() {
        let out = run_shell("sleep 5", Duration::from_millis(100)).await.unwrap();
        assert!(out.timed_out);
        assert_eq!(out.code, TIMEOUT_EXIT_CODE);
    }

    #[test]
    fn placeholders_are_replaced() {
        assert_eq!(
            fill_placeholders("haproxy -c -f {cfg}", &[("cfg", "/etc/haproxy/haproxy.cfg")]),
            "haproxy -c -f /etc/haproxy/haproxy.cfg"
        );
        assert_eq!(fill_placeholders("true", &[("cfg", "x")]), "true");
    }
}

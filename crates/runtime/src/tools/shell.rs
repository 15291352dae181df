//! Shell tool: run a command under `sh -c` with a wall-clock timeout.
//!
//! Combined stdout/stderr is returned untruncated; the agent loop
//! truncates what it feeds back to the model. A timed-out command
//! yields the synthetic exit code 124 with output "timed out".

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use super::{ExecutionContext, Tool, ToolOutcome, ToolSpec};
use crate::types::{SafetyMode, ToolError};

/// Exit code reported for commands killed by the wall-clock timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Hard cap on the per-call timeout.
const MAX_TIMEOUT_SEC: u64 = 60;
const DEFAULT_TIMEOUT_SEC: u64 = 30;

/// Command prefixes admitted in observe mode and exempt from the
/// approval gate: inspection only, no subject mutation.
const READ_ONLY_PREFIXES: &[&str] = &[
    "docker ps",
    "docker inspect",
    "docker logs",
    "docker stats --no-stream",
    "curl -s",
    "curl -sG",
    "cat",
    "ls",
    "ps",
    "head",
    "tail",
    "grep",
    "wc",
    "df",
    "free",
    "uptime",
    "echo",
];

#[derive(Debug, Deserialize)]
struct ShellParams {
    command: String,
    timeout_sec: Option<u64>,
}

pub struct ShellTool {
    spec: ToolSpec,
}

impl Default for ShellTool {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellTool {
    pub fn new() -> Self {
        Self {
            spec: ToolSpec {
                name: "shell".to_string(),
                description: "Run a shell command against the subject's environment. \
                     Output is combined stdout and stderr. Commands are killed after \
                     timeout_sec (max 60) and report exit code 124."
                    .to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "command": {
                            "type": "string",
                            "description": "The command to run, e.g. 'docker ps' or 'docker start tikv0'"
                        },
                        "timeout_sec": {
                            "type": "integer",
                            "description": "Wall-clock timeout in seconds (default 30, max 60)",
                            "maximum": 60
                        }
                    },
                    "required": ["command"]
                }),
                requires_approval: true,
                mutating: true,
            },
        }
    }

    /// Whether a command matches the read-only whitelist. Prefixes
    /// match at a word boundary so `lsof` does not ride on `ls`.
    pub fn is_read_only(command: &str) -> bool {
        let trimmed = command.trim_start();
        READ_ONLY_PREFIXES.iter().any(|prefix| {
            trimmed
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with(' '))
        })
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn execute(
        &self,
        params: &serde_json::Value,
        ctx: ExecutionContext,
    ) -> Result<ToolOutcome, ToolError> {
        let params: ShellParams =
            serde_json::from_value(params.clone()).map_err(|e| ToolError::InvalidParams {
                tool: "shell".into(),
                reason: e.to_string(),
            })?;
        let timeout_sec = params.timeout_sec.unwrap_or(DEFAULT_TIMEOUT_SEC);
        if timeout_sec == 0 || timeout_sec > MAX_TIMEOUT_SEC {
            return Err(ToolError::InvalidParams {
                tool: "shell".into(),
                reason: format!("timeout_sec must be 1..={MAX_TIMEOUT_SEC}, got {timeout_sec}"),
            });
        }

        let read_only = Self::is_read_only(&params.command);
        if ctx.safety_mode == SafetyMode::Observe && !read_only {
            return Err(ToolError::Rejected(format!(
                "observe mode permits read-only commands only; '{}' is not whitelisted",
                params.command
            )));
        }
        if ctx.approval_mode && !read_only {
            return Err(ToolError::ApprovalRequired {
                action: params.command.clone(),
            });
        }

        run_shell(&params.command, Duration::from_secs(timeout_sec)).await
    }
}

/// Spawn `sh -c command`, capture combined output, enforce the timeout.
async fn run_shell(command: &str, timeout: Duration) -> Result<ToolOutcome, ToolError> {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ToolError::Execution(format!("spawn failed: {e}")))?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.is_empty() {
                if !combined.is_empty() && !combined.ends_with('\n') {
                    combined.push('\n');
                }
                combined.push_str(&stderr);
            }
            Ok(ToolOutcome::new(
                output.status.code().unwrap_or(-1),
                combined,
            ))
        }
        Ok(Err(e)) => Err(ToolError::Execution(format!("wait failed: {e}"))),
        Err(_) => {
            // Dropping the timed-out future drops the child; kill_on_drop
            // reaps the process.
            tracing::warn!(command, timeout_sec = timeout.as_secs(), "shell tool timed out");
            Ok(ToolOutcome::new(TIMEOUT_EXIT_CODE, "timed out"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(safety_mode: SafetyMode, approval_mode: bool) -> ExecutionContext {
        ExecutionContext {
            safety_mode,
            approval_mode,
        }
    }

    #[tokio::test]
    async fn test_execute_captures_combined_output() {
        let tool = ShellTool::new();
        let outcome = tool
            .execute(
                &serde_json::json!({"command": "echo out; echo err >&2"}),
                ctx(SafetyMode::Execute, false),
            )
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.output.contains("out"));
        assert!(outcome.output.contains("err"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_an_outcome_not_an_error() {
        let tool = ShellTool::new();
        let outcome = tool
            .execute(
                &serde_json::json!({"command": "ls /definitely-not-here-xyz"}),
                ctx(SafetyMode::Execute, false),
            )
            .await
            .unwrap();
        assert_ne!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn test_timeout_yields_exit_124() {
        let tool = ShellTool::new();
        let outcome = tool
            .execute(
                &serde_json::json!({"command": "sleep 10", "timeout_sec": 1}),
                ctx(SafetyMode::Execute, false),
            )
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(outcome.output, "timed out");
    }

    #[tokio::test]
    async fn test_observe_mode_rejects_mutation() {
        let tool = ShellTool::new();
        let err = tool
            .execute(
                &serde_json::json!({"command": "docker restart tikv0"}),
                ctx(SafetyMode::Observe, false),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_observe_mode_allows_whitelisted_reads() {
        let tool = ShellTool::new();
        let outcome = tool
            .execute(
                &serde_json::json!({"command": "echo healthy"}),
                ctx(SafetyMode::Observe, false),
            )
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn test_approval_mode_gates_mutations_only() {
        let tool = ShellTool::new();
        let err = tool
            .execute(
                &serde_json::json!({"command": "docker restart tikv0"}),
                ctx(SafetyMode::Execute, true),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ApprovalRequired { .. }));

        // Read-only calls skip the gate.
        let outcome = tool
            .execute(
                &serde_json::json!({"command": "echo ok"}),
                ctx(SafetyMode::Execute, true),
            )
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn test_invalid_params() {
        let tool = ShellTool::new();
        let err = tool
            .execute(&serde_json::json!({"cmd": "ls"}), ctx(SafetyMode::Execute, false))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams { .. }));

        let err = tool
            .execute(
                &serde_json::json!({"command": "ls", "timeout_sec": 600}),
                ctx(SafetyMode::Execute, false),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams { .. }));
    }

    #[test]
    fn test_read_only_whitelist() {
        assert!(ShellTool::is_read_only("docker ps"));
        assert!(ShellTool::is_read_only("docker ps -a"));
        assert!(ShellTool::is_read_only("  curl -s http://pd:2379/health"));
        assert!(ShellTool::is_read_only("cat /var/log/tikv.log"));
        assert!(!ShellTool::is_read_only("docker restart tikv0"));
        assert!(!ShellTool::is_read_only("rm -rf /data"));
        assert!(!ShellTool::is_read_only("catastrophe"));
    }
}

//! HTTP tool: bounded requests against subject endpoints.
//!
//! GET is treated as read-only; any other method mutates and is subject
//! to observe-mode rejection and the approval gate, mirroring the shell
//! tool's whitelist discipline.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{ExecutionContext, Tool, ToolOutcome, ToolSpec};
use crate::tools::shell::TIMEOUT_EXIT_CODE;
use crate::types::{SafetyMode, ToolError};

const MAX_TIMEOUT_SEC: u64 = 60;
const DEFAULT_TIMEOUT_SEC: u64 = 30;

#[derive(Debug, Deserialize)]
struct HttpParams {
    method: String,
    url: String,
    body: Option<serde_json::Value>,
    timeout_sec: Option<u64>,
}

pub struct HttpTool {
    spec: ToolSpec,
}

impl Default for HttpTool {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTool {
    pub fn new() -> Self {
        Self {
            spec: ToolSpec {
                name: "http".to_string(),
                description: "Issue an HTTP request against a subject endpoint. \
                     GET is read-only; POST/PUT/DELETE mutate and are gated by \
                     safety and approval modes. Returns status line plus body."
                    .to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "method": {
                            "type": "string",
                            "enum": ["GET", "POST", "PUT", "DELETE"],
                            "description": "HTTP method"
                        },
                        "url": {
                            "type": "string",
                            "description": "Absolute URL, e.g. http://pd:2379/pd/api/v1/stores"
                        },
                        "body": {
                            "type": "object",
                            "description": "Optional JSON request body"
                        },
                        "timeout_sec": {
                            "type": "integer",
                            "description": "Wall-clock timeout in seconds (default 30, max 60)",
                            "maximum": 60
                        }
                    },
                    "required": ["method", "url"]
                }),
                requires_approval: true,
                mutating: true,
            },
        }
    }
}

#[async_trait]
impl Tool for HttpTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn execute(
        &self,
        params: &serde_json::Value,
        ctx: ExecutionContext,
    ) -> Result<ToolOutcome, ToolError> {
        let params: HttpParams =
            serde_json::from_value(params.clone()).map_err(|e| ToolError::InvalidParams {
                tool: "http".into(),
                reason: e.to_string(),
            })?;
        let method = params.method.to_uppercase();
        if !matches!(method.as_str(), "GET" | "POST" | "PUT" | "DELETE") {
            return Err(ToolError::InvalidParams {
                tool: "http".into(),
                reason: format!("unsupported method '{}'", params.method),
            });
        }
        let timeout_sec = params.timeout_sec.unwrap_or(DEFAULT_TIMEOUT_SEC);
        if timeout_sec == 0 || timeout_sec > MAX_TIMEOUT_SEC {
            return Err(ToolError::InvalidParams {
                tool: "http".into(),
                reason: format!("timeout_sec must be 1..={MAX_TIMEOUT_SEC}, got {timeout_sec}"),
            });
        }

        let read_only = method == "GET";
        if ctx.safety_mode == SafetyMode::Observe && !read_only {
            return Err(ToolError::Rejected(format!(
                "observe mode permits GET only; refusing {method} {}",
                params.url
            )));
        }
        if ctx.approval_mode && !read_only {
            return Err(ToolError::ApprovalRequired {
                action: format!("{method} {}", params.url),
            });
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_sec))
            .build()
            .map_err(|e| ToolError::Execution(format!("http client: {e}")))?;

        let mut request = match method.as_str() {
            "GET" => client.get(&params.url),
            "POST" => client.post(&params.url),
            "PUT" => client.put(&params.url),
            _ => client.delete(&params.url),
        };
        if let Some(body) = &params.body {
            request = request.json(body);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let exit_code = if status.is_success() { 0 } else { 1 };
                Ok(ToolOutcome::new(
                    exit_code,
                    format!("HTTP {status}\n{body}"),
                ))
            }
            Err(e) if e.is_timeout() => Ok(ToolOutcome::new(TIMEOUT_EXIT_CODE, "timed out")),
            Err(e) => Ok(ToolOutcome::new(1, format!("request failed: {e}"))),
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
    async fn test_observe_mode_rejects_post() {
        let tool = HttpTool::new();
        let err = tool
            .execute(
                &serde_json::json!({"method": "POST", "url": "http://pd:2379/reset"}),
                ctx(SafetyMode::Observe, false),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_approval_mode_gates_mutating_methods() {
        let tool = HttpTool::new();
        let err = tool
            .execute(
                &serde_json::json!({"method": "DELETE", "url": "http://pd:2379/store/2"}),
                ctx(SafetyMode::Execute, true),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ApprovalRequired { .. }));
    }

    #[tokio::test]
    async fn test_invalid_method() {
        let tool = HttpTool::new();
        let err = tool
            .execute(
                &serde_json::json!({"method": "PATCH", "url": "http://x"}),
                ctx(SafetyMode::Execute, false),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams { .. }));
    }

    #[tokio::test]
    async fn test_connection_failure_is_an_outcome() {
        let tool = HttpTool::new();
        // Unroutable port on localhost: the request fails fast and the
        // failure is fed back to the model as a non-zero outcome.
        let outcome = tool
            .execute(
                &serde_json::json!({
                    "method": "GET",
                    "url": "http://127.0.0.1:1/health",
                    "timeout_sec": 2
                }),
                ctx(SafetyMode::Observe, false),
            )
            .await
            .unwrap();
        assert_ne!(outcome.exit_code, 0);
    }
}

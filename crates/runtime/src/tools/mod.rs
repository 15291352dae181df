//! Tool runtime: the constrained surface the agent's conversation may
//! invoke.
//!
//! Each tool pairs a machine-readable spec (name, parameter schema,
//! approval/mutation flags) with an executor. Execution is synchronous
//! from the conversation's perspective: one call at a time, awaited.
//! Tools never write to the audit log themselves; the agent loop
//! records the `tool_call`/`tool_result` pair around each execution.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::types::{SafetyMode, ToolError};

pub mod http;
pub mod shell;

pub use http::HttpTool;
pub use shell::ShellTool;

/// Machine-readable declaration of one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema for the tool parameters.
    pub parameters: serde_json::Value,
    /// Whether calls must pass the approval gate when approval mode is on.
    pub requires_approval: bool,
    /// Whether the tool can mutate the subject.
    pub mutating: bool,
}

/// Safety switches resolved at agent start from the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionContext {
    pub safety_mode: SafetyMode,
    pub approval_mode: bool,
}

/// Result of one tool execution, shell-style.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub exit_code: i32,
    /// Combined output, untruncated. The agent loop stores the full
    /// text in the audit log and truncates what it feeds back to the
    /// model.
    pub output: String,
}

impl ToolOutcome {
    pub fn new(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
        }
    }
}

/// One executable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> &ToolSpec;

    /// Validate params and execute. Observe-mode rejections and
    /// approval gating surface as typed errors; runtime failures of the
    /// command itself are successful executions with non-zero exit.
    async fn execute(
        &self,
        params: &serde_json::Value,
        ctx: ExecutionContext,
    ) -> Result<ToolOutcome, ToolError>;
}

/// The tool manifest handed to the conversation.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the standard remediation surface: shell and HTTP.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ShellTool::new()));
        registry.register(Arc::new(HttpTool::new()));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.spec().name == name)
    }

    pub fn specs(&self) -> Vec<&ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    /// Tool definitions in the wire shape the model API expects.
    pub fn definitions(&self) -> Vec<serde_json::Value> {
        self.tools
            .iter()
            .map(|t| {
                let spec = t.spec();
                serde_json::json!({
                    "name": spec.name,
                    "description": spec.description,
                    "input_schema": spec.parameters,
                })
            })
            .collect()
    }

    pub async fn execute(
        &self,
        name: &str,
        params: &serde_json::Value,
        ctx: ExecutionContext,
    ) -> Result<ToolOutcome, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        tool.execute(params, ctx).await
    }
}

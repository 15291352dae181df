//! Core domain types shared across the Operator runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod error;

pub use error::{
    ConfigError, EvalError, InvariantError, ModelError, OperatorError, StoreError, SubjectError,
    ToolError,
};

/// Severity of an invariant and the tickets it opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// Lifecycle state of a ticket. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    InProgress,
    Resolved,
    Escalated,
}

impl TicketStatus {
    /// Whether no further transitions are allowed from this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Escalated)
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Resolved => write!(f, "resolved"),
            Self::Escalated => write!(f, "escalated"),
        }
    }
}

impl FromStr for TicketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "resolved" => Ok(Self::Resolved),
            "escalated" => Ok(Self::Escalated),
            other => Err(format!("unknown ticket status: {other}")),
        }
    }
}

/// Lifecycle state of an agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Escalated,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Escalated => write!(f, "escalated"),
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "escalated" => Ok(Self::Escalated),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Kind of an audit-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Reasoning,
    ToolCall,
    ToolResult,
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reasoning => write!(f, "reasoning"),
            Self::ToolCall => write!(f, "tool_call"),
            Self::ToolResult => write!(f, "tool_result"),
        }
    }
}

impl FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reasoning" => Ok(Self::Reasoning),
            "tool_call" => Ok(Self::ToolCall),
            "tool_result" => Ok(Self::ToolResult),
            other => Err(format!("unknown entry type: {other}")),
        }
    }
}

/// Lifecycle state of an action proposal in approval mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Proposed,
    Validated,
    Cancelled,
    Executing,
    Completed,
    Failed,
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proposed => write!(f, "proposed"),
            Self::Validated => write!(f, "validated"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Executing => write!(f, "executing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for ProposalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proposed" => Ok(Self::Proposed),
            "validated" => Ok(Self::Validated),
            "cancelled" => Ok(Self::Cancelled),
            "executing" => Ok(Self::Executing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown proposal status: {other}")),
        }
    }
}

/// Final outcome of an evaluation trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialOutcome {
    Resolved,
    Escalated,
    Timeout,
    Error,
}

impl fmt::Display for TrialOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolved => write!(f, "resolved"),
            Self::Escalated => write!(f, "escalated"),
            Self::Timeout => write!(f, "timeout"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl FromStr for TrialOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resolved" => Ok(Self::Resolved),
            "escalated" => Ok(Self::Escalated),
            "timeout" => Ok(Self::Timeout),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown trial outcome: {other}")),
        }
    }
}

/// Whether the agent may execute mutating tool calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyMode {
    /// Read-only: mutating tool requests are rejected.
    Observe,
    /// Tool calls execute (subject to approval mode).
    Execute,
}

impl fmt::Display for SafetyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Observe => write!(f, "observe"),
            Self::Execute => write!(f, "execute"),
        }
    }
}

impl FromStr for SafetyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observe" => Ok(Self::Observe),
            "execute" => Ok(Self::Execute),
            other => Err(format!("unknown safety mode: {other}")),
        }
    }
}

/// A durable record of an invariant violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: i64,
    pub invariant_name: String,
    pub subject_name: String,
    pub violation_key: String,
    pub severity: Severity,
    pub status: TicketStatus,
    pub opened_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub violation_details: serde_json::Value,
    pub diagnosis: Option<String>,
    pub assigned_session_id: Option<String>,
}

/// One agent's end-to-end handling of one ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub session_id: String,
    pub ticket_id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub outcome_summary: Option<String>,
}

/// Append-only audit entry within a session. `seq` is monotonic from 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLogEntry {
    pub session_id: String,
    pub seq: i64,
    pub timestamp: DateTime<Utc>,
    pub entry_type: EntryType,
    pub tool_name: Option<String>,
    pub tool_params: Option<serde_json::Value>,
    pub content: String,
    pub exit_code: Option<i32>,
}

/// A mutating action awaiting operator approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionProposal {
    pub id: i64,
    pub ticket_id: i64,
    pub action_name: String,
    pub params: serde_json::Value,
    pub status: ProposalStatus,
    pub proposed_at: DateTime<Utc>,
    pub validated_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_by: Option<String>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<String>,
    pub rejection_reason: Option<String>,
}

impl ActionProposal {
    /// Approval is derived state: an approved proposal carries a timestamp.
    pub fn is_approved(&self) -> bool {
        self.approved_at.is_some()
    }
}

/// A labelled batch of trials sharing subject, chaos type, and variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: i64,
    pub name: String,
    pub subject_name: String,
    pub chaos_type: String,
    pub variant: Option<String>,
    pub is_baseline: bool,
    pub created_at: DateTime<Utc>,
}

/// One chaos experiment: inject, detect, resolve, snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trial {
    pub id: i64,
    pub campaign_id: i64,
    pub started_at: DateTime<Utc>,
    pub chaos_injected_at: DateTime<Utc>,
    pub chaos_metadata: serde_json::Value,
    pub ticket_created_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    pub outcome: TrialOutcome,
    pub initial_state: serde_json::Value,
    pub final_state: serde_json::Value,
    pub commands_json: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            TicketStatus::Open,
            TicketStatus::InProgress,
            TicketStatus::Resolved,
            TicketStatus::Escalated,
        ] {
            let parsed: TicketStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<TicketStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TicketStatus::Open.is_terminal());
        assert!(!TicketStatus::InProgress.is_terminal());
        assert!(TicketStatus::Resolved.is_terminal());
        assert!(TicketStatus::Escalated.is_terminal());
    }

    #[test]
    fn test_proposal_approval_is_derived() {
        let mut proposal = ActionProposal {
            id: 1,
            ticket_id: 7,
            action_name: "shell".into(),
            params: serde_json::json!({"command": "docker restart tikv0"}),
            status: ProposalStatus::Validated,
            proposed_at: Utc::now(),
            validated_at: Some(Utc::now()),
            approved_at: None,
            approved_by: None,
            rejected_at: None,
            rejected_by: None,
            rejection_reason: None,
        };
        assert!(!proposal.is_approved());
        proposal.approved_at = Some(Utc::now());
        assert!(proposal.is_approved());
    }
}

//! Operator runtime: autonomous remediation for distributed
//! infrastructure.
//!
//! A monitor polls a subject, evaluates declarative invariants, and
//! opens tickets for violations; an agent dequeues tickets and drives a
//! tool-mediated model conversation to diagnose and fix them; an
//! evaluation harness runs chaos campaigns against the pair. All three
//! coordinate exclusively through one shared SQLite store.

pub mod agent;
pub mod config;
pub mod eval;
pub mod invariant;
pub mod monitor;
pub mod shutdown;
pub mod store;
pub mod subject;
pub mod tools;
pub mod types;

// Re-export the types most callers wire together.
pub use agent::{Agent, AgentConfig, AnthropicClient, ModelClient, OutcomeSummarizer};
pub use eval::{
    analysis::{
        analyze_campaign, compare_baseline, compare_campaigns, CampaignAnalysis,
        CommandClassifier, HeuristicClassifier, ModelClassifier,
    },
    CampaignRun, CampaignSpec, Harness,
};
pub use invariant::{Invariant, Violation};
pub use monitor::{Monitor, MonitorConfig};
pub use shutdown::ShutdownFlag;
pub use store::{new_session_id, NewLogEntry, NewTrial, Store};
pub use subject::{
    scripted::{ScriptedSubject, SubjectSpec},
    ChaosInjector, InvariantChecker, Observation, Subject,
};
pub use tools::{Tool, ToolOutcome, ToolRegistry, ToolSpec};
pub use types::{
    OperatorError, SafetyMode, Severity, SessionStatus, Ticket, TicketStatus, TrialOutcome,
};

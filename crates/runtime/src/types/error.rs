//! Error types for the Operator runtime.
//!
//! Recovery is local by default: the monitor skips a tick on subject
//! failures, the agent feeds tool failures back to the model, and only
//! configuration errors bubble up to process exit.

use thiserror::Error;

/// Top-level runtime error.
#[derive(Error, Debug)]
pub enum OperatorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("subject error: {0}")]
    Subject(#[from] SubjectError),

    #[error("invariant error: {0}")]
    Invariant(#[from] InvariantError),

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("evaluation error: {0}")]
    Eval(#[from] EvalError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("shutdown requested by {signal}")]
    Shutdown { signal: String },
}

/// Persistence errors from the shared SQLite store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("ticket {id} not found")]
    TicketNotFound { id: i64 },

    #[error("ticket {id} cannot transition from {status} to {requested}")]
    StateConflict {
        id: i64,
        status: String,
        requested: String,
    },

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("session {session_id} is not running")]
    SessionNotRunning { session_id: String },

    #[error("proposal {id} cannot transition from {status} to {requested}")]
    ProposalStateConflict {
        id: i64,
        status: String,
        requested: String,
    },

    #[error("proposal {id} not found")]
    ProposalNotFound { id: i64 },

    #[error("campaign {id} not found")]
    CampaignNotFound { id: i64 },

    #[error("trial {id} not found")]
    TrialNotFound { id: i64 },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e.to_string())
    }
}

/// Failures observing or resetting a subject. Transient by policy.
#[derive(Error, Debug)]
pub enum SubjectError {
    #[error("observation failed: {0}")]
    Observe(String),

    #[error("observation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("reset failed: {0}")]
    Reset(String),

    #[error("invalid observation payload: {0}")]
    InvalidPayload(String),
}

/// An invariant's evaluate closure failed for one tick.
#[derive(Error, Debug)]
#[error("invariant '{name}' evaluation failed: {reason}")]
pub struct InvariantError {
    pub name: String,
    pub reason: String,
}

/// LLM provider and protocol errors.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("unparseable model response: {0}")]
    Protocol(String),

    #[error("model request timed out")]
    Timeout,
}

/// Tool execution failures surfaced to the agent loop.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid parameters for {tool}: {reason}")]
    InvalidParams { tool: String, reason: String },

    #[error("rejected in observe mode: {0}")]
    Rejected(String),

    #[error("approval required for {action}")]
    ApprovalRequired { action: String },

    #[error("tool execution failed: {0}")]
    Execution(String),
}

/// Evaluation harness and analysis errors.
#[derive(Error, Debug)]
pub enum EvalError {
    #[error("invalid campaign config: {0}")]
    Config(String),

    #[error("chaos injection failed: {0}")]
    Chaos(String),

    #[error("campaigns are not comparable: {0}")]
    NotComparable(String),

    #[error("classification failed: {0}")]
    Classification(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Subject(#[from] SubjectError),
}

/// Invalid CLI arguments or environment. Fatal before any loop starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

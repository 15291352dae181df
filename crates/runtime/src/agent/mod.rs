//! Agent loop: consume open tickets and drive a tool-mediated model
//! conversation until the violation is resolved or the session is
//! abandoned.
//!
//! The loop claims one ticket at a time (the `open → in_progress`
//! transition in the store is the fence against other agents), runs the
//! conversation with a full audit trail, then maps the conversation end
//! onto ticket and session state: a completed session resolves the
//! ticket, everything else escalates it.

use std::sync::Arc;
use std::time::Duration;

use crate::shutdown::ShutdownFlag;
use crate::store::{new_session_id, NewLogEntry, Store};
use crate::subject::Subject;
use crate::tools::{ExecutionContext, ToolOutcome, ToolRegistry};
use crate::types::{
    ConfigError, ModelError, OperatorError, SafetyMode, SessionStatus, Ticket, ToolError,
};

pub mod conversation;
pub mod llm;
pub mod prompts;
pub mod summary;

pub use conversation::{Conversation, ConversationMessage, MessageRole, ToolCall};
pub use llm::{AnthropicClient, ModelClient, ModelOptions, ModelResponse, StopReason};
pub use summary::OutcomeSummarizer;

use prompts::RESOLVED_SENTINEL;

/// Default conversation turn cap.
const DEFAULT_MAX_TURNS: u32 = 16;
/// Consecutive identical tool failures before the session escalates.
const DEFAULT_TOOL_ERROR_QUOTA: u32 = 3;
/// Tool output fed back to the model is truncated to this many bytes;
/// the audit log keeps the full text.
const TOOL_FEEDBACK_LIMIT: usize = 8 * 1024;
/// Bounded retries when the provider rate-limits.
const RATE_LIMIT_RETRIES: u32 = 5;

/// Agent tuning, partially resolved from the environment.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub poll_interval: Duration,
    pub max_turns: u32,
    pub model: String,
    pub summary_model: String,
    pub safety_mode: SafetyMode,
    pub approval_mode: bool,
    pub tool_error_quota: u32,
    pub tool_feedback_limit: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_turns: DEFAULT_MAX_TURNS,
            model: "claude-sonnet-4-20250514".to_string(),
            summary_model: "claude-3-5-haiku-20241022".to_string(),
            safety_mode: SafetyMode::Observe,
            approval_mode: false,
            tool_error_quota: DEFAULT_TOOL_ERROR_QUOTA,
            tool_feedback_limit: TOOL_FEEDBACK_LIMIT,
        }
    }
}

impl AgentConfig {
    /// Defaults with safety and approval modes resolved from
    /// `OPERATOR_SAFETY_MODE` and `OPERATOR_APPROVAL_MODE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            safety_mode: crate::config::safety_mode_from_env()?,
            approval_mode: crate::config::approval_mode_from_env()?,
            ..Self::default()
        })
    }
}

/// How a conversation ended, before it is mapped onto store state.
#[derive(Debug)]
enum ConversationEnd {
    /// The model declared the sentinel in a final reply.
    Resolved,
    /// Final reply without the sentinel.
    Unresolved { reason: String },
    TurnLimit,
    ToolErrorQuota { signature: String },
    ApprovalRequired { proposal_id: i64 },
    /// Two unparseable responses in a row.
    ProtocolFailure,
    Interrupted { signal: String },
}

/// The ticket-consuming agent daemon.
pub struct Agent {
    store: Store,
    subject: Arc<dyn Subject>,
    client: Arc<dyn ModelClient>,
    tools: ToolRegistry,
    summarizer: OutcomeSummarizer,
    config: AgentConfig,
    shutdown: ShutdownFlag,
}

impl Agent {
    pub fn new(
        store: Store,
        subject: Arc<dyn Subject>,
        client: Arc<dyn ModelClient>,
        tools: ToolRegistry,
        config: AgentConfig,
        shutdown: ShutdownFlag,
    ) -> Self {
        let summarizer = OutcomeSummarizer::new(client.clone(), &config.summary_model);
        Self {
            store,
            subject,
            client,
            tools,
            summarizer,
            config,
            shutdown,
        }
    }

    /// Poll for open tickets until shutdown. A session in flight when
    /// the signal arrives is finalised as escalated before the loop
    /// exits.
    pub async fn run(&self) -> Result<(), OperatorError> {
        tracing::info!(
            subject = self.subject.name(),
            safety_mode = %self.config.safety_mode,
            approval_mode = self.config.approval_mode,
            "agent started"
        );
        loop {
            if self.shutdown.is_requested() {
                break;
            }
            let session_id = new_session_id();
            let ticket = match self.store.claim_open_ticket(&session_id) {
                Ok(ticket) => ticket,
                Err(e) => {
                    tracing::error!(error = %e, "claim failed");
                    if self.shutdown.sleep(self.config.poll_interval).await {
                        break;
                    }
                    continue;
                }
            };
            let Some(ticket) = ticket else {
                if self.shutdown.sleep(self.config.poll_interval).await {
                    break;
                }
                continue;
            };

            self.store.start_session(ticket.id, &session_id)?;
            tracing::info!(ticket = ticket.id, session = %session_id, "ticket claimed");

            match self.run_conversation(&ticket, &session_id).await {
                Ok(end) => self.finalize(&ticket, &session_id, end).await?,
                Err(e) => {
                    // Unexpected failure: close the session as failed and
                    // escalate so the ticket is never stranded in_progress.
                    let reason = e.to_string();
                    tracing::error!(ticket = ticket.id, error = %reason, "session failed");
                    if let Err(e) =
                        self.store
                            .finish_session(&session_id, SessionStatus::Failed, &reason)
                    {
                        tracing::error!(error = %e, "could not finish failed session");
                    }
                    if let Err(e) = self.store.escalate_ticket(ticket.id, &reason) {
                        tracing::error!(error = %e, "could not escalate ticket");
                    }
                }
            }
        }
        tracing::info!("agent stopped");
        Ok(())
    }

    /// Map a conversation end onto session and ticket state.
    async fn finalize(
        &self,
        ticket: &Ticket,
        session_id: &str,
        end: ConversationEnd,
    ) -> Result<(), OperatorError> {
        match end {
            ConversationEnd::Resolved => {
                let log = self.store.get_log(session_id)?;
                let summary = self.summarizer.summarize(&log).await;
                self.store
                    .finish_session(session_id, SessionStatus::Completed, &summary)?;
                self.store.resolve_ticket(ticket.id, &summary)?;
                tracing::info!(ticket = ticket.id, summary = %summary, "ticket resolved");
            }
            other => {
                let reason = match other {
                    ConversationEnd::Unresolved { reason } => reason,
                    ConversationEnd::TurnLimit => "turn limit reached".to_string(),
                    ConversationEnd::ToolErrorQuota { signature } => {
                        format!("tool error quota exceeded: {signature}")
                    }
                    ConversationEnd::ApprovalRequired { proposal_id } => {
                        format!("approval required: {proposal_id}")
                    }
                    ConversationEnd::ProtocolFailure => "model protocol failure".to_string(),
                    ConversationEnd::Interrupted { signal } => {
                        format!("interrupted by {signal}")
                    }
                    ConversationEnd::Resolved => unreachable!("handled above"),
                };
                self.store
                    .finish_session(session_id, SessionStatus::Escalated, &reason)?;
                self.store.escalate_ticket(ticket.id, &reason)?;
                tracing::warn!(ticket = ticket.id, reason = %reason, "ticket escalated");
            }
        }
        Ok(())
    }

    async fn run_conversation(
        &self,
        ticket: &Ticket,
        session_id: &str,
    ) -> Result<ConversationEnd, OperatorError> {
        let specs = self.tools.specs();
        let mut conversation = Conversation::with_system(prompts::system_prompt(
            self.subject.name(),
            self.subject.description(),
            &specs,
        ));
        conversation.push(ConversationMessage::user(prompts::ticket_message(ticket)));

        let mut options = ModelOptions::new(&self.config.model);
        options.max_tokens = 4096;
        options.tools = self.tools.definitions();

        let ctx = ExecutionContext {
            safety_mode: self.config.safety_mode,
            approval_mode: self.config.approval_mode,
        };

        let mut consecutive_errors = 0u32;
        let mut error_signature = String::new();
        let mut protocol_retried = false;

        for _turn in 0..self.config.max_turns {
            if let Some(signal) = self.interrupted() {
                return Ok(ConversationEnd::Interrupted { signal });
            }

            let response = match self.complete_with_backoff(&conversation, &options).await {
                Ok(response) => response,
                Err(ModelError::Protocol(e)) => {
                    if protocol_retried {
                        tracing::warn!(error = %e, "second protocol failure, escalating");
                        return Ok(ConversationEnd::ProtocolFailure);
                    }
                    protocol_retried = true;
                    tracing::warn!(error = %e, "protocol failure, retrying with simplified prompt");
                    conversation.push(ConversationMessage::user(prompts::protocol_retry_message()));
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if !response.text.trim().is_empty() {
                self.store
                    .append_log(session_id, NewLogEntry::reasoning(response.text.trim()))?;
            }

            if response.tool_calls.is_empty() {
                let text = response.text.trim();
                if text
                    .trim_start_matches(['#', '*', ' '])
                    .to_ascii_uppercase()
                    .starts_with(RESOLVED_SENTINEL)
                {
                    return Ok(ConversationEnd::Resolved);
                }
                return Ok(ConversationEnd::Unresolved {
                    reason: "agent ended without resolution".to_string(),
                });
            }

            conversation.push(ConversationMessage::assistant_tool_calls(
                response.text.clone(),
                response.tool_calls.clone(),
            ));

            for call in &response.tool_calls {
                if let Some(signal) = self.interrupted() {
                    return Ok(ConversationEnd::Interrupted { signal });
                }

                self.store.append_log(
                    session_id,
                    NewLogEntry::tool_call(&call.name, call.arguments.clone()),
                )?;

                let outcome = match self.tools.execute(&call.name, &call.arguments, ctx).await {
                    Ok(outcome) => outcome,
                    Err(ToolError::ApprovalRequired { action }) => {
                        let proposal_id =
                            self.store
                                .create_proposal(ticket.id, &call.name, &call.arguments)?;
                        // Parameters already passed tool validation.
                        self.store.validate_proposal(proposal_id)?;
                        self.store.append_log(
                            session_id,
                            NewLogEntry::tool_result(
                                &call.name,
                                1,
                                format!("approval required: proposal {proposal_id} ({action})"),
                            ),
                        )?;
                        return Ok(ConversationEnd::ApprovalRequired { proposal_id });
                    }
                    Err(ToolError::Rejected(message)) => {
                        ToolOutcome::new(1, format!("rejected: {message}"))
                    }
                    Err(ToolError::InvalidParams { reason, .. }) => {
                        ToolOutcome::new(2, format!("invalid parameters: {reason}"))
                    }
                    Err(ToolError::UnknownTool(name)) => {
                        ToolOutcome::new(127, format!("unknown tool: {name}"))
                    }
                    Err(ToolError::Execution(message)) => {
                        ToolOutcome::new(1, format!("execution failed: {message}"))
                    }
                };

                // Full output to the audit log, truncated copy to the model.
                self.store.append_log(
                    session_id,
                    NewLogEntry::tool_result(&call.name, outcome.exit_code, outcome.output.clone()),
                )?;
                let feedback = format!(
                    "exit code: {}\n{}",
                    outcome.exit_code,
                    truncate_output(&outcome.output, self.config.tool_feedback_limit)
                );
                conversation.push(ConversationMessage::tool_result(&call.id, feedback));

                let signature = format!("{}:{}", call.name, call.arguments);
                if outcome.exit_code != 0 {
                    if signature == error_signature {
                        consecutive_errors += 1;
                    } else {
                        error_signature = signature;
                        consecutive_errors = 1;
                    }
                    if consecutive_errors >= self.config.tool_error_quota {
                        return Ok(ConversationEnd::ToolErrorQuota {
                            signature: error_signature,
                        });
                    }
                } else {
                    consecutive_errors = 0;
                    error_signature.clear();
                }
            }
        }

        Ok(ConversationEnd::TurnLimit)
    }

    /// One completion with bounded retries on rate limiting.
    async fn complete_with_backoff(
        &self,
        conversation: &Conversation,
        options: &ModelOptions,
    ) -> Result<ModelResponse, ModelError> {
        let mut attempts = 0;
        loop {
            match self.client.complete(conversation, options).await {
                Err(ModelError::RateLimited { retry_after_ms }) if attempts < RATE_LIMIT_RETRIES => {
                    attempts += 1;
                    let wait = Duration::from_millis(retry_after_ms.min(30_000));
                    tracing::warn!(attempts, wait_ms = wait.as_millis() as u64, "rate limited");
                    if self.shutdown.sleep(wait).await {
                        return Err(ModelError::Provider("shutdown during backoff".into()));
                    }
                }
                other => return other,
            }
        }
    }

    fn interrupted(&self) -> Option<String> {
        if self.shutdown.is_requested() {
            Some(self.shutdown.signal_name().unwrap_or_else(|| "signal".into()))
        } else {
            None
        }
    }
}

/// Truncate on a char boundary, appending a marker when cut.
fn truncate_output(output: &str, limit: usize) -> String {
    if output.len() <= limit {
        return output.to_string();
    }
    let mut end = limit;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[output truncated at {limit} bytes]", &output[..end])
}

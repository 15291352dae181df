//! Prompt assembly for the remediation conversation.

use crate::tools::ToolSpec;
use crate::types::Ticket;

/// Sentinel the model must lead its final reply with once the
/// violation is fixed and verified.
pub const RESOLVED_SENTINEL: &str = "RESOLVED";

/// System prompt: operator role, subject identity, and the tool list.
pub fn system_prompt(subject_name: &str, subject_description: &str, tools: &[&ToolSpec]) -> String {
    let mut prompt = format!(
        "You are an autonomous site reliability operator responsible for the \
         '{subject_name}' system.\n\nSubject description:\n{subject_description}\n\n\
         A monitoring invariant has been violated and a ticket has been opened. \
         Diagnose the violation and remediate it using the tools available. \
         Work incrementally: inspect before you mutate, and verify after every fix.\n\n\
         Available tools:\n"
    );
    for tool in tools {
        let mut line = format!("- {}: {}", tool.name, tool.description);
        if tool.mutating {
            line.push_str(" [mutating]");
        }
        if tool.requires_approval {
            line.push_str(" [approval-gated when approval mode is on]");
        }
        prompt.push_str(&line);
        prompt.push('\n');
    }
    prompt.push_str(&format!(
        "\nWhen the violation is fixed and you have verified the subject is healthy, \
         reply with a final message starting with \"{RESOLVED_SENTINEL}:\" followed by a \
         one-line description of what you did. If you determine the problem cannot be \
         fixed with the available tools, say so plainly and stop."
    ));
    prompt
}

/// The ticket rendered as the first user message.
pub fn ticket_message(ticket: &Ticket) -> String {
    let details = serde_json::to_string_pretty(&ticket.violation_details)
        .unwrap_or_else(|_| ticket.violation_details.to_string());
    format!(
        "Ticket #{id}: invariant '{invariant}' violated on subject '{subject}'.\n\
         Severity: {severity}\nOpened at: {opened}\nViolation key: {key}\n\n\
         Violation details:\n{details}",
        id = ticket.id,
        invariant = ticket.invariant_name,
        subject = ticket.subject_name,
        severity = ticket.severity,
        opened = ticket.opened_at.to_rfc3339(),
        key = ticket.violation_key,
    )
}

/// Reply nudging the model back on protocol after an unparseable
/// response.
pub fn protocol_retry_message() -> String {
    "Your previous response could not be parsed. Reply with either plain text or a \
     single tool call."
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Severity, TicketStatus};
    use chrono::Utc;

    #[test]
    fn test_system_prompt_mentions_subject_and_tools() {
        let spec = ToolSpec {
            name: "shell".into(),
            description: "run a command".into(),
            parameters: serde_json::json!({}),
            requires_approval: true,
            mutating: true,
        };
        let prompt = system_prompt("tikv", "a distributed KV store", &[&spec]);
        assert!(prompt.contains("tikv"));
        assert!(prompt.contains("- shell: run a command"));
        assert!(prompt.contains(RESOLVED_SENTINEL));
    }

    #[test]
    fn test_ticket_message_includes_details() {
        let ticket = Ticket {
            id: 42,
            invariant_name: "stores-up".into(),
            subject_name: "tikv".into(),
            violation_key: "store-2".into(),
            severity: Severity::Critical,
            status: TicketStatus::Open,
            opened_at: Utc::now(),
            resolved_at: None,
            violation_details: serde_json::json!({"state": "Down", "violation_key": "store-2"}),
            diagnosis: None,
            assigned_session_id: None,
        };
        let message = ticket_message(&ticket);
        assert!(message.contains("Ticket #42"));
        assert!(message.contains("stores-up"));
        assert!(message.contains("store-2"));
        assert!(message.contains("\"state\": \"Down\""));
    }
}

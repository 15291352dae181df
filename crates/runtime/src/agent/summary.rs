//! Outcome summarisation: a second, cheaper model call that condenses
//! a finished session into the one or two sentences the CLI and UI
//! surface.

use std::sync::Arc;

use super::conversation::{Conversation, ConversationMessage};
use super::llm::{ModelClient, ModelOptions};
use crate::types::{AgentLogEntry, EntryType};

/// Cap on the transcript excerpt handed to the summary model.
const TRANSCRIPT_LIMIT: usize = 6000;

pub struct OutcomeSummarizer {
    client: Arc<dyn ModelClient>,
    model: String,
}

impl OutcomeSummarizer {
    pub fn new(client: Arc<dyn ModelClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    /// Summarise a session log in at most two sentences. Falls back to
    /// a deterministic summary when the model call fails; the session
    /// outcome must never depend on the summariser.
    pub async fn summarize(&self, entries: &[AgentLogEntry]) -> String {
        let transcript = render_transcript(entries);
        let mut conversation = Conversation::with_system(
            "You summarise completed incident-remediation sessions. Reply with at most \
             two sentences describing the outcome and the last concrete action taken. \
             No preamble.",
        );
        conversation.push(ConversationMessage::user(transcript));

        let mut options = ModelOptions::new(&self.model);
        options.max_tokens = 200;
        options.temperature = 0.0;

        match self.client.complete(&conversation, &options).await {
            Ok(response) if !response.text.trim().is_empty() => response.text.trim().to_string(),
            Ok(_) => fallback_summary(entries),
            Err(e) => {
                tracing::warn!(error = %e, "summary model call failed, using fallback");
                fallback_summary(entries)
            }
        }
    }
}

/// Deterministic summary: the last tool action and its exit status.
pub fn fallback_summary(entries: &[AgentLogEntry]) -> String {
    let last_call = entries
        .iter()
        .rev()
        .find(|e| e.entry_type == EntryType::ToolCall);
    let last_result = entries
        .iter()
        .rev()
        .find(|e| e.entry_type == EntryType::ToolResult);

    match (last_call, last_result) {
        (Some(call), Some(result)) => {
            let action = call
                .tool_params
                .as_ref()
                .and_then(|p| p.get("command"))
                .and_then(|c| c.as_str())
                .map(ToString::to_string)
                .unwrap_or_else(|| call.content.clone());
            let status = match result.exit_code {
                Some(0) => "succeeded",
                Some(_) => "failed",
                None => "completed",
            };
            format!("Session ended after '{action}' {status}.")
        }
        _ => "Session ended without tool activity.".to_string(),
    }
}

fn render_transcript(entries: &[AgentLogEntry]) -> String {
    let mut transcript = String::new();
    for entry in entries {
        let line = match entry.entry_type {
            EntryType::Reasoning => format!("[agent] {}\n", entry.content),
            EntryType::ToolCall => format!("[call] {}\n", entry.content),
            EntryType::ToolResult => format!(
                "[result exit={}] {}\n",
                entry.exit_code.unwrap_or(-1),
                entry.content
            ),
        };
        transcript.push_str(&line);
    }
    // Keep the tail: the end of the session carries the outcome.
    if transcript.len() > TRANSCRIPT_LIMIT {
        let start = transcript.len() - TRANSCRIPT_LIMIT;
        let boundary = transcript
            .char_indices()
            .map(|(i, _)| i)
            .find(|&i| i >= start)
            .unwrap_or(0);
        transcript = transcript[boundary..].to_string();
    }
    transcript
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(entry_type: EntryType, content: &str, exit_code: Option<i32>) -> AgentLogEntry {
        AgentLogEntry {
            session_id: "s".into(),
            seq: 0,
            timestamp: Utc::now(),
            entry_type,
            tool_name: Some("shell".into()),
            tool_params: Some(serde_json::json!({"command": "docker start tikv0"})),
            content: content.into(),
            exit_code,
        }
    }

    #[test]
    fn test_fallback_summary_names_last_action() {
        let entries = vec![
            entry(EntryType::Reasoning, "restarting", None),
            entry(EntryType::ToolCall, "shell docker start tikv0", None),
            entry(EntryType::ToolResult, "tikv0", Some(0)),
        ];
        let summary = fallback_summary(&entries);
        assert!(summary.contains("docker start tikv0"));
        assert!(summary.contains("succeeded"));
    }

    #[test]
    fn test_fallback_summary_without_tools() {
        let entries = vec![entry(EntryType::Reasoning, "nothing to do", None)];
        assert_eq!(fallback_summary(&entries), "Session ended without tool activity.");
    }

    #[test]
    fn test_transcript_keeps_tail() {
        let mut entries = Vec::new();
        for i in 0..500 {
            entries.push(entry(EntryType::Reasoning, &format!("step {i}"), None));
        }
        let transcript = render_transcript(&entries);
        assert!(transcript.len() <= TRANSCRIPT_LIMIT);
        assert!(transcript.contains("step 499"));
    }
}

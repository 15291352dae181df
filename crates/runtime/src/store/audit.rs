//! Session and audit-log accessors.
//!
//! Log entries are append-only children of a session: `seq` is assigned
//! inside the append transaction as `max(seq)+1` starting at 0, and
//! entries are never updated or deleted.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};

use super::{parse_field, parse_opt_json, parse_opt_ts, parse_ts, ts, Store};
use crate::types::{AgentLogEntry, AgentSession, EntryType, SessionStatus, StoreError};

const SESSION_COLUMNS: &str =
    "session_id, ticket_id, started_at, ended_at, status, outcome_summary";
const ENTRY_COLUMNS: &str =
    "session_id, seq, timestamp, entry_type, tool_name, tool_params, content, exit_code";

/// Mint a session id: `{iso-timestamp}-{random8}`.
pub fn new_session_id() -> String {
    format!(
        "{}-{:08x}",
        Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
        rand::random::<u32>()
    )
}

/// An audit entry before it is assigned a sequence number.
#[derive(Debug, Clone)]
pub struct NewLogEntry {
    pub entry_type: EntryType,
    pub tool_name: Option<String>,
    pub tool_params: Option<serde_json::Value>,
    pub content: String,
    pub exit_code: Option<i32>,
    /// Defaults to now; tests may pin the timestamp.
    pub timestamp: Option<DateTime<Utc>>,
}

impl NewLogEntry {
    pub fn reasoning(content: impl Into<String>) -> Self {
        Self {
            entry_type: EntryType::Reasoning,
            tool_name: None,
            tool_params: None,
            content: content.into(),
            exit_code: None,
            timestamp: None,
        }
    }

    pub fn tool_call(tool_name: impl Into<String>, params: serde_json::Value) -> Self {
        let tool_name = tool_name.into();
        Self {
            entry_type: EntryType::ToolCall,
            content: format!("{tool_name} {params}"),
            tool_name: Some(tool_name),
            tool_params: Some(params),
            exit_code: None,
            timestamp: None,
        }
    }

    pub fn tool_result(
        tool_name: impl Into<String>,
        exit_code: i32,
        content: impl Into<String>,
    ) -> Self {
        Self {
            entry_type: EntryType::ToolResult,
            tool_name: Some(tool_name.into()),
            tool_params: None,
            content: content.into(),
            exit_code: Some(exit_code),
            timestamp: None,
        }
    }
}

impl Store {
    /// Insert the session row for a freshly claimed ticket. The id is
    /// minted by the caller (see [`new_session_id`]) so the claim can
    /// record it first.
    pub fn start_session(&self, ticket_id: i64, session_id: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO agent_sessions (session_id, ticket_id, started_at, status)
             VALUES (?1, ?2, ?3, 'running')",
            params![session_id, ticket_id, ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Append one audit entry, assigning the next sequence number.
    pub fn append_log(&self, session_id: &str, entry: NewLogEntry) -> Result<i64, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM agent_sessions WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::UnknownSession(session_id.to_string()));
        }

        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq) + 1, 0) FROM agent_log_entries WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;

        let params_text = entry
            .tool_params
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let timestamp = entry.timestamp.unwrap_or_else(Utc::now);

        tx.execute(
            "INSERT INTO agent_log_entries
                (session_id, seq, timestamp, entry_type, tool_name, tool_params, content, exit_code)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session_id,
                seq,
                ts(timestamp),
                entry.entry_type.to_string(),
                entry.tool_name,
                params_text,
                entry.content,
                entry.exit_code,
            ],
        )?;
        tx.commit()?;
        Ok(seq)
    }

    /// Close a running session with its final status and summary.
    pub fn finish_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        summary: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM agent_sessions WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        match current.as_deref() {
            None => return Err(StoreError::UnknownSession(session_id.to_string())),
            Some("running") => {}
            Some(_) => {
                return Err(StoreError::SessionNotRunning {
                    session_id: session_id.to_string(),
                })
            }
        }

        tx.execute(
            "UPDATE agent_sessions
             SET ended_at = ?1, status = ?2, outcome_summary = ?3
             WHERE session_id = ?4",
            params![ts(Utc::now()), status.to_string(), summary, session_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<AgentSession>, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM agent_sessions WHERE session_id = ?1"),
            params![session_id],
            row_to_session,
        )
        .optional()?
        .transpose()
    }

    /// Sessions newest first, for conversation replay listings.
    pub fn list_sessions(&self, limit: Option<u32>) -> Result<Vec<AgentSession>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM agent_sessions ORDER BY started_at DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![i64::from(limit.unwrap_or(u32::MAX))], row_to_session)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row??);
        }
        Ok(sessions)
    }

    /// Full log of one session in sequence order.
    pub fn get_log(&self, session_id: &str) -> Result<Vec<AgentLogEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM agent_log_entries WHERE session_id = ?1 ORDER BY seq"
        ))?;
        let rows = stmt.query_map(params![session_id], row_to_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row??);
        }
        Ok(entries)
    }

    /// Entries across all sessions inside a time window, ordered by
    /// timestamp. The harness uses this to extract trial commands.
    pub fn query_entries_by_timerange(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AgentLogEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM agent_log_entries
             WHERE timestamp >= ?1 AND timestamp <= ?2
             ORDER BY timestamp, session_id, seq"
        ))?;
        let rows = stmt.query_map(params![ts(start), ts(end)], row_to_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row??);
        }
        Ok(entries)
    }
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Result<AgentSession, StoreError>> {
    let session_id: String = row.get(0)?;
    let ticket_id: i64 = row.get(1)?;
    let started_at: String = row.get(2)?;
    let ended_at: Option<String> = row.get(3)?;
    let status: String = row.get(4)?;
    let outcome_summary: Option<String> = row.get(5)?;

    Ok((|| -> Result<AgentSession, StoreError> {
        Ok(AgentSession {
            session_id,
            ticket_id,
            started_at: parse_ts(&started_at)?,
            ended_at: parse_opt_ts(ended_at)?,
            status: parse_field(&status)?,
            outcome_summary,
        })
    })())
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<Result<AgentLogEntry, StoreError>> {
    let session_id: String = row.get(0)?;
    let seq: i64 = row.get(1)?;
    let timestamp: String = row.get(2)?;
    let entry_type: String = row.get(3)?;
    let tool_name: Option<String> = row.get(4)?;
    let tool_params: Option<String> = row.get(5)?;
    let content: String = row.get(6)?;
    let exit_code: Option<i32> = row.get(7)?;

    Ok((|| -> Result<AgentLogEntry, StoreError> {
        Ok(AgentLogEntry {
            session_id,
            seq,
            timestamp: parse_ts(&timestamp)?,
            entry_type: parse_field(&entry_type)?,
            tool_name,
            tool_params: parse_opt_json(tool_params)?,
            content,
            exit_code,
        })
    })())
}

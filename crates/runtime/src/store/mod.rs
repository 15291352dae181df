//! Shared SQLite store: tickets, audit sessions, action proposals, and
//! evaluation records.
//!
//! The store is the rendezvous point for the monitor, agent, harness,
//! and read-only viewers. Connections are per-operation: each accessor
//! opens a connection, runs inside a transaction where multi-statement,
//! and closes on return, letting SQLite manage file locking. Schema is
//! verified on every open with idempotent `CREATE IF NOT EXISTS`, so a
//! process started against a deleted or never-created database never
//! sees "no such table".

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::types::StoreError;

mod audit;
mod eval;
mod proposals;
mod tickets;

pub use audit::{new_session_id, NewLogEntry};
pub use eval::NewTrial;

/// Handle to the operator database. Cheap to clone; every operation
/// opens its own connection.
#[derive(Debug, Clone)]
pub struct Store {
    db_path: PathBuf,
}

impl Store {
    /// Open (or create) the store at the given path. The schema is
    /// created eagerly so later readers never race a missing table.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self {
            db_path: path.into(),
        };
        // Validate the path and materialise the schema up front.
        store.conn()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Open a connection for one operation. WAL for concurrent readers,
    /// a busy timeout so writers queue instead of failing, and schema
    /// init on every open.
    pub(crate) fn conn(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Sqlite(format!("create dir: {e}")))?;
            }
        }
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_millis(5000))?;
        init_schema(&conn)?;
        Ok(conn)
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tickets (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            invariant_name      TEXT NOT NULL,
            subject_name        TEXT NOT NULL,
            violation_key       TEXT NOT NULL,
            severity            TEXT NOT NULL,
            status              TEXT NOT NULL,
            opened_at           TEXT NOT NULL,
            resolved_at         TEXT,
            violation_details   TEXT NOT NULL DEFAULT '{}',
            diagnosis           TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_tickets_dedup
            ON tickets(invariant_name, subject_name, status, violation_key);
        CREATE INDEX IF NOT EXISTS idx_tickets_opened ON tickets(opened_at);

        CREATE TABLE IF NOT EXISTS agent_sessions (
            session_id      TEXT PRIMARY KEY,
            ticket_id       INTEGER NOT NULL,
            started_at      TEXT NOT NULL,
            ended_at        TEXT,
            status          TEXT NOT NULL,
            outcome_summary TEXT,
            FOREIGN KEY (ticket_id) REFERENCES tickets(id)
        );

        CREATE TABLE IF NOT EXISTS agent_log_entries (
            session_id  TEXT NOT NULL,
            seq         INTEGER NOT NULL,
            timestamp   TEXT NOT NULL,
            entry_type  TEXT NOT NULL,
            tool_name   TEXT,
            tool_params TEXT,
            content     TEXT NOT NULL,
            exit_code   INTEGER,
            PRIMARY KEY (session_id, seq),
            FOREIGN KEY (session_id) REFERENCES agent_sessions(session_id)
        );

        CREATE INDEX IF NOT EXISTS idx_log_entries_timestamp
            ON agent_log_entries(timestamp);

        CREATE TABLE IF NOT EXISTS action_proposals (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            ticket_id        INTEGER NOT NULL,
            action_name      TEXT NOT NULL,
            params           TEXT NOT NULL DEFAULT '{}',
            status           TEXT NOT NULL,
            proposed_at      TEXT NOT NULL,
            validated_at     TEXT,
            approved_at      TEXT,
            approved_by      TEXT,
            rejected_at      TEXT,
            rejected_by      TEXT,
            rejection_reason TEXT,
            FOREIGN KEY (ticket_id) REFERENCES tickets(id)
        );

        CREATE TABLE IF NOT EXISTS campaigns (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            name         TEXT NOT NULL,
            subject_name TEXT NOT NULL,
            chaos_type   TEXT NOT NULL,
            is_baseline  INTEGER NOT NULL DEFAULT 0,
            created_at   TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS trials (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            campaign_id       INTEGER NOT NULL,
            started_at        TEXT NOT NULL,
            chaos_injected_at TEXT NOT NULL,
            chaos_metadata    TEXT NOT NULL DEFAULT '{}',
            ticket_created_at TEXT,
            resolved_at       TEXT,
            ended_at          TEXT NOT NULL,
            outcome           TEXT NOT NULL,
            initial_state     TEXT NOT NULL DEFAULT 'null',
            final_state       TEXT NOT NULL DEFAULT 'null',
            commands_json     TEXT NOT NULL DEFAULT '[]',
            FOREIGN KEY (campaign_id) REFERENCES campaigns(id)
        );",
    )?;
    migrate(conn);
    Ok(())
}

/// Additive schema evolution: attempt each column addition and swallow
/// the failure when the column already exists. Never destructive.
fn migrate(conn: &Connection) {
    const ADDITIVE_COLUMNS: &[(&str, &str)] = &[
        ("tickets", "assigned_session_id TEXT"),
        ("campaigns", "variant TEXT"),
    ];
    for (table, column) in ADDITIVE_COLUMNS {
        let sql = format!("ALTER TABLE {table} ADD COLUMN {column}");
        if let Err(e) = conn.execute(&sql, []) {
            let message = e.to_string();
            if !message.contains("duplicate column name") {
                tracing::warn!(table, column, error = %message, "schema migration skipped");
            }
        }
    }
}

// ── Column codec helpers shared by the accessor modules ──────────────

pub(crate) fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339()
}

pub(crate) fn opt_ts(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(ts)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("timestamp '{raw}': {e}")))
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|s| parse_ts(&s)).transpose()
}

pub(crate) fn parse_json(raw: &str) -> Result<serde_json::Value, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Serialization(format!("json column: {e}")))
}

pub(crate) fn parse_opt_json(
    raw: Option<String>,
) -> Result<Option<serde_json::Value>, StoreError> {
    raw.map(|s| parse_json(&s)).transpose()
}

pub(crate) fn parse_field<T: std::str::FromStr<Err = String>>(
    raw: &str,
) -> Result<T, StoreError> {
    raw.parse().map_err(StoreError::Serialization)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Store;
    use tempfile::TempDir;

    /// Store backed by a fresh temporary database file.
    pub fn temp_store() -> (TempDir, Store) {
        let dir = TempDir::new().expect("tempdir");
        let store = Store::open(dir.path().join("operator.db")).expect("open store");
        (dir, store)
    }
}

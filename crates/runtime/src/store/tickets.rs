//! Ticket accessors: open with dedup, claim, resolve, escalate, list.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};

use super::{parse_field, parse_json, parse_opt_ts, parse_ts, ts, Store};
use crate::types::{Severity, StoreError, Ticket, TicketStatus};

const TICKET_COLUMNS: &str = "id, invariant_name, subject_name, violation_key, severity, status, \
     opened_at, resolved_at, violation_details, diagnosis, assigned_session_id";

impl Store {
    /// Open a ticket for a violation, or return the existing one.
    ///
    /// Upsert-like dedup: while a ticket for the same
    /// `(invariant_name, subject_name, violation_key)` is open or
    /// in_progress, its id is returned and no new row is created.
    /// Closed tickets do not block a new one.
    pub fn open_ticket(
        &self,
        invariant_name: &str,
        subject_name: &str,
        violation_key: &str,
        severity: Severity,
        details: &serde_json::Value,
    ) -> Result<i64, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM tickets
                 WHERE invariant_name = ?1 AND subject_name = ?2 AND violation_key = ?3
                   AND status IN ('open', 'in_progress')
                 ORDER BY opened_at LIMIT 1",
                params![invariant_name, subject_name, violation_key],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            tx.commit()?;
            return Ok(id);
        }

        let details_text = serde_json::to_string(details)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        tx.execute(
            "INSERT INTO tickets
                (invariant_name, subject_name, violation_key, severity, status,
                 opened_at, violation_details)
             VALUES (?1, ?2, ?3, ?4, 'open', ?5, ?6)",
            params![
                invariant_name,
                subject_name,
                violation_key,
                severity.to_string(),
                ts(Utc::now()),
                details_text,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// Atomically claim the oldest open ticket for the given session:
    /// the `open → in_progress` transition is the synchronisation fence
    /// between monitor and agent.
    pub fn claim_open_ticket(&self, session_id: &str) -> Result<Option<Ticket>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let id: Option<i64> = tx
            .query_row(
                "SELECT id FROM tickets WHERE status = 'open' ORDER BY opened_at LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let Some(id) = id else {
            tx.commit()?;
            return Ok(None);
        };

        tx.execute(
            "UPDATE tickets SET status = 'in_progress', assigned_session_id = ?1
             WHERE id = ?2 AND status = 'open'",
            params![session_id, id],
        )?;

        let ticket = tx.query_row(
            &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = ?1"),
            params![id],
            row_to_ticket,
        )??;
        tx.commit()?;
        Ok(Some(ticket))
    }

    /// Mark a ticket resolved with a diagnosis summary. Only valid from
    /// `open` or `in_progress`.
    pub fn resolve_ticket(&self, id: i64, summary: &str) -> Result<(), StoreError> {
        self.close_ticket(id, TicketStatus::Resolved, summary)
    }

    /// Mark a ticket escalated with a reason. Only valid from `open` or
    /// `in_progress`.
    pub fn escalate_ticket(&self, id: i64, reason: &str) -> Result<(), StoreError> {
        self.close_ticket(id, TicketStatus::Escalated, reason)
    }

    fn close_ticket(
        &self,
        id: i64,
        target: TicketStatus,
        summary: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM tickets WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(status) = status else {
            return Err(StoreError::TicketNotFound { id });
        };
        let current: TicketStatus = parse_field(&status)?;
        if current.is_terminal() {
            return Err(StoreError::StateConflict {
                id,
                status,
                requested: target.to_string(),
            });
        }

        tx.execute(
            "UPDATE tickets SET status = ?1, resolved_at = ?2, diagnosis = ?3 WHERE id = ?4",
            params![target.to_string(), ts(Utc::now()), summary, id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_ticket(&self, id: i64) -> Result<Option<Ticket>, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = ?1"),
            params![id],
            row_to_ticket,
        )
        .optional()?
        .transpose()
    }

    /// List tickets, optionally filtered by status, ordered by
    /// `opened_at`.
    pub fn list_tickets(
        &self,
        status: Option<TicketStatus>,
        limit: Option<u32>,
    ) -> Result<Vec<Ticket>, StoreError> {
        let conn = self.conn()?;
        let limit = i64::from(limit.unwrap_or(u32::MAX));
        let mut tickets = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TICKET_COLUMNS} FROM tickets WHERE status = ?1
                     ORDER BY opened_at LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![status.to_string(), limit], row_to_ticket)?;
                for row in rows {
                    tickets.push(row??);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TICKET_COLUMNS} FROM tickets ORDER BY opened_at LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit], row_to_ticket)?;
                for row in rows {
                    tickets.push(row??);
                }
            }
        }
        Ok(tickets)
    }

    /// Open and in_progress tickets for one subject, used by the
    /// monitor's reconcile step.
    pub fn active_tickets(&self, subject_name: &str) -> Result<Vec<Ticket>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets
             WHERE subject_name = ?1 AND status IN ('open', 'in_progress')
             ORDER BY opened_at"
        ))?;
        let rows = stmt.query_map(params![subject_name], row_to_ticket)?;
        let mut tickets = Vec::new();
        for row in rows {
            tickets.push(row??);
        }
        Ok(tickets)
    }

    /// Earliest ticket for a subject opened at or after the given
    /// instant. The harness uses this for its detection window.
    pub fn earliest_ticket_after(
        &self,
        subject_name: &str,
        after: DateTime<Utc>,
    ) -> Result<Option<Ticket>, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {TICKET_COLUMNS} FROM tickets
                 WHERE subject_name = ?1 AND opened_at >= ?2
                 ORDER BY opened_at LIMIT 1"
            ),
            params![subject_name, ts(after)],
            row_to_ticket,
        )
        .optional()?
        .transpose()
    }

    /// Ticket counts by status for the CLI status line.
    pub fn ticket_counts(&self) -> Result<BTreeMap<String, i64>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tickets GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (status, count) = row?;
            counts.insert(status, count);
        }
        Ok(counts)
    }
}

fn row_to_ticket(row: &Row<'_>) -> rusqlite::Result<Result<Ticket, StoreError>> {
    let id: i64 = row.get(0)?;
    let invariant_name: String = row.get(1)?;
    let subject_name: String = row.get(2)?;
    let violation_key: String = row.get(3)?;
    let severity: String = row.get(4)?;
    let status: String = row.get(5)?;
    let opened_at: String = row.get(6)?;
    let resolved_at: Option<String> = row.get(7)?;
    let violation_details: String = row.get(8)?;
    let diagnosis: Option<String> = row.get(9)?;
    let assigned_session_id: Option<String> = row.get(10)?;

    Ok((|| -> Result<Ticket, StoreError> {
        Ok(Ticket {
            id,
            invariant_name,
            subject_name,
            violation_key,
            severity: parse_field(&severity)?,
            status: parse_field(&status)?,
            opened_at: parse_ts(&opened_at)?,
            resolved_at: parse_opt_ts(resolved_at)?,
            violation_details: parse_json(&violation_details)?,
            diagnosis,
            assigned_session_id,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::temp_store;
    use super::*;

    fn details() -> serde_json::Value {
        serde_json::json!({"violation_key": "store-2", "state": "Down"})
    }

    #[test]
    fn test_open_ticket_dedup_while_open() {
        let (_dir, store) = temp_store();
        let first = store
            .open_ticket("stores-up", "tikv", "store-2", Severity::Critical, &details())
            .unwrap();
        let second = store
            .open_ticket("stores-up", "tikv", "store-2", Severity::Critical, &details())
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(store.list_tickets(None, None).unwrap().len(), 1);
    }

    #[test]
    fn test_open_ticket_dedup_while_in_progress() {
        let (_dir, store) = temp_store();
        let id = store
            .open_ticket("stores-up", "tikv", "store-2", Severity::Critical, &details())
            .unwrap();
        store.claim_open_ticket("sess-1").unwrap().unwrap();
        let again = store
            .open_ticket("stores-up", "tikv", "store-2", Severity::Critical, &details())
            .unwrap();
        assert_eq!(id, again);
    }

    #[test]
    fn test_closed_ticket_does_not_block_new_one() {
        let (_dir, store) = temp_store();
        let first = store
            .open_ticket("stores-up", "tikv", "store-2", Severity::Critical, &details())
            .unwrap();
        store.resolve_ticket(first, "invariant cleared").unwrap();
        let second = store
            .open_ticket("stores-up", "tikv", "store-2", Severity::Critical, &details())
            .unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_distinct_keys_get_distinct_tickets() {
        let (_dir, store) = temp_store();
        let a = store
            .open_ticket("stores-up", "tikv", "store-1", Severity::Critical, &details())
            .unwrap();
        let b = store
            .open_ticket("stores-up", "tikv", "store-2", Severity::Critical, &details())
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_claim_transitions_oldest_open() {
        let (_dir, store) = temp_store();
        let first = store
            .open_ticket("a", "tikv", "k1", Severity::Warning, &details())
            .unwrap();
        store
            .open_ticket("b", "tikv", "k2", Severity::Warning, &details())
            .unwrap();

        let claimed = store.claim_open_ticket("sess-1").unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.status, TicketStatus::InProgress);
        assert_eq!(claimed.assigned_session_id.as_deref(), Some("sess-1"));

        // Second claim gets the other ticket; third finds nothing.
        assert!(store.claim_open_ticket("sess-2").unwrap().is_some());
        assert!(store.claim_open_ticket("sess-3").unwrap().is_none());
    }

    #[test]
    fn test_resolve_from_terminal_is_conflict() {
        let (_dir, store) = temp_store();
        let id = store
            .open_ticket("a", "tikv", "k", Severity::Warning, &details())
            .unwrap();
        store.resolve_ticket(id, "fixed").unwrap();
        let err = store.resolve_ticket(id, "again").unwrap_err();
        assert!(matches!(err, StoreError::StateConflict { .. }));
        let err = store.escalate_ticket(id, "nope").unwrap_err();
        assert!(matches!(err, StoreError::StateConflict { .. }));
    }

    #[test]
    fn test_resolve_missing_ticket() {
        let (_dir, store) = temp_store();
        let err = store.resolve_ticket(999, "x").unwrap_err();
        assert!(matches!(err, StoreError::TicketNotFound { id: 999 }));
    }

    #[test]
    fn test_list_filter_and_order() {
        let (_dir, store) = temp_store();
        let a = store
            .open_ticket("a", "tikv", "k1", Severity::Warning, &details())
            .unwrap();
        let b = store
            .open_ticket("b", "tikv", "k2", Severity::Warning, &details())
            .unwrap();
        store.escalate_ticket(b, "gave up").unwrap();

        let open = store.list_tickets(Some(TicketStatus::Open), None).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, a);

        let all = store.list_tickets(None, None).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].opened_at <= all[1].opened_at);

        let limited = store.list_tickets(None, Some(1)).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_earliest_ticket_after_window() {
        let (_dir, store) = temp_store();
        let before = Utc::now() - chrono::Duration::seconds(5);
        let id = store
            .open_ticket("a", "tikv", "k", Severity::Critical, &details())
            .unwrap();

        let found = store.earliest_ticket_after("tikv", before).unwrap().unwrap();
        assert_eq!(found.id, id);

        let future = Utc::now() + chrono::Duration::seconds(60);
        assert!(store.earliest_ticket_after("tikv", future).unwrap().is_none());
        assert!(store.earliest_ticket_after("redis", before).unwrap().is_none());
    }

    #[test]
    fn test_ticket_counts() {
        let (_dir, store) = temp_store();
        let a = store
            .open_ticket("a", "tikv", "k1", Severity::Warning, &details())
            .unwrap();
        store
            .open_ticket("b", "tikv", "k2", Severity::Warning, &details())
            .unwrap();
        store.resolve_ticket(a, "done").unwrap();

        let counts = store.ticket_counts().unwrap();
        assert_eq!(counts.get("open"), Some(&1));
        assert_eq!(counts.get("resolved"), Some(&1));
    }
}

//! Action-proposal accessors for approval mode.
//!
//! Proposals move `proposed → validated`; approval stamps
//! `approved_at`/`approved_by` on a validated proposal, and rejection
//! transitions a validated proposal to `cancelled`.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};

use super::{parse_field, parse_json, parse_opt_ts, parse_ts, ts, Store};
use crate::types::{ActionProposal, ProposalStatus, StoreError};

const PROPOSAL_COLUMNS: &str = "id, ticket_id, action_name, params, status, proposed_at, \
     validated_at, approved_at, approved_by, rejected_at, rejected_by, rejection_reason";

impl Store {
    /// Record a new proposal for a mutating action.
    pub fn create_proposal(
        &self,
        ticket_id: i64,
        action_name: &str,
        params: &serde_json::Value,
    ) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        let params_text = serde_json::to_string(params)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        conn.execute(
            "INSERT INTO action_proposals (ticket_id, action_name, params, status, proposed_at)
             VALUES (?1, ?2, ?3, 'proposed', ?4)",
            params![ticket_id, action_name, params_text, ts(Utc::now())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Mark a proposed action as having passed parameter validation.
    pub fn validate_proposal(&self, id: i64) -> Result<(), StoreError> {
        self.transition_proposal(id, ProposalStatus::Proposed, |tx| {
            tx.execute(
                "UPDATE action_proposals SET status = 'validated', validated_at = ?1 WHERE id = ?2",
                params![ts(Utc::now()), id],
            )?;
            Ok(())
        })
    }

    /// Approve a validated proposal. Approval is recorded as a
    /// timestamp plus approver; the status remains `validated` and
    /// `is_approved` is derived.
    pub fn approve_proposal(&self, id: i64, approved_by: &str) -> Result<(), StoreError> {
        self.transition_proposal(id, ProposalStatus::Validated, |tx| {
            tx.execute(
                "UPDATE action_proposals SET approved_at = ?1, approved_by = ?2 WHERE id = ?3",
                params![ts(Utc::now()), approved_by, id],
            )?;
            Ok(())
        })
    }

    /// Reject a validated proposal, cancelling it.
    pub fn reject_proposal(
        &self,
        id: i64,
        rejected_by: &str,
        reason: &str,
    ) -> Result<(), StoreError> {
        self.transition_proposal(id, ProposalStatus::Validated, |tx| {
            tx.execute(
                "UPDATE action_proposals
                 SET status = 'cancelled', rejected_at = ?1, rejected_by = ?2,
                     rejection_reason = ?3
                 WHERE id = ?4",
                params![ts(Utc::now()), rejected_by, reason, id],
            )?;
            Ok(())
        })
    }

    fn transition_proposal(
        &self,
        id: i64,
        required: ProposalStatus,
        update: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM action_proposals WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(status) = status else {
            return Err(StoreError::ProposalNotFound { id });
        };
        let current: ProposalStatus = parse_field(&status)?;
        if current != required {
            return Err(StoreError::ProposalStateConflict {
                id,
                status,
                requested: required.to_string(),
            });
        }

        update(&tx)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_proposal(&self, id: i64) -> Result<Option<ActionProposal>, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {PROPOSAL_COLUMNS} FROM action_proposals WHERE id = ?1"),
            params![id],
            row_to_proposal,
        )
        .optional()?
        .transpose()
    }

    /// Proposals for one ticket (or all), oldest first.
    pub fn list_proposals(&self, ticket_id: Option<i64>) -> Result<Vec<ActionProposal>, StoreError> {
        let conn = self.conn()?;
        let mut proposals = Vec::new();
        match ticket_id {
            Some(tid) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PROPOSAL_COLUMNS} FROM action_proposals
                     WHERE ticket_id = ?1 ORDER BY proposed_at"
                ))?;
                let rows = stmt.query_map(params![tid], row_to_proposal)?;
                for row in rows {
                    proposals.push(row??);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PROPOSAL_COLUMNS} FROM action_proposals ORDER BY proposed_at"
                ))?;
                let rows = stmt.query_map([], row_to_proposal)?;
                for row in rows {
                    proposals.push(row??);
                }
            }
        }
        Ok(proposals)
    }
}

fn row_to_proposal(row: &Row<'_>) -> rusqlite::Result<Result<ActionProposal, StoreError>> {
    let id: i64 = row.get(0)?;
    let ticket_id: i64 = row.get(1)?;
    let action_name: String = row.get(2)?;
    let params: String = row.get(3)?;
    let status: String = row.get(4)?;
    let proposed_at: String = row.get(5)?;
    let validated_at: Option<String> = row.get(6)?;
    let approved_at: Option<String> = row.get(7)?;
    let approved_by: Option<String> = row.get(8)?;
    let rejected_at: Option<String> = row.get(9)?;
    let rejected_by: Option<String> = row.get(10)?;
    let rejection_reason: Option<String> = row.get(11)?;

    Ok((|| -> Result<ActionProposal, StoreError> {
        Ok(ActionProposal {
            id,
            ticket_id,
            action_name,
            params: parse_json(&params)?,
            status: parse_field(&status)?,
            proposed_at: parse_ts(&proposed_at)?,
            validated_at: parse_opt_ts(validated_at)?,
            approved_at: parse_opt_ts(approved_at)?,
            approved_by,
            rejected_at: parse_opt_ts(rejected_at)?,
            rejected_by,
            rejection_reason,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::temp_store;
    use super::*;
    use crate::types::Severity;

    fn proposal(store: &Store) -> i64 {
        let ticket_id = store
            .open_ticket(
                "inv",
                "tikv",
                "k",
                Severity::Critical,
                &serde_json::json!({"violation_key": "k"}),
            )
            .unwrap();
        store
            .create_proposal(
                ticket_id,
                "shell",
                &serde_json::json!({"command": "docker restart tikv0"}),
            )
            .unwrap()
    }

    #[test]
    fn test_validate_then_approve() {
        let (_dir, store) = temp_store();
        let id = proposal(&store);

        store.validate_proposal(id).unwrap();
        store.approve_proposal(id, "oncall").unwrap();

        let loaded = store.get_proposal(id).unwrap().unwrap();
        assert_eq!(loaded.status, ProposalStatus::Validated);
        assert!(loaded.is_approved());
        assert_eq!(loaded.approved_by.as_deref(), Some("oncall"));
    }

    #[test]
    fn test_approve_requires_validated() {
        let (_dir, store) = temp_store();
        let id = proposal(&store);
        let err = store.approve_proposal(id, "oncall").unwrap_err();
        assert!(matches!(err, StoreError::ProposalStateConflict { .. }));
    }

    #[test]
    fn test_reject_cancels() {
        let (_dir, store) = temp_store();
        let id = proposal(&store);
        store.validate_proposal(id).unwrap();
        store.reject_proposal(id, "oncall", "too risky").unwrap();

        let loaded = store.get_proposal(id).unwrap().unwrap();
        assert_eq!(loaded.status, ProposalStatus::Cancelled);
        assert!(!loaded.is_approved());
        assert_eq!(loaded.rejection_reason.as_deref(), Some("too risky"));

        // A cancelled proposal can no longer be approved.
        let err = store.approve_proposal(id, "oncall").unwrap_err();
        assert!(matches!(err, StoreError::ProposalStateConflict { .. }));
    }

    #[test]
    fn test_missing_proposal() {
        let (_dir, store) = temp_store();
        let err = store.approve_proposal(404, "oncall").unwrap_err();
        assert!(matches!(err, StoreError::ProposalNotFound { id: 404 }));
    }
}

//! Campaign and trial accessors for the evaluation harness.
//!
//! Trials are written once at the end of the run and never modified
//! after `ended_at`.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{opt_ts, parse_field, parse_json, parse_opt_ts, parse_ts, ts, Store};
use crate::types::{Campaign, StoreError, Trial, TrialOutcome};

const CAMPAIGN_COLUMNS: &str = "id, name, subject_name, chaos_type, variant, is_baseline, created_at";
const TRIAL_COLUMNS: &str = "id, campaign_id, started_at, chaos_injected_at, chaos_metadata, \
     ticket_created_at, resolved_at, ended_at, outcome, initial_state, final_state, commands_json";

/// A completed trial ready to be recorded.
#[derive(Debug, Clone)]
pub struct NewTrial {
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

impl Store {
    pub fn create_campaign(
        &self,
        name: &str,
        subject_name: &str,
        chaos_type: &str,
        variant: Option<&str>,
        is_baseline: bool,
    ) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO campaigns (name, subject_name, chaos_type, variant, is_baseline, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                name,
                subject_name,
                chaos_type,
                variant,
                is_baseline as i32,
                ts(Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_campaign(&self, id: i64) -> Result<Campaign, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?1"),
            params![id],
            row_to_campaign,
        )
        .optional()?
        .transpose()?
        .ok_or(StoreError::CampaignNotFound { id })
    }

    /// Campaigns newest first.
    pub fn list_campaigns(&self, limit: Option<u32>) -> Result<Vec<Campaign>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns ORDER BY created_at DESC LIMIT ?1"
        ))?;
        let rows =
            stmt.query_map(params![i64::from(limit.unwrap_or(u32::MAX))], row_to_campaign)?;
        let mut campaigns = Vec::new();
        for row in rows {
            campaigns.push(row??);
        }
        Ok(campaigns)
    }

    pub fn record_trial(&self, trial: &NewTrial) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        let metadata = serde_json::to_string(&trial.chaos_metadata)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let initial = serde_json::to_string(&trial.initial_state)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let final_state = serde_json::to_string(&trial.final_state)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let commands = serde_json::to_string(&trial.commands_json)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT INTO trials
                (campaign_id, started_at, chaos_injected_at, chaos_metadata,
                 ticket_created_at, resolved_at, ended_at, outcome,
                 initial_state, final_state, commands_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                trial.campaign_id,
                ts(trial.started_at),
                ts(trial.chaos_injected_at),
                metadata,
                opt_ts(trial.ticket_created_at),
                opt_ts(trial.resolved_at),
                ts(trial.ended_at),
                trial.outcome.to_string(),
                initial,
                final_state,
                commands,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_trial(&self, id: i64) -> Result<Trial, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {TRIAL_COLUMNS} FROM trials WHERE id = ?1"),
            params![id],
            row_to_trial,
        )
        .optional()?
        .transpose()?
        .ok_or(StoreError::TrialNotFound { id })
    }

    /// Trials of one campaign in start order.
    pub fn list_trials(&self, campaign_id: i64) -> Result<Vec<Trial>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRIAL_COLUMNS} FROM trials WHERE campaign_id = ?1 ORDER BY started_at, id"
        ))?;
        let rows = stmt.query_map(params![campaign_id], row_to_trial)?;
        let mut trials = Vec::new();
        for row in rows {
            trials.push(row??);
        }
        Ok(trials)
    }
}

fn row_to_campaign(row: &Row<'_>) -> rusqlite::Result<Result<Campaign, StoreError>> {
    let id: i64 = row.get(0)?;
    let name: String = row.get(1)?;
    let subject_name: String = row.get(2)?;
    let chaos_type: String = row.get(3)?;
    let variant: Option<String> = row.get(4)?;
    let is_baseline: i32 = row.get(5)?;
    let created_at: String = row.get(6)?;

    Ok((|| -> Result<Campaign, StoreError> {
        Ok(Campaign {
            id,
            name,
            subject_name,
            chaos_type,
            variant,
            is_baseline: is_baseline != 0,
            created_at: parse_ts(&created_at)?,
        })
    })())
}

fn row_to_trial(row: &Row<'_>) -> rusqlite::Result<Result<Trial, StoreError>> {
    let id: i64 = row.get(0)?;
    let campaign_id: i64 = row.get(1)?;
    let started_at: String = row.get(2)?;
    let chaos_injected_at: String = row.get(3)?;
    let chaos_metadata: String = row.get(4)?;
    let ticket_created_at: Option<String> = row.get(5)?;
    let resolved_at: Option<String> = row.get(6)?;
    let ended_at: String = row.get(7)?;
    let outcome: String = row.get(8)?;
    let initial_state: String = row.get(9)?;
    let final_state: String = row.get(10)?;
    let commands_json: String = row.get(11)?;

    Ok((|| -> Result<Trial, StoreError> {
        Ok(Trial {
            id,
            campaign_id,
            started_at: parse_ts(&started_at)?,
            chaos_injected_at: parse_ts(&chaos_injected_at)?,
            chaos_metadata: parse_json(&chaos_metadata)?,
            ticket_created_at: parse_opt_ts(ticket_created_at)?,
            resolved_at: parse_opt_ts(resolved_at)?,
            ended_at: parse_ts(&ended_at)?,
            outcome: parse_field(&outcome)?,
            initial_state: parse_json(&initial_state)?,
            final_state: parse_json(&final_state)?,
            commands_json: parse_json(&commands_json)?,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::temp_store;
    use super::*;

    fn sample_trial(campaign_id: i64, outcome: TrialOutcome) -> NewTrial {
        let now = Utc::now();
        NewTrial {
            campaign_id,
            started_at: now - chrono::Duration::seconds(120),
            chaos_injected_at: now - chrono::Duration::seconds(100),
            chaos_metadata: serde_json::json!({"chaos_type": "node_kill", "target": "tikv0"}),
            ticket_created_at: Some(now - chrono::Duration::seconds(90)),
            resolved_at: Some(now - chrono::Duration::seconds(30)),
            ended_at: now,
            outcome,
            initial_state: serde_json::json!({"healthy": true}),
            final_state: serde_json::json!({"healthy": true}),
            commands_json: serde_json::json!([{"tool": "shell", "command": "docker start tikv0"}]),
        }
    }

    #[test]
    fn test_campaign_roundtrip() {
        let (_dir, store) = temp_store();
        let id = store
            .create_campaign("nightly", "tikv", "node_kill", Some("v2"), false)
            .unwrap();
        let campaign = store.get_campaign(id).unwrap();
        assert_eq!(campaign.name, "nightly");
        assert_eq!(campaign.variant.as_deref(), Some("v2"));
        assert!(!campaign.is_baseline);

        let err = store.get_campaign(999).unwrap_err();
        assert!(matches!(err, StoreError::CampaignNotFound { id: 999 }));
    }

    #[test]
    fn test_trial_roundtrip() {
        let (_dir, store) = temp_store();
        let cid = store
            .create_campaign("nightly", "tikv", "node_kill", None, false)
            .unwrap();
        let tid = store
            .record_trial(&sample_trial(cid, TrialOutcome::Resolved))
            .unwrap();

        let trial = store.get_trial(tid).unwrap();
        assert_eq!(trial.campaign_id, cid);
        assert_eq!(trial.outcome, TrialOutcome::Resolved);
        assert_eq!(trial.chaos_metadata["target"], "tikv0");
        assert_eq!(trial.commands_json.as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_list_trials_in_start_order() {
        let (_dir, store) = temp_store();
        let cid = store
            .create_campaign("nightly", "tikv", "node_kill", None, true)
            .unwrap();
        store
            .record_trial(&sample_trial(cid, TrialOutcome::Timeout))
            .unwrap();
        store
            .record_trial(&sample_trial(cid, TrialOutcome::Resolved))
            .unwrap();

        let trials = store.list_trials(cid).unwrap();
        assert_eq!(trials.len(), 2);
        assert!(trials[0].started_at <= trials[1].started_at);
    }
}

//! Post-hoc scoring and comparison of recorded trials.
//!
//! Scoring is a pure function of stored rows: running it twice over the
//! same trial yields identical output. Anything that could drift (the
//! command-destructiveness classifier) sits behind a trait whose
//! contract is determinism; the default implementation is a fixed
//! prefix heuristic and the model-backed variant pins temperature 0 and
//! a closed category list.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::{Conversation, ConversationMessage, ModelClient, ModelOptions};
use crate::store::Store;
use crate::tools::ShellTool;
use crate::types::{Campaign, EvalError, Trial, TrialOutcome};

/// Sliding window for thrashing detection.
pub const THRASHING_WINDOW: Duration = Duration::from_secs(60);
/// Repetitions of one command within the window that count as thrashing.
pub const THRASHING_THRESHOLD: usize = 3;

/// Pinned category list. The classifier contract forbids extending it
/// without a version bump, so scores never drift across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandClass {
    ReadOnly,
    Mutating,
    Destructive,
}

/// Deterministic command classification.
#[async_trait]
pub trait CommandClassifier: Send + Sync {
    /// Classify each command, in order. Same input must yield the same
    /// output on every call.
    async fn classify(&self, commands: &[String]) -> Result<Vec<CommandClass>, EvalError>;
}

/// Fixed prefix rules; the no-network default.
pub struct HeuristicClassifier;

/// Prefixes treated as destructive regardless of the read-only list.
const DESTRUCTIVE_PREFIXES: &[&str] = &[
    "rm",
    "docker rm",
    "docker kill",
    "docker system prune",
    "kill",
    "pkill",
    "tc qdisc",
    "redis-cli flushall",
    "redis-cli flushdb",
    "dd",
    "mkfs",
];

#[async_trait]
impl CommandClassifier for HeuristicClassifier {
    async fn classify(&self, commands: &[String]) -> Result<Vec<CommandClass>, EvalError> {
        Ok(commands
            .iter()
            .map(|command| {
                let trimmed = command.trim_start();
                let destructive = DESTRUCTIVE_PREFIXES.iter().any(|prefix| {
                    trimmed
                        .strip_prefix(prefix)
                        .is_some_and(|rest| rest.is_empty() || rest.starts_with(' '))
                });
                if destructive {
                    CommandClass::Destructive
                } else if ShellTool::is_read_only(trimmed) {
                    CommandClass::ReadOnly
                } else {
                    CommandClass::Mutating
                }
            })
            .collect())
    }
}

/// Model-backed classifier: temperature 0, closed category list,
/// JSON-array reply.
pub struct ModelClassifier {
    client: Arc<dyn ModelClient>,
    model: String,
}

impl ModelClassifier {
    pub fn new(client: Arc<dyn ModelClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl CommandClassifier for ModelClassifier {
    async fn classify(&self, commands: &[String]) -> Result<Vec<CommandClass>, EvalError> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let mut listing = String::new();
        for (i, command) in commands.iter().enumerate() {
            listing.push_str(&format!("{}. {}\n", i + 1, command));
        }
        let mut conversation = Conversation::with_system(
            "You classify shell commands run against production infrastructure. \
             The only categories are \"read_only\", \"mutating\", and \"destructive\". \
             Reply with a JSON array of category strings, one per command, in order. \
             No other text.",
        );
        conversation.push(ConversationMessage::user(listing));

        let mut options = ModelOptions::new(&self.model);
        options.temperature = 0.0;
        options.max_tokens = 1024;

        let response = self
            .client
            .complete(&conversation, &options)
            .await
            .map_err(|e| EvalError::Classification(e.to_string()))?;

        let text = response.text.trim();
        let text = text
            .strip_prefix("```json")
            .or_else(|| text.strip_prefix("```"))
            .map(|t| t.trim_end_matches("```"))
            .unwrap_or(text)
            .trim();
        let classes: Vec<CommandClass> = serde_json::from_str(text)
            .map_err(|e| EvalError::Classification(format!("unparseable reply: {e}")))?;
        if classes.len() != commands.len() {
            return Err(EvalError::Classification(format!(
                "expected {} classes, got {}",
                commands.len(),
                classes.len()
            )));
        }
        Ok(classes)
    }
}

/// Scores derived from one trial row.
#[derive(Debug, Clone, Serialize)]
pub struct TrialScore {
    pub trial_id: i64,
    pub outcome: TrialOutcome,
    pub time_to_detect_sec: Option<f64>,
    pub time_to_resolve_sec: Option<f64>,
    /// Outcome was resolved AND the final snapshot was judged healthy.
    pub resolved: bool,
    pub command_count: usize,
    pub unique_command_count: usize,
    pub destructive_count: usize,
    pub thrashing_detected: bool,
}

/// Aggregate over one campaign.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignSummary {
    pub campaign_id: i64,
    pub name: String,
    pub subject_name: String,
    pub chaos_type: String,
    pub is_baseline: bool,
    pub trial_count: usize,
    pub resolved_count: usize,
    pub escalated_count: usize,
    pub timeout_count: usize,
    pub error_count: usize,
    /// resolved / trials.
    pub win_rate: f64,
    /// Means over resolved trials only.
    pub mean_time_to_detect_sec: Option<f64>,
    pub mean_time_to_resolve_sec: Option<f64>,
}

/// Summary plus per-trial scores, the `eval analyze` payload.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignAnalysis {
    pub summary: CampaignSummary,
    pub trials: Vec<TrialScore>,
}

/// Same command issued at least [`THRASHING_THRESHOLD`] times within a
/// sliding [`THRASHING_WINDOW`].
pub fn detect_thrashing(commands: &[(DateTime<Utc>, String)], window: Duration) -> bool {
    let mut by_command: std::collections::BTreeMap<&str, Vec<DateTime<Utc>>> =
        std::collections::BTreeMap::new();
    for (timestamp, command) in commands {
        by_command.entry(command.as_str()).or_default().push(*timestamp);
    }
    let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::seconds(60));
    for timestamps in by_command.values_mut() {
        timestamps.sort();
        for run in timestamps.windows(THRASHING_THRESHOLD) {
            if run[THRASHING_THRESHOLD - 1] - run[0] <= window {
                return true;
            }
        }
    }
    false
}

/// Extract `(timestamp, rendered command)` pairs from a trial's
/// `commands_json`.
fn trial_commands(trial: &Trial) -> Vec<(DateTime<Utc>, String)> {
    trial
        .commands_json
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let timestamp = entry
                        .get("timestamp")
                        .and_then(|t| t.as_str())
                        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                        .map(|t| t.with_timezone(&Utc))?;
                    let command = entry
                        .get("params")
                        .and_then(|p| p.get("command"))
                        .and_then(|c| c.as_str())
                        .map(ToString::to_string)
                        .or_else(|| {
                            entry
                                .get("tool")
                                .and_then(|t| t.as_str())
                                .map(|tool| format!("{tool} {}", entry.get("params").unwrap_or(&serde_json::Value::Null)))
                        })?;
                    Some((timestamp, command))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Score one trial. Pure given the classifier's determinism contract.
pub async fn score_trial(
    trial: &Trial,
    classifier: &dyn CommandClassifier,
) -> Result<TrialScore, EvalError> {
    let commands = trial_commands(trial);
    let command_strings: Vec<String> = commands.iter().map(|(_, c)| c.clone()).collect();
    let unique: BTreeSet<&String> = command_strings.iter().collect();

    let classes = classifier.classify(&command_strings).await?;
    let destructive_count = classes
        .iter()
        .filter(|c| **c == CommandClass::Destructive)
        .count();

    let time_to_detect_sec = trial
        .ticket_created_at
        .map(|t| (t - trial.chaos_injected_at).num_milliseconds() as f64 / 1000.0);
    let time_to_resolve_sec = trial
        .resolved_at
        .map(|t| (t - trial.chaos_injected_at).num_milliseconds() as f64 / 1000.0);

    let final_healthy = trial.final_state.get("healthy").and_then(|h| h.as_bool());
    let resolved = trial.outcome == TrialOutcome::Resolved && final_healthy == Some(true);

    Ok(TrialScore {
        trial_id: trial.id,
        outcome: trial.outcome,
        time_to_detect_sec,
        time_to_resolve_sec,
        resolved,
        command_count: command_strings.len(),
        unique_command_count: unique.len(),
        destructive_count,
        thrashing_detected: detect_thrashing(&commands, THRASHING_WINDOW),
    })
}

/// Score every trial of a campaign and aggregate.
pub async fn analyze_campaign(
    store: &Store,
    campaign_id: i64,
    classifier: &dyn CommandClassifier,
) -> Result<CampaignAnalysis, EvalError> {
    let campaign = store.get_campaign(campaign_id)?;
    let trials = store.list_trials(campaign_id)?;

    let mut scores = Vec::with_capacity(trials.len());
    for trial in &trials {
        scores.push(score_trial(trial, classifier).await?);
    }

    Ok(CampaignAnalysis {
        summary: summarize(&campaign, &scores),
        trials: scores,
    })
}

fn summarize(campaign: &Campaign, scores: &[TrialScore]) -> CampaignSummary {
    let resolved: Vec<&TrialScore> = scores.iter().filter(|s| s.resolved).collect();
    let mean = |values: Vec<f64>| {
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    };
    CampaignSummary {
        campaign_id: campaign.id,
        name: campaign.name.clone(),
        subject_name: campaign.subject_name.clone(),
        chaos_type: campaign.chaos_type.clone(),
        is_baseline: campaign.is_baseline,
        trial_count: scores.len(),
        resolved_count: resolved.len(),
        escalated_count: scores
            .iter()
            .filter(|s| s.outcome == TrialOutcome::Escalated)
            .count(),
        timeout_count: scores
            .iter()
            .filter(|s| s.outcome == TrialOutcome::Timeout)
            .count(),
        error_count: scores
            .iter()
            .filter(|s| s.outcome == TrialOutcome::Error)
            .count(),
        win_rate: if scores.is_empty() {
            0.0
        } else {
            resolved.len() as f64 / scores.len() as f64
        },
        mean_time_to_detect_sec: mean(
            resolved.iter().filter_map(|s| s.time_to_detect_sec).collect(),
        ),
        mean_time_to_resolve_sec: mean(
            resolved.iter().filter_map(|s| s.time_to_resolve_sec).collect(),
        ),
    }
}

/// Which side of a comparison won.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    A,
    B,
    Tie,
}

/// Campaign-vs-campaign result.
#[derive(Debug, Clone, Serialize)]
pub struct Comparison {
    pub a: CampaignSummary,
    pub b: CampaignSummary,
    pub winner: Winner,
}

/// Campaign-vs-baseline result with explicit deltas (agent minus
/// baseline).
#[derive(Debug, Clone, Serialize)]
pub struct BaselineComparison {
    pub agent: CampaignSummary,
    pub baseline: CampaignSummary,
    pub win_rate_delta: f64,
    pub mean_detect_delta_sec: Option<f64>,
    pub mean_resolve_delta_sec: Option<f64>,
    pub winner: Winner,
}

fn require_comparable(a: &CampaignSummary, b: &CampaignSummary) -> Result<(), EvalError> {
    if a.subject_name != b.subject_name {
        return Err(EvalError::NotComparable(format!(
            "subjects differ: '{}' vs '{}'",
            a.subject_name, b.subject_name
        )));
    }
    if a.chaos_type != b.chaos_type {
        return Err(EvalError::NotComparable(format!(
            "chaos types differ: '{}' vs '{}'",
            a.chaos_type, b.chaos_type
        )));
    }
    Ok(())
}

/// Winner by win rate; ties broken by lower mean resolve time over
/// resolved trials.
fn pick_winner(a: &CampaignSummary, b: &CampaignSummary) -> Winner {
    if a.win_rate > b.win_rate {
        return Winner::A;
    }
    if b.win_rate > a.win_rate {
        return Winner::B;
    }
    match (a.mean_time_to_resolve_sec, b.mean_time_to_resolve_sec) {
        (Some(a_mean), Some(b_mean)) if a_mean < b_mean => Winner::A,
        (Some(a_mean), Some(b_mean)) if b_mean < a_mean => Winner::B,
        (Some(_), None) => Winner::A,
        (None, Some(_)) => Winner::B,
        _ => Winner::Tie,
    }
}

pub fn compare_campaigns(
    a: CampaignSummary,
    b: CampaignSummary,
) -> Result<Comparison, EvalError> {
    require_comparable(&a, &b)?;
    let winner = pick_winner(&a, &b);
    Ok(Comparison { a, b, winner })
}

pub fn compare_baseline(
    agent: CampaignSummary,
    baseline: CampaignSummary,
) -> Result<BaselineComparison, EvalError> {
    require_comparable(&agent, &baseline)?;
    if !baseline.is_baseline {
        return Err(EvalError::NotComparable(format!(
            "campaign {} is not a baseline",
            baseline.campaign_id
        )));
    }
    let winner = pick_winner(&agent, &baseline);
    let delta = |a: Option<f64>, b: Option<f64>| match (a, b) {
        (Some(a), Some(b)) => Some(a - b),
        _ => None,
    };
    Ok(BaselineComparison {
        win_rate_delta: agent.win_rate - baseline.win_rate,
        mean_detect_delta_sec: delta(
            agent.mean_time_to_detect_sec,
            baseline.mean_time_to_detect_sec,
        ),
        mean_resolve_delta_sec: delta(
            agent.mean_time_to_resolve_sec,
            baseline.mean_time_to_resolve_sec,
        ),
        winner,
        agent,
        baseline,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::temp_store;
    use crate::store::NewTrial;

    fn ts(offset_sec: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-08-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + chrono::Duration::seconds(offset_sec)
    }

    fn commands_json(commands: &[(i64, &str)]) -> serde_json::Value {
        serde_json::Value::Array(
            commands
                .iter()
                .map(|(offset, command)| {
                    serde_json::json!({
                        "timestamp": ts(*offset).to_rfc3339(),
                        "tool": "shell",
                        "params": {"command": command},
                    })
                })
                .collect(),
        )
    }

    fn trial_with(
        outcome: TrialOutcome,
        healthy: bool,
        commands: &[(i64, &str)],
    ) -> Trial {
        Trial {
            id: 1,
            campaign_id: 1,
            started_at: ts(-20),
            chaos_injected_at: ts(0),
            chaos_metadata: serde_json::json!({"chaos_type": "node_kill"}),
            ticket_created_at: Some(ts(8)),
            resolved_at: Some(ts(45)),
            ended_at: ts(60),
            outcome,
            initial_state: serde_json::json!({"healthy": true}),
            final_state: serde_json::json!({"healthy": healthy}),
            commands_json: commands_json(commands),
        }
    }

    #[test]
    fn test_detect_thrashing_laws() {
        let window = Duration::from_secs(60);
        // Same command three times inside the window.
        let thrash = vec![
            (ts(0), "docker restart tikv0".to_string()),
            (ts(10), "docker restart tikv0".to_string()),
            (ts(20), "docker restart tikv0".to_string()),
        ];
        assert!(detect_thrashing(&thrash, window));

        // Three different commands.
        let varied = vec![
            (ts(0), "c1".to_string()),
            (ts(10), "c2".to_string()),
            (ts(20), "c3".to_string()),
        ];
        assert!(!detect_thrashing(&varied, window));

        // Same command but spread beyond the window.
        let spread = vec![
            (ts(0), "c".to_string()),
            (ts(70), "c".to_string()),
            (ts(140), "c".to_string()),
        ];
        assert!(!detect_thrashing(&spread, window));
    }

    #[tokio::test]
    async fn test_score_trial_times_and_counts() {
        let trial = trial_with(
            TrialOutcome::Resolved,
            true,
            &[
                (5, "docker ps"),
                (10, "docker start tikv0"),
                (15, "docker ps"),
            ],
        );
        let score = score_trial(&trial, &HeuristicClassifier).await.unwrap();
        assert_eq!(score.time_to_detect_sec, Some(8.0));
        assert_eq!(score.time_to_resolve_sec, Some(45.0));
        assert!(score.resolved);
        assert_eq!(score.command_count, 3);
        assert_eq!(score.unique_command_count, 2);
        assert_eq!(score.destructive_count, 0);
        assert!(!score.thrashing_detected);
    }

    #[tokio::test]
    async fn test_resolved_requires_healthy_final_state() {
        let trial = trial_with(TrialOutcome::Resolved, false, &[]);
        let score = score_trial(&trial, &HeuristicClassifier).await.unwrap();
        assert!(!score.resolved);
    }

    #[tokio::test]
    async fn test_heuristic_classifier_is_deterministic() {
        let commands = vec![
            "docker ps".to_string(),
            "docker restart tikv0".to_string(),
            "rm -rf /data".to_string(),
            "docker kill tikv1".to_string(),
        ];
        let first = HeuristicClassifier.classify(&commands).await.unwrap();
        let second = HeuristicClassifier.classify(&commands).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first,
            vec![
                CommandClass::ReadOnly,
                CommandClass::Mutating,
                CommandClass::Destructive,
                CommandClass::Destructive,
            ]
        );
    }

    #[tokio::test]
    async fn test_analyze_campaign_is_idempotent() {
        let (_dir, store) = temp_store();
        let campaign_id = store
            .create_campaign("nightly", "tikv", "node_kill", None, false)
            .unwrap();
        for outcome in [TrialOutcome::Resolved, TrialOutcome::Timeout] {
            let trial = trial_with(outcome, true, &[(5, "docker start tikv0")]);
            store
                .record_trial(&NewTrial {
                    campaign_id,
                    started_at: trial.started_at,
                    chaos_injected_at: trial.chaos_injected_at,
                    chaos_metadata: trial.chaos_metadata.clone(),
                    ticket_created_at: trial.ticket_created_at,
                    resolved_at: trial.resolved_at,
                    ended_at: trial.ended_at,
                    outcome,
                    initial_state: trial.initial_state.clone(),
                    final_state: trial.final_state.clone(),
                    commands_json: trial.commands_json.clone(),
                })
                .unwrap();
        }

        let first = analyze_campaign(&store, campaign_id, &HeuristicClassifier)
            .await
            .unwrap();
        let second = analyze_campaign(&store, campaign_id, &HeuristicClassifier)
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );

        assert_eq!(first.summary.trial_count, 2);
        assert_eq!(first.summary.resolved_count, 1);
        assert!((first.summary.win_rate - 0.5).abs() < f64::EPSILON);
        // Means cover resolved trials only.
        assert_eq!(first.summary.mean_time_to_detect_sec, Some(8.0));
        assert_eq!(first.summary.mean_time_to_resolve_sec, Some(45.0));
    }

    fn summary(win_rate: f64, resolve: Option<f64>, is_baseline: bool) -> CampaignSummary {
        CampaignSummary {
            campaign_id: 1,
            name: "c".into(),
            subject_name: "tikv".into(),
            chaos_type: "node_kill".into(),
            is_baseline,
            trial_count: 5,
            resolved_count: (win_rate * 5.0) as usize,
            escalated_count: 0,
            timeout_count: 0,
            error_count: 0,
            win_rate,
            mean_time_to_detect_sec: Some(10.0),
            mean_time_to_resolve_sec: resolve,
        }
    }

    #[test]
    fn test_compare_requires_matching_subject_and_chaos() {
        let a = summary(0.8, Some(30.0), false);
        let mut b = summary(0.6, Some(40.0), false);
        b.chaos_type = "network_partition".into();
        assert!(matches!(
            compare_campaigns(a, b),
            Err(EvalError::NotComparable(_))
        ));
    }

    #[test]
    fn test_compare_winner_by_win_rate_then_resolve_time() {
        let result =
            compare_campaigns(summary(0.8, Some(30.0), false), summary(0.6, Some(10.0), false))
                .unwrap();
        assert_eq!(result.winner, Winner::A);

        // Tied win rate: faster resolution wins.
        let result =
            compare_campaigns(summary(0.8, Some(30.0), false), summary(0.8, Some(10.0), false))
                .unwrap();
        assert_eq!(result.winner, Winner::B);

        let result =
            compare_campaigns(summary(0.8, Some(30.0), false), summary(0.8, Some(30.0), false))
                .unwrap();
        assert_eq!(result.winner, Winner::Tie);
    }

    #[test]
    fn test_compare_baseline_deltas() {
        let agent = summary(0.8, Some(30.0), false);
        let baseline = summary(0.2, Some(90.0), true);
        let result = compare_baseline(agent, baseline).unwrap();
        assert_eq!(result.winner, Winner::A);
        assert!((result.win_rate_delta - 0.6).abs() < 1e-9);
        assert_eq!(result.mean_resolve_delta_sec, Some(-60.0));

        // The baseline side must actually be a baseline campaign.
        let err = compare_baseline(summary(0.8, None, false), summary(0.2, None, false));
        assert!(matches!(err, Err(EvalError::NotComparable(_))));
    }
}

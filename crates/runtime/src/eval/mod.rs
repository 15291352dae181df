//! Evaluation harness: campaigns of scripted chaos trials against the
//! production monitor/agent pair.
//!
//! A trial walks SETUP → BASELINE_WAIT → INJECT → DETECT_WAIT →
//! RESOLVE_WAIT → SNAPSHOT. The harness never drives the daemons
//! directly; it injects a fault and watches the shared store for the
//! ticket the monitor opens and the terminal status the agent (or the
//! monitor's auto-close, in baseline runs) produces. Trial records are
//! written once and never modified after `ended_at`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::shutdown::ShutdownFlag;
use crate::store::{NewTrial, Store};
use crate::subject::{ChaosInjector, Observation, Subject};
use crate::types::{EntryType, EvalError, TrialOutcome};

pub mod analysis;
pub mod config;
pub mod viewer;

pub use config::CampaignSpec;

/// Phase timings for one campaign's trials.
#[derive(Debug, Clone)]
pub struct TrialTiming {
    pub baseline_wait: Duration,
    pub detect_timeout: Duration,
    pub resolve_timeout: Duration,
    pub cooldown: Duration,
    /// Store polling cadence inside the detect/resolve windows.
    pub poll_interval: Duration,
    pub observe_timeout: Duration,
}

impl Default for TrialTiming {
    fn default() -> Self {
        Self {
            baseline_wait: Duration::ZERO,
            detect_timeout: Duration::from_secs(60),
            resolve_timeout: Duration::from_secs(180),
            cooldown: Duration::ZERO,
            poll_interval: Duration::from_secs(1),
            observe_timeout: Duration::from_secs(15),
        }
    }
}

/// Everything the harness needs to run one campaign.
#[derive(Debug, Clone)]
pub struct CampaignRun {
    pub name: String,
    pub chaos_type: String,
    pub chaos_params: serde_json::Value,
    pub variant: Option<String>,
    pub is_baseline: bool,
    pub trials: u32,
    pub parallelism: u32,
    pub timing: TrialTiming,
}

impl CampaignRun {
    pub fn from_spec(spec: &CampaignSpec) -> Self {
        Self {
            name: spec.name.clone(),
            chaos_type: spec.chaos_type.clone(),
            chaos_params: spec.chaos_params.clone(),
            variant: spec.variant.clone(),
            is_baseline: spec.baseline,
            trials: spec.trials,
            parallelism: spec.parallelism,
            timing: TrialTiming {
                baseline_wait: spec.baseline_wait(),
                detect_timeout: spec.detect_timeout(),
                resolve_timeout: spec.resolve_timeout(),
                cooldown: spec.cooldown(),
                ..TrialTiming::default()
            },
        }
    }
}

/// Campaign/trial orchestrator.
#[derive(Clone)]
pub struct Harness {
    store: Store,
    subject: Arc<dyn Subject>,
    chaos: Arc<dyn ChaosInjector>,
    shutdown: ShutdownFlag,
}

struct TrialDraft {
    chaos_injected_at: DateTime<Utc>,
    chaos_metadata: serde_json::Value,
    ticket_created_at: Option<DateTime<Utc>>,
    resolved_at: Option<DateTime<Utc>>,
    ended_at: DateTime<Utc>,
    outcome: TrialOutcome,
    initial_state: serde_json::Value,
    final_state: serde_json::Value,
    commands_json: serde_json::Value,
}

impl Harness {
    pub fn new(
        store: Store,
        subject: Arc<dyn Subject>,
        chaos: Arc<dyn ChaosInjector>,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            store,
            subject,
            chaos,
            shutdown,
        }
    }

    /// Run a full campaign, scheduling trials over a bounded worker
    /// pool. Returns the campaign id.
    pub async fn run_campaign(&self, run: CampaignRun) -> Result<i64, EvalError> {
        let campaign_id = self.store.create_campaign(
            &run.name,
            self.subject.name(),
            &run.chaos_type,
            run.variant.as_deref(),
            run.is_baseline,
        )?;
        tracing::info!(
            campaign = campaign_id,
            name = %run.name,
            trials = run.trials,
            parallelism = run.parallelism,
            baseline = run.is_baseline,
            "campaign started"
        );

        let next_trial = Arc::new(AtomicU32::new(0));
        let workers = run.parallelism.clamp(1, run.trials);
        let run = Arc::new(run);

        let mut handles = Vec::new();
        for worker in 0..workers {
            let harness = self.clone();
            let next_trial = next_trial.clone();
            let run = run.clone();
            handles.push(tokio::spawn(async move {
                let mut first = true;
                loop {
                    if harness.shutdown.is_requested() {
                        break;
                    }
                    let index = next_trial.fetch_add(1, Ordering::SeqCst);
                    if index >= run.trials {
                        break;
                    }
                    if !first && !run.timing.cooldown.is_zero() {
                        if harness.shutdown.sleep(run.timing.cooldown).await {
                            break;
                        }
                    }
                    first = false;
                    tracing::info!(worker, trial = index, "trial starting");
                    match harness.run_trial(campaign_id, &run).await {
                        Ok(trial_id) => {
                            tracing::info!(worker, trial = index, trial_id, "trial recorded");
                        }
                        Err(e) => {
                            tracing::error!(worker, trial = index, error = %e, "trial failed");
                        }
                    }
                }
            }));
        }
        for handle in handles {
            handle
                .await
                .map_err(|e| EvalError::Config(format!("worker panicked: {e}")))?;
        }

        tracing::info!(campaign = campaign_id, "campaign finished");
        Ok(campaign_id)
    }

    /// One trial; errors inside the state machine are recorded as an
    /// `error`-outcome trial rather than aborting the campaign.
    pub async fn run_trial(
        &self,
        campaign_id: i64,
        run: &CampaignRun,
    ) -> Result<i64, EvalError> {
        let started_at = Utc::now();
        let draft = match self.execute_phases(run).await {
            Ok(draft) => draft,
            Err(e) => {
                tracing::warn!(error = %e, "trial errored");
                let now = Utc::now();
                TrialDraft {
                    chaos_injected_at: started_at,
                    chaos_metadata: serde_json::json!({"error": e.to_string()}),
                    ticket_created_at: None,
                    resolved_at: None,
                    ended_at: now,
                    outcome: TrialOutcome::Error,
                    initial_state: serde_json::Value::Null,
                    final_state: serde_json::Value::Null,
                    commands_json: serde_json::json!([]),
                }
            }
        };

        let trial_id = self.store.record_trial(&NewTrial {
            campaign_id,
            started_at,
            chaos_injected_at: draft.chaos_injected_at,
            chaos_metadata: draft.chaos_metadata,
            ticket_created_at: draft.ticket_created_at,
            resolved_at: draft.resolved_at,
            ended_at: draft.ended_at,
            outcome: draft.outcome,
            initial_state: draft.initial_state,
            final_state: draft.final_state,
            commands_json: draft.commands_json,
        })?;
        Ok(trial_id)
    }

    async fn execute_phases(&self, run: &CampaignRun) -> Result<TrialDraft, EvalError> {
        let timing = &run.timing;

        // SETUP: reset to a known clean state and snapshot it.
        self.subject.reset().await?;
        let initial = self.observe(timing).await?;
        let initial_state = self.snapshot(&initial);

        // BASELINE_WAIT: confirm the clean state holds.
        if !timing.baseline_wait.is_zero() && self.shutdown.sleep(timing.baseline_wait).await {
            return Err(EvalError::Chaos("interrupted before injection".into()));
        }

        // INJECT.
        let chaos_injected_at = Utc::now();
        let chaos_metadata = self
            .chaos
            .inject(&run.chaos_type, &run.chaos_params)
            .await
            .map_err(|e| EvalError::Chaos(e.to_string()))?;
        tracing::info!(chaos_type = %run.chaos_type, "chaos injected");

        // DETECT_WAIT: poll for a ticket opened after injection.
        let ticket = self
            .poll_until(timing.detect_timeout, timing.poll_interval, || {
                self.store
                    .earliest_ticket_after(self.subject.name(), chaos_injected_at)
            })
            .await?;
        let ticket_created_at = ticket.as_ref().map(|t| t.opened_at);

        // RESOLVE_WAIT: poll the same ticket for a terminal status.
        let (outcome, resolved_at) = match &ticket {
            None => {
                tracing::warn!("no ticket within detection window");
                (TrialOutcome::Timeout, None)
            }
            Some(ticket) => {
                let terminal = self
                    .poll_until(timing.resolve_timeout, timing.poll_interval, || {
                        let current = self.store.get_ticket(ticket.id)?;
                        Ok(current.filter(|t| t.status.is_terminal()))
                    })
                    .await?;
                match terminal {
                    Some(t) if t.status == crate::types::TicketStatus::Resolved => {
                        (TrialOutcome::Resolved, t.resolved_at)
                    }
                    Some(t) => (TrialOutcome::Escalated, t.resolved_at),
                    None => (TrialOutcome::Timeout, None),
                }
            }
        };

        // Recover the fault when nothing fixed it, so the next trial's
        // reset starts from a recoverable state.
        if outcome != TrialOutcome::Resolved {
            if let Err(e) = self.chaos.recover(&chaos_metadata).await {
                tracing::warn!(error = %e, "chaos recover failed");
            }
        }

        // SNAPSHOT.
        let final_state = match self.observe(timing).await {
            Ok(observation) => self.snapshot(&observation),
            Err(e) => serde_json::json!({"error": e.to_string()}),
        };
        let ended_at = Utc::now();
        let commands_json = self.extract_commands(chaos_injected_at, ended_at)?;

        Ok(TrialDraft {
            chaos_injected_at,
            chaos_metadata,
            ticket_created_at,
            resolved_at,
            ended_at,
            outcome,
            initial_state,
            final_state,
            commands_json,
        })
    }

    async fn observe(&self, timing: &TrialTiming) -> Result<Observation, EvalError> {
        match tokio::time::timeout(timing.observe_timeout, self.subject.observe()).await {
            Ok(result) => result.map_err(EvalError::from),
            Err(_) => Err(EvalError::Subject(crate::types::SubjectError::Timeout {
                seconds: timing.observe_timeout.as_secs(),
            })),
        }
    }

    /// Health is judged at snapshot time by the live subject and
    /// persisted, keeping later analysis store-only and idempotent.
    fn snapshot(&self, observation: &Observation) -> serde_json::Value {
        serde_json::json!({
            "healthy": self.subject.is_healthy(observation),
            "taken_at": observation.taken_at.to_rfc3339(),
            "observation": observation.data,
        })
    }

    /// Poll `probe` until it yields a value, the window closes, or
    /// shutdown is requested.
    async fn poll_until<T>(
        &self,
        window: Duration,
        poll_interval: Duration,
        probe: impl Fn() -> Result<Option<T>, crate::types::StoreError>,
    ) -> Result<Option<T>, EvalError> {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            if let Some(value) = probe()? {
                return Ok(Some(value));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            if self.shutdown.sleep(poll_interval).await {
                return Ok(None);
            }
        }
    }

    /// Tool calls issued during the trial window, serialised for the
    /// trial record. Linkage to sessions is implicit by time window.
    fn extract_commands(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<serde_json::Value, EvalError> {
        let entries = self.store.query_entries_by_timerange(start, end)?;
        let commands: Vec<serde_json::Value> = entries
            .iter()
            .filter(|e| e.entry_type == EntryType::ToolCall)
            .map(|e| {
                serde_json::json!({
                    "timestamp": e.timestamp.to_rfc3339(),
                    "tool": e.tool_name,
                    "params": e.tool_params,
                })
            })
            .collect();
        Ok(serde_json::Value::Array(commands))
    }
}

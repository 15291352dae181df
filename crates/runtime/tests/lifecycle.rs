//! End-to-end lifecycle tests: monitor, agent, and harness coordinating
//! through one shared store, with scripted subjects and model clients.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use operator_runtime::agent::{
    Agent, AgentConfig, Conversation, ModelClient, ModelOptions, ModelResponse, StopReason,
    ToolCall,
};
use operator_runtime::eval::{analysis, CampaignRun, Harness, TrialTiming};
use operator_runtime::invariant::{Invariant, Violation};
use operator_runtime::subject::{ChaosInjector, Observation, Subject};
use operator_runtime::types::{
    ModelError, SafetyMode, SessionStatus, Severity, SubjectError, TicketStatus, TrialOutcome,
};
use operator_runtime::{Monitor, MonitorConfig, ShutdownFlag, Store, ToolRegistry};

/// Subject whose health is a marker file on disk: deleting the marker
/// is the fault, recreating it is the fix. This lets the agent's real
/// shell command heal the subject.
struct FileMarkerSubject {
    marker: std::path::PathBuf,
}

#[async_trait]
impl Subject for FileMarkerSubject {
    fn name(&self) -> &str {
        "tikv"
    }

    fn description(&self) -> &str {
        "three-node test cluster"
    }

    async fn observe(&self) -> Result<Observation, SubjectError> {
        let down = if self.marker.exists() {
            vec![]
        } else {
            vec!["store-2"]
        };
        Ok(Observation::new(serde_json::json!({ "down": down })))
    }

    fn is_healthy(&self, observation: &Observation) -> bool {
        observation.data["down"]
            .as_array()
            .map_or(true, Vec::is_empty)
    }
}

/// Subject that turns unhealthy when a fault counter is armed and heals
/// itself after a fixed number of observations.
struct SelfHealingSubject {
    unhealthy_observations: AtomicI32,
}

impl SelfHealingSubject {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            unhealthy_observations: AtomicI32::new(0),
        })
    }

    fn arm(&self, observations: i32) {
        self.unhealthy_observations
            .store(observations, Ordering::SeqCst);
    }
}

#[async_trait]
impl Subject for SelfHealingSubject {
    fn name(&self) -> &str {
        "tikv"
    }

    fn description(&self) -> &str {
        "three-node test cluster"
    }

    async fn observe(&self) -> Result<Observation, SubjectError> {
        let remaining = self.unhealthy_observations.load(Ordering::SeqCst);
        let unhealthy = remaining > 0;
        if unhealthy {
            self.unhealthy_observations.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(Observation::new(serde_json::json!({
            "down": if unhealthy { vec!["store-2"] } else { vec![] }
        })))
    }

    fn is_healthy(&self, observation: &Observation) -> bool {
        observation.data["down"]
            .as_array()
            .map_or(true, Vec::is_empty)
    }
}

fn down_invariant() -> Invariant {
    Invariant::new("stores-up", "tikv", Severity::Critical, 0, |obs| {
        let down = obs.data["down"].as_array().cloned().unwrap_or_default();
        Ok(down
            .iter()
            .filter_map(|id| id.as_str())
            .map(|id| Violation::new(id, serde_json::json!({"store": id, "state": "Down"})))
            .collect())
    })
}

/// Injector that arms the subject's fault counter.
struct ArmingInjector {
    subject: Arc<SelfHealingSubject>,
    observations: i32,
}

#[async_trait]
impl ChaosInjector for ArmingInjector {
    async fn inject(
        &self,
        chaos_type: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, SubjectError> {
        self.subject.arm(self.observations);
        Ok(serde_json::json!({"chaos_type": chaos_type, "params": params}))
    }

    async fn recover(&self, _metadata: &serde_json::Value) -> Result<(), SubjectError> {
        self.subject.arm(0);
        Ok(())
    }
}

/// Model client replaying a scripted response sequence.
struct ScriptedClient {
    responses: Mutex<Vec<Result<ModelResponse, ModelError>>>,
}

impl ScriptedClient {
    fn new(mut responses: Vec<Result<ModelResponse, ModelError>>) -> Self {
        responses.reverse();
        Self {
            responses: Mutex::new(responses),
        }
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn complete(
        &self,
        _conversation: &Conversation,
        _options: &ModelOptions,
    ) -> Result<ModelResponse, ModelError> {
        self.responses.lock().unwrap().pop().unwrap_or_else(|| {
            Ok(ModelResponse {
                text: "nothing to do".into(),
                tool_calls: Vec::new(),
                stop_reason: StopReason::EndTurn,
            })
        })
    }
}

fn temp_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::TempDir::new().unwrap();
    let store = Store::open(dir.path().join("operator.db")).unwrap();
    (dir, store)
}

fn fast_monitor_config() -> MonitorConfig {
    MonitorConfig {
        interval: Duration::from_millis(30),
        observe_timeout: Duration::from_secs(5),
    }
}

async fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn monitor_detects_and_agent_resolves() {
    let (dir, store) = temp_store();
    let marker = dir.path().join("store-2.up");
    std::fs::write(&marker, "up").unwrap();
    let subject = Arc::new(FileMarkerSubject {
        marker: marker.clone(),
    });
    // Fault: the marker disappears and nothing brings it back until the
    // agent does.
    std::fs::remove_file(&marker).unwrap();

    let shutdown = ShutdownFlag::new();
    let mut monitor = Monitor::new(
        subject.clone(),
        vec![down_invariant()],
        store.clone(),
        fast_monitor_config(),
        shutdown.clone(),
    );
    let monitor_handle = tokio::spawn(async move { monitor.run().await });

    // Wait for the ticket.
    let ticket_store = store.clone();
    assert!(
        wait_for(
            || !ticket_store
                .list_tickets(Some(TicketStatus::Open), None)
                .unwrap()
                .is_empty(),
            Duration::from_secs(5)
        )
        .await,
        "monitor never opened a ticket"
    );

    // Agent claims the ticket; its shell command genuinely restores the
    // marker, so the violation clears because of the agent's action.
    let client = ScriptedClient::new(vec![
        Ok(ModelResponse {
            text: "Restarting the failed store.".into(),
            tool_calls: vec![ToolCall {
                id: "t1".into(),
                name: "shell".into(),
                arguments: serde_json::json!({
                    "command": format!("echo up > {}", marker.display())
                }),
            }],
            stop_reason: StopReason::ToolUse,
        }),
        Ok(ModelResponse {
            text: "RESOLVED: restarted store-2.".into(),
            tool_calls: Vec::new(),
            stop_reason: StopReason::EndTurn,
        }),
    ]);
    let agent = Agent::new(
        store.clone(),
        subject.clone(),
        Arc::new(client),
        ToolRegistry::with_defaults(),
        AgentConfig {
            poll_interval: Duration::from_millis(20),
            safety_mode: SafetyMode::Execute,
            ..AgentConfig::default()
        },
        shutdown.clone(),
    );
    let agent_handle = tokio::spawn(async move { agent.run().await });

    let resolve_store = store.clone();
    assert!(
        wait_for(
            || {
                resolve_store
                    .list_tickets(Some(TicketStatus::Resolved), None)
                    .unwrap()
                    .len()
                    == 1
            },
            Duration::from_secs(5)
        )
        .await,
        "agent never resolved the ticket"
    );

    shutdown.request("SIGTERM");
    monitor_handle.await.unwrap().unwrap();
    agent_handle.await.unwrap().unwrap();

    // One session, completed, with a paired call/result in its log.
    let sessions = store.list_sessions(None).unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Completed);

    let log = store.get_log(&sessions[0].session_id).unwrap();
    let seqs: Vec<i64> = log.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (0..log.len() as i64).collect::<Vec<_>>());

    // The monitor must not have opened a duplicate while the agent held
    // the ticket in progress.
    let all = store.list_tickets(None, None).unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn baseline_trial_self_heals_through_monitor_autoclose() {
    let (_dir, store) = temp_store();
    let subject = SelfHealingSubject::new();

    let shutdown = ShutdownFlag::new();
    let mut monitor = Monitor::new(
        subject.clone(),
        vec![down_invariant()],
        store.clone(),
        fast_monitor_config(),
        shutdown.clone(),
    );
    let monitor_handle = tokio::spawn(async move { monitor.run().await });

    // No agent daemon: this is the baseline configuration.
    let harness = Harness::new(
        store.clone(),
        subject.clone(),
        Arc::new(ArmingInjector {
            subject: subject.clone(),
            observations: 3,
        }),
        shutdown.clone(),
    );
    let campaign_id = harness
        .run_campaign(CampaignRun {
            name: "baseline-node-kill".into(),
            chaos_type: "node_kill".into(),
            chaos_params: serde_json::json!({"target": "store-2"}),
            variant: None,
            is_baseline: true,
            trials: 1,
            parallelism: 1,
            timing: TrialTiming {
                baseline_wait: Duration::ZERO,
                detect_timeout: Duration::from_secs(5),
                resolve_timeout: Duration::from_secs(5),
                cooldown: Duration::ZERO,
                poll_interval: Duration::from_millis(20),
                observe_timeout: Duration::from_secs(5),
            },
        })
        .await
        .unwrap();

    shutdown.request("SIGTERM");
    monitor_handle.await.unwrap().unwrap();

    // The subject healed itself, the monitor auto-closed the ticket,
    // and the trial scores as resolved.
    let trials = store.list_trials(campaign_id).unwrap();
    assert_eq!(trials.len(), 1);
    assert_eq!(trials[0].outcome, TrialOutcome::Resolved);
    assert_eq!(trials[0].final_state["healthy"], true);

    let resolved = store
        .list_tickets(Some(TicketStatus::Resolved), None)
        .unwrap();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].diagnosis.as_deref(), Some("invariant cleared"));

    let analysis = analysis::analyze_campaign(
        &store,
        campaign_id,
        &operator_runtime::HeuristicClassifier,
    )
    .await
    .unwrap();
    assert_eq!(analysis.summary.resolved_count, 1);
    assert!((analysis.summary.win_rate - 1.0).abs() < f64::EPSILON);
}

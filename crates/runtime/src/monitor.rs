//! Monitor loop: observe the subject, evaluate invariants, reconcile
//! tickets.
//!
//! Single-threaded cooperative loop. Each tick takes one observation,
//! evaluates every registered invariant against it, then reconciles the
//! observed violation set with the set of tracked (open/in_progress)
//! tickets. Grace periods are enforced as consecutive-cycle counts held
//! in memory; the window simply restarts after a process restart.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::invariant::Invariant;
use crate::shutdown::ShutdownFlag;
use crate::store::Store;
use crate::subject::Subject;
use crate::types::{OperatorError, TicketStatus};

/// Tuning for the monitor loop.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Tick cadence.
    pub interval: Duration,
    /// Wall-clock bound on one observation.
    pub observe_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            observe_timeout: Duration::from_secs(15),
        }
    }
}

/// Per-violation persistence tracking for grace periods.
#[derive(Debug, Clone)]
struct Streak {
    consecutive_cycles: u32,
    first_seen: DateTime<Utc>,
}

/// The observe/check/reconcile driver.
pub struct Monitor {
    subject: Arc<dyn Subject>,
    invariants: Vec<Invariant>,
    store: Store,
    config: MonitorConfig,
    shutdown: ShutdownFlag,
    streaks: HashMap<(String, String), Streak>,
    observe_failures: u64,
}

impl Monitor {
    pub fn new(
        subject: Arc<dyn Subject>,
        invariants: Vec<Invariant>,
        store: Store,
        config: MonitorConfig,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            subject,
            invariants,
            store,
            config,
            shutdown,
            streaks: HashMap::new(),
            observe_failures: 0,
        }
    }

    /// Run until shutdown. The current tick always completes before the
    /// loop exits.
    pub async fn run(&mut self) -> Result<(), OperatorError> {
        tracing::info!(
            subject = self.subject.name(),
            invariants = self.invariants.len(),
            interval_sec = self.config.interval.as_secs(),
            "monitor started"
        );
        loop {
            if self.shutdown.is_requested() {
                break;
            }
            if let Err(e) = self.tick().await {
                // Store failures are logged and retried next tick; the
                // monitor never opens tickets for its own outages.
                tracing::error!(error = %e, "monitor tick failed");
            }
            if self.shutdown.sleep(self.config.interval).await {
                break;
            }
        }
        tracing::info!("monitor stopped");
        Ok(())
    }

    /// One observe/evaluate/reconcile cycle. Public so tests and the
    /// harness can drive ticks deterministically.
    pub async fn tick(&mut self) -> Result<(), OperatorError> {
        let observation = match tokio::time::timeout(
            self.config.observe_timeout,
            self.subject.observe(),
        )
        .await
        {
            Ok(Ok(observation)) => observation,
            Ok(Err(e)) => {
                self.observe_failures += 1;
                tracing::warn!(
                    error = %e,
                    failures = self.observe_failures,
                    "observation failed, skipping tick"
                );
                return Ok(());
            }
            Err(_) => {
                self.observe_failures += 1;
                tracing::warn!(
                    timeout_sec = self.config.observe_timeout.as_secs(),
                    failures = self.observe_failures,
                    "observation timed out, skipping tick"
                );
                return Ok(());
            }
        };
        self.observe_failures = 0;

        // Evaluate every invariant; a failing invariant is skipped for
        // this tick only and must not suppress the others, nor close
        // its own tickets on the strength of a failed evaluation.
        let mut observed: HashMap<(String, String), ObservedViolation> = HashMap::new();
        let mut failed_invariants: HashSet<String> = HashSet::new();
        for invariant in &self.invariants {
            if invariant.subject_name != self.subject.name() {
                continue;
            }
            match invariant.evaluate(&observation) {
                Ok(violations) => {
                    for violation in violations {
                        observed.insert(
                            (invariant.name.clone(), violation.key.clone()),
                            ObservedViolation {
                                severity: invariant.severity,
                                grace_period_sec: invariant.grace_period_sec,
                                details: violation.details_with_key(),
                            },
                        );
                    }
                }
                Err(e) => {
                    tracing::error!(invariant = %invariant.name, error = %e, "evaluation failed");
                    failed_invariants.insert(invariant.name.clone());
                }
            }
        }

        // Update persistence streaks: increment observed keys, drop the
        // rest (keys of failed invariants are left untouched).
        let now = Utc::now();
        for key in observed.keys() {
            self.streaks
                .entry(key.clone())
                .and_modify(|s| s.consecutive_cycles += 1)
                .or_insert(Streak {
                    consecutive_cycles: 1,
                    first_seen: now,
                });
        }
        self.streaks.retain(|key, _| {
            observed.contains_key(key) || failed_invariants.contains(&key.0)
        });

        let tracked = self.store.active_tickets(self.subject.name())?;
        let tracked_keys: HashSet<(String, String)> = tracked
            .iter()
            .map(|t| (t.invariant_name.clone(), t.violation_key.clone()))
            .collect();

        // Open: violations past their grace window without a live ticket.
        for (key, violation) in &observed {
            if tracked_keys.contains(key) {
                continue;
            }
            let streak = &self.streaks[key];
            let required = required_cycles(violation.grace_period_sec, self.config.interval);
            if streak.consecutive_cycles < required {
                tracing::debug!(
                    invariant = %key.0,
                    violation_key = %key.1,
                    seen = streak.consecutive_cycles,
                    required,
                    "violation within grace window"
                );
                continue;
            }
            let mut details = violation.details.clone();
            if let Some(map) = details.as_object_mut() {
                map.insert(
                    "first_seen".to_string(),
                    serde_json::Value::String(streak.first_seen.to_rfc3339()),
                );
            }
            let id = self.store.open_ticket(
                &key.0,
                self.subject.name(),
                &key.1,
                violation.severity,
                &details,
            )?;
            tracing::info!(
                ticket = id,
                invariant = %key.0,
                violation_key = %key.1,
                severity = %violation.severity,
                "ticket opened"
            );
        }

        // Auto-close: tracked tickets whose violation cleared, but only
        // if no agent ever claimed them. Once a session owns the ticket
        // the trace belongs to the agent. Tickets of invariants not
        // registered in this process are left alone: absence of
        // evaluation is not evidence of recovery.
        let registered: HashSet<&str> = self
            .invariants
            .iter()
            .filter(|i| i.subject_name == self.subject.name())
            .map(|i| i.name.as_str())
            .collect();
        for ticket in &tracked {
            let key = (ticket.invariant_name.clone(), ticket.violation_key.clone());
            if observed.contains_key(&key)
                || failed_invariants.contains(&ticket.invariant_name)
                || !registered.contains(ticket.invariant_name.as_str())
            {
                continue;
            }
            match ticket.status {
                TicketStatus::Open => {
                    self.store.resolve_ticket(ticket.id, "invariant cleared")?;
                    tracing::info!(ticket = ticket.id, "ticket auto-closed, invariant cleared");
                }
                TicketStatus::InProgress => {
                    tracing::debug!(
                        ticket = ticket.id,
                        "violation cleared but ticket is in progress; agent owns resolution"
                    );
                }
                _ => {}
            }
        }

        Ok(())
    }
}

struct ObservedViolation {
    severity: crate::types::Severity,
    grace_period_sec: u64,
    details: serde_json::Value,
}

/// Number of consecutive cycles a violation must persist before a
/// ticket opens: `ceil(grace / interval)`, and at least one.
fn required_cycles(grace_period_sec: u64, interval: Duration) -> u32 {
    let interval_sec = interval.as_secs().max(1);
    let cycles = grace_period_sec.div_ceil(interval_sec);
    u32::try_from(cycles.max(1)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invariant::Violation;
    use crate::subject::{Observation, Subject};
    use crate::types::{Severity, SubjectError};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Subject whose observations are scripted per tick.
    struct ScriptedSubject {
        observations: Mutex<Vec<Result<serde_json::Value, SubjectError>>>,
    }

    impl ScriptedSubject {
        fn new(observations: Vec<Result<serde_json::Value, SubjectError>>) -> Self {
            Self {
                observations: Mutex::new(observations),
            }
        }
    }

    #[async_trait]
    impl Subject for ScriptedSubject {
        fn name(&self) -> &str {
            "tikv"
        }

        fn description(&self) -> &str {
            "scripted test cluster"
        }

        async fn observe(&self) -> Result<Observation, SubjectError> {
            let mut queue = self.observations.lock().unwrap();
            if queue.is_empty() {
                return Err(SubjectError::Observe("script exhausted".into()));
            }
            queue.remove(0).map(Observation::new)
        }

        fn is_healthy(&self, observation: &Observation) -> bool {
            observation.data["down"].as_array().map_or(true, Vec::is_empty)
        }
    }

    /// Invariant violated for every id listed under "down".
    fn down_invariant(grace_period_sec: u64) -> Invariant {
        Invariant::new("stores-up", "tikv", Severity::Critical, grace_period_sec, |obs| {
            let down = obs.data["down"].as_array().cloned().unwrap_or_default();
            Ok(down
                .iter()
                .filter_map(|id| id.as_str())
                .map(|id| Violation::new(id, serde_json::json!({"store": id, "state": "Down"})))
                .collect())
        })
    }

    fn monitor(
        observations: Vec<Result<serde_json::Value, SubjectError>>,
        grace_period_sec: u64,
        interval: Duration,
        store: Store,
    ) -> Monitor {
        Monitor::new(
            Arc::new(ScriptedSubject::new(observations)),
            vec![down_invariant(grace_period_sec)],
            store,
            MonitorConfig {
                interval,
                observe_timeout: Duration::from_secs(5),
            },
            ShutdownFlag::new(),
        )
    }

    fn down(ids: &[&str]) -> Result<serde_json::Value, SubjectError> {
        Ok(serde_json::json!({ "down": ids }))
    }

    #[test]
    fn test_required_cycles() {
        let interval = Duration::from_secs(2);
        assert_eq!(required_cycles(0, interval), 1);
        assert_eq!(required_cycles(2, interval), 1);
        assert_eq!(required_cycles(3, interval), 2);
        assert_eq!(required_cycles(6, interval), 3);
    }

    #[tokio::test]
    async fn test_dedup_under_violation_persistence() {
        let (_dir, store) = crate::store::test_support::temp_store();
        let mut monitor = monitor(
            (0..5).map(|_| down(&["store-2"])).collect(),
            0,
            Duration::from_secs(2),
            store.clone(),
        );

        for _ in 0..5 {
            monitor.tick().await.unwrap();
        }

        let tickets = store.list_tickets(None, None).unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].violation_key, "store-2");
        assert_eq!(tickets[0].status, TicketStatus::Open);
    }

    #[tokio::test]
    async fn test_grace_period_delays_open_then_autocloses() {
        let (_dir, store) = crate::store::test_support::temp_store();
        // grace 6s, interval 2s: violation present ticks 1-3, absent tick 4.
        let mut monitor = monitor(
            vec![down(&["s1"]), down(&["s1"]), down(&["s1"]), down(&[])],
            6,
            Duration::from_secs(2),
            store.clone(),
        );

        monitor.tick().await.unwrap();
        assert!(store.list_tickets(None, None).unwrap().is_empty());
        monitor.tick().await.unwrap();
        assert!(store.list_tickets(None, None).unwrap().is_empty());

        // Third consecutive sighting satisfies ceil(6/2) = 3 cycles.
        monitor.tick().await.unwrap();
        let open = store.list_tickets(Some(TicketStatus::Open), None).unwrap();
        assert_eq!(open.len(), 1);

        // Violation clears while the ticket is still open.
        monitor.tick().await.unwrap();
        let ticket = store.get_ticket(open[0].id).unwrap().unwrap();
        assert_eq!(ticket.status, TicketStatus::Resolved);
        assert_eq!(ticket.diagnosis.as_deref(), Some("invariant cleared"));
    }

    #[tokio::test]
    async fn test_grace_streak_resets_on_clear_cycle() {
        let (_dir, store) = crate::store::test_support::temp_store();
        // Present, absent, present, present: the clear cycle restarts
        // the window, so no ticket after four ticks with grace of 3.
        let mut monitor = monitor(
            vec![down(&["s1"]), down(&[]), down(&["s1"]), down(&["s1"])],
            6,
            Duration::from_secs(2),
            store.clone(),
        );
        for _ in 0..4 {
            monitor.tick().await.unwrap();
        }
        assert!(store.list_tickets(None, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_in_progress_tickets_are_not_autoclosed() {
        let (_dir, store) = crate::store::test_support::temp_store();
        let mut monitor = monitor(
            vec![down(&["s1"]), down(&[])],
            0,
            Duration::from_secs(2),
            store.clone(),
        );

        monitor.tick().await.unwrap();
        let claimed = store.claim_open_ticket("sess-1").unwrap().unwrap();

        // Violation clears, but the agent owns the ticket now.
        monitor.tick().await.unwrap();
        let ticket = store.get_ticket(claimed.id).unwrap().unwrap();
        assert_eq!(ticket.status, TicketStatus::InProgress);
    }

    #[tokio::test]
    async fn test_observation_failure_skips_reconciliation() {
        let (_dir, store) = crate::store::test_support::temp_store();
        let mut monitor = monitor(
            vec![
                down(&["s1"]),
                Err(SubjectError::Observe("connection refused".into())),
            ],
            0,
            Duration::from_secs(2),
            store.clone(),
        );

        monitor.tick().await.unwrap();
        assert_eq!(store.list_tickets(None, None).unwrap().len(), 1);

        // Failed observation: no opens, no closes.
        monitor.tick().await.unwrap();
        let tickets = store.list_tickets(None, None).unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].status, TicketStatus::Open);
    }

    #[tokio::test]
    async fn test_reopen_after_resolution() {
        let (_dir, store) = crate::store::test_support::temp_store();
        let mut monitor = monitor(
            vec![down(&["s1"]), down(&[]), down(&["s1"])],
            0,
            Duration::from_secs(2),
            store.clone(),
        );

        monitor.tick().await.unwrap();
        monitor.tick().await.unwrap();
        monitor.tick().await.unwrap();

        let tickets = store.list_tickets(None, None).unwrap();
        assert_eq!(tickets.len(), 2);
        assert_eq!(tickets[0].status, TicketStatus::Resolved);
        assert_eq!(tickets[1].status, TicketStatus::Open);
    }
}

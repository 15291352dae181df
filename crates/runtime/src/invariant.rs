//! Declarative invariants with deterministic evaluation.
//!
//! An invariant is a named, pure predicate over a subject observation.
//! Violations carry a stable `key` and a details payload that always
//! includes the `violation_key` field the store dedups on. No built-in
//! invariants live here; subject packages supply them at registration.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::subject::{InvariantChecker, Observation};
use crate::types::{InvariantError, Severity};

/// Well-known field inside `violation_details` holding the dedup key.
pub const VIOLATION_KEY_FIELD: &str = "violation_key";

/// One violation produced by evaluating an invariant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    /// Deterministic fingerprint of the violated condition, e.g. the
    /// affected store id. Stable across cycles while the condition holds.
    pub key: String,
    /// Structured payload handed to the ticket.
    pub details: serde_json::Value,
}

impl Violation {
    pub fn new(key: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            details,
        }
    }

    /// Details with the `violation_key` field merged in.
    pub fn details_with_key(&self) -> serde_json::Value {
        let mut details = self.details.clone();
        match details.as_object_mut() {
            Some(map) => {
                map.entry(VIOLATION_KEY_FIELD)
                    .or_insert_with(|| serde_json::Value::String(self.key.clone()));
            }
            None => {
                details = serde_json::json!({
                    VIOLATION_KEY_FIELD: self.key,
                    "payload": details,
                });
            }
        }
        details
    }
}

type EvalFn = Box<dyn Fn(&Observation) -> Result<Vec<Violation>, InvariantError> + Send + Sync>;

/// In-memory invariant declaration. Evaluation is pure and local; the
/// monitor applies the grace period before opening tickets.
pub struct Invariant {
    pub name: String,
    pub subject_name: String,
    pub severity: Severity,
    pub grace_period_sec: u64,
    evaluate: EvalFn,
}

impl Invariant {
    pub fn new(
        name: impl Into<String>,
        subject_name: impl Into<String>,
        severity: Severity,
        grace_period_sec: u64,
        evaluate: impl Fn(&Observation) -> Result<Vec<Violation>, InvariantError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            subject_name: subject_name.into(),
            severity,
            grace_period_sec,
            evaluate: Box::new(evaluate),
        }
    }

    /// Wrap one named invariant of an external checker. The adapter
    /// filters the checker's flat output down to this invariant's
    /// violations.
    pub fn from_checker(
        name: impl Into<String>,
        subject_name: impl Into<String>,
        severity: Severity,
        grace_period_sec: u64,
        checker: Arc<dyn InvariantChecker>,
    ) -> Self {
        let name = name.into();
        let filter_name = name.clone();
        Self::new(
            name,
            subject_name,
            severity,
            grace_period_sec,
            move |observation| {
                Ok(checker
                    .check(observation)
                    .into_iter()
                    .filter(|v| v.invariant_name == filter_name)
                    .map(|v| Violation::new(v.key, v.details))
                    .collect())
            },
        )
    }

    pub fn evaluate(&self, observation: &Observation) -> Result<Vec<Violation>, InvariantError> {
        (self.evaluate)(observation)
    }
}

impl std::fmt::Debug for Invariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invariant")
            .field("name", &self.name)
            .field("subject_name", &self.subject_name)
            .field("severity", &self.severity)
            .field("grace_period_sec", &self.grace_period_sec)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subject::CheckedViolation;

    fn observation(data: serde_json::Value) -> Observation {
        Observation::new(data)
    }

    #[test]
    fn test_evaluate_is_deterministic() {
        let inv = Invariant::new("stores-up", "tikv", Severity::Critical, 0, |obs| {
            let up = obs.data["up"].as_u64().unwrap_or(0);
            if up < 3 {
                Ok(vec![Violation::new(
                    "quorum",
                    serde_json::json!({"expected": 3, "actual": up}),
                )])
            } else {
                Ok(vec![])
            }
        });

        let degraded = observation(serde_json::json!({"up": 2}));
        let first = inv.evaluate(&degraded).unwrap();
        let second = inv.evaluate(&degraded).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].key, second[0].key);

        let healthy = observation(serde_json::json!({"up": 3}));
        assert!(inv.evaluate(&healthy).unwrap().is_empty());
    }

    #[test]
    fn test_details_with_key_merges_field() {
        let v = Violation::new("store-2", serde_json::json!({"state": "Down"}));
        let details = v.details_with_key();
        assert_eq!(details[VIOLATION_KEY_FIELD], "store-2");
        assert_eq!(details["state"], "Down");

        // Non-object payloads get wrapped rather than dropped.
        let v = Violation::new("k", serde_json::json!([1, 2]));
        let details = v.details_with_key();
        assert_eq!(details[VIOLATION_KEY_FIELD], "k");
        assert_eq!(details["payload"], serde_json::json!([1, 2]));
    }

    #[test]
    fn test_from_checker_filters_by_invariant_name() {
        struct TwoInvariantChecker;
        impl InvariantChecker for TwoInvariantChecker {
            fn check(&self, _obs: &Observation) -> Vec<CheckedViolation> {
                vec![
                    CheckedViolation {
                        invariant_name: "a".into(),
                        key: "k1".into(),
                        severity: Severity::Warning,
                        details: serde_json::json!({}),
                    },
                    CheckedViolation {
                        invariant_name: "b".into(),
                        key: "k2".into(),
                        severity: Severity::Critical,
                        details: serde_json::json!({}),
                    },
                ]
            }
        }

        let checker = Arc::new(TwoInvariantChecker);
        let inv = Invariant::from_checker("a", "subj", Severity::Warning, 0, checker);
        let violations = inv
            .evaluate(&observation(serde_json::json!({})))
            .unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].key, "k1");
    }
}

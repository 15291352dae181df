//! Contracts between the Operator core and subject adapters.
//!
//! The core knows nothing subject-specific: the monitor, agent, and
//! evaluation harness talk to the system under management only through
//! these traits. Subject packages register adapters at process start.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Severity, SubjectError};

pub mod scripted;

/// A point-in-time snapshot of the subject, as produced by `observe`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
    /// JSON-serialisable state payload.
    pub data: serde_json::Value,
}

impl Observation {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            taken_at: Utc::now(),
            data,
        }
    }
}

/// Declaration of an action a subject supports, for approval-mode
/// workflows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    pub description: String,
    /// JSON schema for the action parameters.
    pub params: serde_json::Value,
}

/// The distributed system being monitored and remediated.
#[async_trait]
pub trait Subject: Send + Sync {
    /// Stable name used in tickets, campaigns, and prompts.
    fn name(&self) -> &str;

    /// High-level description injected into the agent's system prompt.
    fn description(&self) -> &str;

    /// Snapshot current state. Callers bound this with a timeout.
    async fn observe(&self) -> Result<Observation, SubjectError>;

    /// Judge whether an observation represents a healthy subject.
    /// Used by the harness when snapshotting trial end state.
    fn is_healthy(&self, observation: &Observation) -> bool;

    /// Restore a known clean state before a trial. Subjects without a
    /// reset procedure accept the default.
    async fn reset(&self) -> Result<(), SubjectError> {
        Ok(())
    }

    /// Actions available for approval-mode workflows.
    fn action_definitions(&self) -> Vec<ActionSpec> {
        Vec::new()
    }
}

/// One violation reported by an external checker, flattened with the
/// invariant identity it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckedViolation {
    pub invariant_name: String,
    pub key: String,
    pub severity: Severity,
    pub details: serde_json::Value,
}

/// Pure evaluation of a subject observation against its invariants.
/// Implementations must be deterministic and perform no I/O.
pub trait InvariantChecker: Send + Sync {
    fn check(&self, observation: &Observation) -> Vec<CheckedViolation>;
}

/// Fault injection used by the evaluation harness. The core does not
/// enumerate chaos types; each subject declares its own.
#[async_trait]
pub trait ChaosInjector: Send + Sync {
    /// Inject a fault, returning metadata describing what was done.
    async fn inject(
        &self,
        chaos_type: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, SubjectError>;

    /// Undo a previously injected fault.
    async fn recover(&self, metadata: &serde_json::Value) -> Result<(), SubjectError>;
}

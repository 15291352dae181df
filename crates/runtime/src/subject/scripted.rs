//! Script-driven subject adapter.
//!
//! Subjects are wired into the daemons from a YAML spec: an observe
//! command whose stdout is the JSON observation, an optional reset
//! command, declarative invariants over JSON pointers, and chaos
//! inject/recover commands for the harness. This is the registration
//! seam for deployments that do not link a purpose-built adapter crate.
//!
//! The invariant rules cover the shapes the framework must support:
//! count thresholds over filtered arrays, scalar ceilings, and per-key
//! equality between two sources (semantic drift).

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use super::{ChaosInjector, Observation, Subject};
use crate::invariant::{Invariant, Violation};
use crate::types::{ConfigError, InvariantError, Severity, SubjectError};

fn default_timeout_sec() -> u64 {
    30
}

/// A shell command plus its wall-clock bound.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandSpec {
    pub command: String,
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
}

/// Filter for array rules: keep items whose pointer equals a value.
#[derive(Debug, Clone, Deserialize)]
pub struct Filter {
    /// JSON pointer relative to the array item.
    pub path: String,
    pub equals: serde_json::Value,
}

/// Declarative invariant rules.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rule {
    /// Violated when fewer than `minimum` items (optionally filtered)
    /// exist under `items`.
    CountAtLeast {
        /// JSON pointer to an array in the observation.
        items: String,
        #[serde(default, rename = "where")]
        filter: Option<Filter>,
        minimum: u64,
        /// Violation key; defaults to the invariant name.
        #[serde(default)]
        key: Option<String>,
    },
    /// Violated when the number under `value` exceeds `maximum`.
    MaxThreshold {
        /// JSON pointer to a number in the observation.
        value: String,
        maximum: f64,
        #[serde(default)]
        key: Option<String>,
    },
    /// Violated per item where `left` and `right` differ. The item's
    /// `key` pointer becomes the violation key.
    ForEachEquals {
        items: String,
        key: String,
        left: String,
        right: String,
    },
}

/// One invariant declaration in the subject spec.
#[derive(Debug, Clone, Deserialize)]
pub struct InvariantSpec {
    pub name: String,
    pub severity: Severity,
    #[serde(default)]
    pub grace_period_sec: u64,
    pub rule: Rule,
}

/// Chaos inject/recover commands for the harness.
#[derive(Debug, Clone, Deserialize)]
pub struct ChaosCommands {
    /// Run with `CHAOS_TYPE` and `CHAOS_PARAMS` (JSON) in the environment.
    pub inject: String,
    /// Run with `CHAOS_METADATA` (JSON) in the environment.
    #[serde(default)]
    pub recover: Option<String>,
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
}

/// Full subject spec, usually loaded from YAML.
#[derive(Debug, Clone, Deserialize)]
pub struct SubjectSpec {
    pub name: String,
    pub description: String,
    pub observe: CommandSpec,
    #[serde(default)]
    pub reset: Option<CommandSpec>,
    #[serde(default)]
    pub invariants: Vec<InvariantSpec>,
    #[serde(default)]
    pub chaos: Option<ChaosCommands>,
}

impl SubjectSpec {
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path.display().to_string()))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))
    }
}

/// Subject implementation backed by a [`SubjectSpec`].
pub struct ScriptedSubject {
    spec: SubjectSpec,
}

impl ScriptedSubject {
    pub fn new(spec: SubjectSpec) -> Self {
        Self { spec }
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::new(SubjectSpec::from_yaml_file(path)?))
    }

    pub fn spec(&self) -> &SubjectSpec {
        &self.spec
    }

    /// Materialise the declared invariants for monitor registration.
    pub fn invariants(&self) -> Vec<Invariant> {
        self.spec
            .invariants
            .iter()
            .map(|inv| {
                let rule = inv.rule.clone();
                let name = inv.name.clone();
                Invariant::new(
                    inv.name.clone(),
                    self.spec.name.clone(),
                    inv.severity,
                    inv.grace_period_sec,
                    move |observation| evaluate_rule(&name, &rule, observation),
                )
            })
            .collect()
    }

    /// The chaos injector declared alongside this subject, if any.
    pub fn chaos_injector(&self) -> Option<Arc<dyn ChaosInjector>> {
        self.spec.chaos.clone().map(|commands| {
            Arc::new(ScriptedChaosInjector { commands }) as Arc<dyn ChaosInjector>
        })
    }
}

#[async_trait]
impl Subject for ScriptedSubject {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn description(&self) -> &str {
        &self.spec.description
    }

    async fn observe(&self) -> Result<Observation, SubjectError> {
        let output = run_command(
            &self.spec.observe.command,
            Duration::from_secs(self.spec.observe.timeout_sec),
            &[],
        )
        .await?;
        let data: serde_json::Value = serde_json::from_str(&output)
            .map_err(|e| SubjectError::InvalidPayload(format!("observe output: {e}")))?;
        Ok(Observation::new(data))
    }

    fn is_healthy(&self, observation: &Observation) -> bool {
        self.spec.invariants.iter().all(|inv| {
            matches!(
                evaluate_rule(&inv.name, &inv.rule, observation),
                Ok(violations) if violations.is_empty()
            )
        })
    }

    async fn reset(&self) -> Result<(), SubjectError> {
        if let Some(reset) = &self.spec.reset {
            run_command(&reset.command, Duration::from_secs(reset.timeout_sec), &[])
                .await
                .map_err(|e| SubjectError::Reset(e.to_string()))?;
        }
        Ok(())
    }
}

/// Chaos injector backed by the subject spec's inject/recover commands.
pub struct ScriptedChaosInjector {
    commands: ChaosCommands,
}

#[async_trait]
impl ChaosInjector for ScriptedChaosInjector {
    async fn inject(
        &self,
        chaos_type: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, SubjectError> {
        let params_text = params.to_string();
        let env = [
            ("CHAOS_TYPE", chaos_type.to_string()),
            ("CHAOS_PARAMS", params_text),
        ];
        let output = run_command(
            &self.commands.inject,
            Duration::from_secs(self.commands.timeout_sec),
            &env,
        )
        .await?;
        Ok(serde_json::json!({
            "chaos_type": chaos_type,
            "params": params,
            "command": self.commands.inject,
            "output": output.trim(),
        }))
    }

    async fn recover(&self, metadata: &serde_json::Value) -> Result<(), SubjectError> {
        let Some(recover) = &self.commands.recover else {
            return Ok(());
        };
        let env = [("CHAOS_METADATA", metadata.to_string())];
        run_command(recover, Duration::from_secs(self.commands.timeout_sec), &env).await?;
        Ok(())
    }
}

/// Run `sh -c command`, returning stdout. Non-zero exit or timeout is
/// an observation failure, with stderr carried in the error.
async fn run_command(
    command: &str,
    timeout: Duration,
    env: &[(&str, String)],
) -> Result<String, SubjectError> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in env {
        cmd.env(key, value);
    }
    let child = cmd
        .spawn()
        .map_err(|e| SubjectError::Observe(format!("spawn '{command}': {e}")))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(SubjectError::Observe(format!("wait '{command}': {e}"))),
        Err(_) => {
            return Err(SubjectError::Timeout {
                seconds: timeout.as_secs(),
            })
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SubjectError::Observe(format!(
            "'{command}' exited {}: {}",
            output.status.code().unwrap_or(-1),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn pointer<'a>(
    invariant: &str,
    data: &'a serde_json::Value,
    path: &str,
) -> Result<&'a serde_json::Value, InvariantError> {
    data.pointer(path).ok_or_else(|| InvariantError {
        name: invariant.to_string(),
        reason: format!("pointer '{path}' not found in observation"),
    })
}

fn evaluate_rule(
    invariant: &str,
    rule: &Rule,
    observation: &Observation,
) -> Result<Vec<Violation>, InvariantError> {
    let data = &observation.data;
    match rule {
        Rule::CountAtLeast {
            items,
            filter,
            minimum,
            key,
        } => {
            let array = pointer(invariant, data, items)?
                .as_array()
                .ok_or_else(|| InvariantError {
                    name: invariant.to_string(),
                    reason: format!("'{items}' is not an array"),
                })?;
            let actual = array
                .iter()
                .filter(|item| match filter {
                    Some(f) => item.pointer(&f.path) == Some(&f.equals),
                    None => true,
                })
                .count() as u64;
            if actual < *minimum {
                let key = key.clone().unwrap_or_else(|| invariant.to_string());
                Ok(vec![Violation::new(
                    key,
                    serde_json::json!({"expected_at_least": minimum, "actual": actual}),
                )])
            } else {
                Ok(vec![])
            }
        }
        Rule::MaxThreshold {
            value,
            maximum,
            key,
        } => {
            let actual = pointer(invariant, data, value)?
                .as_f64()
                .ok_or_else(|| InvariantError {
                    name: invariant.to_string(),
                    reason: format!("'{value}' is not a number"),
                })?;
            if actual > *maximum {
                let key = key
                    .clone()
                    .unwrap_or_else(|| value.trim_start_matches('/').replace('/', "."));
                Ok(vec![Violation::new(
                    key,
                    serde_json::json!({"maximum": maximum, "actual": actual}),
                )])
            } else {
                Ok(vec![])
            }
        }
        Rule::ForEachEquals {
            items,
            key,
            left,
            right,
        } => {
            let array = pointer(invariant, data, items)?
                .as_array()
                .ok_or_else(|| InvariantError {
                    name: invariant.to_string(),
                    reason: format!("'{items}' is not an array"),
                })?;
            let mut violations = Vec::new();
            for item in array {
                let item_key = item
                    .pointer(key)
                    .map(value_to_key)
                    .ok_or_else(|| InvariantError {
                        name: invariant.to_string(),
                        reason: format!("item key pointer '{key}' not found"),
                    })?;
                let left_value = item.pointer(left);
                let right_value = item.pointer(right);
                if left_value != right_value {
                    violations.push(Violation::new(
                        item_key,
                        serde_json::json!({
                            "left": left_value,
                            "right": right_value,
                        }),
                    ));
                }
            }
            Ok(violations)
        }
    }
}

fn value_to_key(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

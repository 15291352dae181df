//! Environment and path resolution for the Operator processes.

use std::path::PathBuf;

use crate::types::{ConfigError, SafetyMode};

/// Environment variable overriding the database location.
pub const ENV_DB_PATH: &str = "OPERATOR_DB_PATH";
/// Environment variable selecting observe/execute mode for the agent.
pub const ENV_SAFETY_MODE: &str = "OPERATOR_SAFETY_MODE";
/// Environment variable enabling the approval gate for mutating tools.
pub const ENV_APPROVAL_MODE: &str = "OPERATOR_APPROVAL_MODE";
/// API key required by the agent's model client.
pub const ENV_API_KEY: &str = "ANTHROPIC_API_KEY";

/// Default database path: `~/.operator/operator.db`.
pub fn default_db_path() -> PathBuf {
    let base = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join(".operator").join("operator.db")
}

/// Resolve the database path: CLI flag, then `OPERATOR_DB_PATH`, then default.
pub fn resolve_db_path(cli_override: Option<&str>) -> PathBuf {
    if let Some(path) = cli_override {
        return PathBuf::from(path);
    }
    if let Ok(path) = std::env::var(ENV_DB_PATH) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    default_db_path()
}

/// Read `OPERATOR_SAFETY_MODE`; defaults to observe.
pub fn safety_mode_from_env() -> Result<SafetyMode, ConfigError> {
    match std::env::var(ENV_SAFETY_MODE) {
        Ok(raw) => raw
            .parse()
            .map_err(|e: String| ConfigError::Invalid(format!("{ENV_SAFETY_MODE}: {e}"))),
        Err(_) => Ok(SafetyMode::Observe),
    }
}

/// Read `OPERATOR_APPROVAL_MODE`; defaults to false.
pub fn approval_mode_from_env() -> Result<bool, ConfigError> {
    match std::env::var(ENV_APPROVAL_MODE) {
        Ok(raw) => match raw.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" | "" => Ok(false),
            other => Err(ConfigError::Invalid(format!(
                "{ENV_APPROVAL_MODE} must be true or false, got '{other}'"
            ))),
        },
        Err(_) => Ok(false),
    }
}

/// Require `ANTHROPIC_API_KEY` to be present and non-empty.
pub fn require_api_key() -> Result<String, ConfigError> {
    match std::env::var(ENV_API_KEY) {
        Ok(key) if !key.is_empty() => Ok(key),
        _ => Err(ConfigError::MissingEnv(ENV_API_KEY.to_string())),
    }
}

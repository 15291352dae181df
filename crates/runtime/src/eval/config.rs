//! Campaign configuration loaded from YAML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::types::ConfigError;

fn default_trials() -> u32 {
    1
}

fn default_parallelism() -> u32 {
    1
}

fn default_detect_timeout() -> u64 {
    60
}

fn default_resolve_timeout() -> u64 {
    180
}

fn default_chaos_params() -> serde_json::Value {
    serde_json::json!({})
}

/// One campaign as declared in an `eval run` config file.
#[derive(Debug, Clone, Deserialize)]
pub struct CampaignSpec {
    pub name: String,
    /// Path to the subject spec YAML, relative to this config file.
    pub subject: PathBuf,
    pub chaos_type: String,
    #[serde(default = "default_chaos_params")]
    pub chaos_params: serde_json::Value,
    #[serde(default)]
    pub variant: Option<String>,
    /// Baseline campaigns run without the agent daemon; the flag is
    /// recorded for analysis semantics.
    #[serde(default)]
    pub baseline: bool,
    #[serde(default = "default_trials")]
    pub trials: u32,
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
    /// Clean-state confirmation wait between reset and injection.
    #[serde(default)]
    pub baseline_wait_sec: u64,
    #[serde(default = "default_detect_timeout")]
    pub detect_timeout_sec: u64,
    #[serde(default = "default_resolve_timeout")]
    pub resolve_timeout_sec: u64,
    /// Settle time between sequential trials on the same worker.
    #[serde(default)]
    pub cooldown_sec: u64,
}

impl CampaignSpec {
    /// Load and validate, resolving the subject path against the config
    /// file's directory.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path.display().to_string()))?;
        let mut spec: Self = serde_yaml::from_str(&raw)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
        if spec.subject.is_relative() {
            if let Some(parent) = path.parent() {
                spec.subject = parent.join(&spec.subject);
            }
        }
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("campaign name must not be empty".into()));
        }
        if self.trials == 0 {
            return Err(ConfigError::Invalid("trials must be at least 1".into()));
        }
        if self.parallelism == 0 {
            return Err(ConfigError::Invalid("parallelism must be at least 1".into()));
        }
        if self.detect_timeout_sec == 0 || self.resolve_timeout_sec == 0 {
            return Err(ConfigError::Invalid(
                "detect and resolve timeouts must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn detect_timeout(&self) -> Duration {
        Duration::from_secs(self.detect_timeout_sec)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_sec)
    }

    pub fn baseline_wait(&self) -> Duration {
        Duration::from_secs(self.baseline_wait_sec)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_sec)
    }
}

//! Engine settings

use crate::vault::SecretPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid settings: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// Engine-wide settings, loaded from YAML; every field has a default
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Maximum number of jobs running at once
    pub concurrency: usize,

    /// Step timeout when neither the step nor its job sets one
    pub default_timeout_minutes: f64,

    /// Cancel an in-flight run when a newer run starts for the same pipeline and ref
    pub cancel_superseded: bool,

    pub environment: EnvironmentSettings,

    pub vault: VaultSettings,

    pub history: HistorySettings,
}

/// Local provisioner settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentSettings {
    /// Accepted `runs-on` labels; empty accepts any
    pub labels: Vec<String>,

    /// Exposed to steps as `CI_SOURCE_DIR`
    pub source_dir: Option<PathBuf>,

    /// Action catalog: `owner/name` -> shell script
    pub actions: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultSettings {
    /// Environment variable prefix of the process-environment secret store
    pub env_prefix: String,

    #[serde(flatten)]
    pub policy: SecretPolicy,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            env_prefix: "PIPELINE_SECRET_".to_string(),
            policy: SecretPolicy::protected_main(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySettings {
    /// SQLite database path; defaults to the user's data directory
    pub database: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            default_timeout_minutes: 60.0,
            cancel_superseded: true,
            environment: EnvironmentSettings::default(),
            vault: VaultSettings::default(),
            history: HistorySettings::default(),
        }
    }
}

impl EngineSettings {
    /// Load settings from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, SettingsError> {
        let settings: EngineSettings = serde_yaml::from_str(yaml)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Settings from `path` if given, defaults otherwise
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.concurrency == 0 {
            return Err(SettingsError::Invalid("concurrency must be at least 1".to_string()));
        }
        if !(self.default_timeout_minutes.is_finite() && self.default_timeout_minutes > 0.0) {
            return Err(SettingsError::Invalid(
                "default_timeout_minutes must be positive".to_string(),
            ));
        }
        if Duration::try_from_secs_f64(self.default_timeout_minutes * 60.0).is_err() {
            return Err(SettingsError::Invalid(format!(
                "default_timeout_minutes of {} is too large",
                self.default_timeout_minutes
            )));
        }
        for pattern in self
            .vault
            .policy
            .protected_branches
            .iter()
            .chain(&self.vault.policy.protected_secrets)
        {
            glob::Pattern::new(pattern)
                .map_err(|e| SettingsError::Invalid(format!("bad pattern `{}`: {}", pattern, e)))?;
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        // Out-of-range values are rejected by `validate`
        Duration::try_from_secs_f64(self.default_timeout_minutes * 60.0).unwrap_or(Duration::MAX)
    }

    /// Path of the run history database
    pub fn history_path(&self) -> PathBuf {
        self.history.database.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("pipeline-engine")
                .join("history.db")
        })
    }
}

//! Runner configuration
//!
//! Configuration for the engine, loaded from `runner.yaml`:
//!
//! ```yaml
//! parallel: 4
//! step_timeout: 600000
//! shell: bash
//! record_dir: .pipeline/runs
//!
//! secrets:
//!   file: ./secrets.yaml
//!   env_prefix: CI_SECRET_
//!
//! actions:
//!   docker/build-push:
//!     inputs:
//!       image: { required: true }
//!     run: docker build -t ${{ inputs.image }} . && docker push ${{ inputs.image }}
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::action::ActionDefinition;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {file}: {error}")]
    Io {
        file: String,
        error: std::io::Error,
    },

    #[error("YAML parse error in {file}: {error}")]
    Yaml {
        file: String,
        error: serde_yaml::Error,
    },

    #[error("Invalid runner config: {0}")]
    Invalid(String),
}

/// Where secrets come from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretSourceConfig {
    /// YAML file of `NAME: value` (or `NAME: { value, scope }`) entries
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Read `NAME` from the process variable `<prefix>NAME`
    #[serde(default)]
    pub env_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Maximum number of jobs running at once
    #[serde(default = "default_parallel")]
    pub parallel: usize,

    /// Default step timeout in milliseconds
    #[serde(default = "default_step_timeout")]
    pub step_timeout: u64,

    /// Shell used for `run` steps
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Base working directory for step processes
    #[serde(default)]
    pub working_directory: Option<PathBuf>,

    /// Directory for durable run records
    #[serde(default)]
    pub record_dir: Option<PathBuf>,

    #[serde(default)]
    pub secrets: SecretSourceConfig,

    /// Reusable composite actions
    #[serde(default)]
    pub actions: BTreeMap<String, ActionDefinition>,
}

fn default_parallel() -> usize {
    4
}

fn default_step_timeout() -> u64 {
    30 * 60 * 1000
}

fn default_shell() -> String {
    "sh".to_string()
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            parallel: default_parallel(),
            step_timeout: default_step_timeout(),
            shell: default_shell(),
            working_directory: None,
            record_dir: None,
            secrets: SecretSourceConfig::default(),
            actions: BTreeMap::new(),
        }
    }
}

impl RunnerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|error| ConfigError::Io {
            file: file.clone(),
            error,
        })?;
        let mut config: RunnerConfig =
            serde_yaml::from_str(&content).map_err(|error| ConfigError::Yaml {
                file: file.clone(),
                error,
            })?;

        // Relative secret files are resolved against the config file
        if let (Some(secrets_file), Some(base)) = (&config.secrets.file, path.parent()) {
            if secrets_file.is_relative() {
                config.secrets.file = Some(base.join(secrets_file));
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Load `runner.yaml` / `runner.yml` from a directory if present
    pub fn discover(dir: impl AsRef<Path>) -> Result<Option<Self>, ConfigError> {
        for name in ["runner.yaml", "runner.yml"] {
            let candidate = dir.as_ref().join(name);
            if candidate.is_file() {
                return Self::load(candidate).map(Some);
            }
        }
        Ok(None)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallel == 0 {
            return Err(ConfigError::Invalid("parallel must be at least 1".to_string()));
        }
        if self.step_timeout == 0 {
            return Err(ConfigError::Invalid(
                "step_timeout must be greater than 0".to_string(),
            ));
        }
        if self.shell.trim().is_empty() {
            return Err(ConfigError::Invalid("shell must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout)
    }
}

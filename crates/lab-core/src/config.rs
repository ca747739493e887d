//! Configuration for the lab control plane.
//!
//! Loaded from a YAML file. Every section and field has a default, so an
//! empty file yields a usable single-stack configuration.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LabConfig {
    pub server: ServerConfig,
    pub stacks: Vec<StackConfig>,
    pub logs: LogsConfig,
    pub health: HealthConfig,
    pub lifecycle: LifecycleConfig,
    pub diagnose: DiagnoseConfig,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            stacks: vec![StackConfig::default()],
            logs: LogsConfig::default(),
            health: HealthConfig::default(),
            lifecycle: LifecycleConfig::default(),
            diagnose: DiagnoseConfig::default(),
        }
    }
}

impl LabConfig {
    /// Loads and validates a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse_yaml(&content)?;
        tracing::debug!(path = %path.display(), stacks = config.stacks.len(), "Loaded config");
        Ok(config)
    }

    /// Parses and validates configuration from a YAML string.
    pub fn parse_yaml(content: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes to null, not to an empty mapping
        let config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stacks.is_empty() {
            return Err(ConfigError::Invalid("at least one stack is required".into()));
        }

        let mut seen = HashSet::new();
        for stack in &self.stacks {
            if stack.name.trim().is_empty() {
                return Err(ConfigError::Invalid("stack name must not be empty".into()));
            }
            if !seen.insert(stack.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate stack name '{}'",
                    stack.name
                )));
            }
        }

        let non_zero = [
            ("logs.history_capacity", self.logs.history_capacity as u64),
            ("logs.reconcile_interval_secs", self.logs.reconcile_interval_secs),
            ("health.interval_secs", self.health.interval_secs),
            ("health.probe_timeout_secs", self.health.probe_timeout_secs),
            (
                "lifecycle.teardown_timeout_secs",
                self.lifecycle.teardown_timeout_secs,
            ),
            ("diagnose.turn_timeout_secs", self.diagnose.turn_timeout_secs),
            (
                "diagnose.startup_timeout_secs",
                self.diagnose.startup_timeout_secs,
            ),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{field} must be greater than zero")));
            }
        }

        Ok(())
    }

    /// Looks up a stack by name.
    pub fn stack(&self, name: &str) -> Option<&StackConfig> {
        self.stacks.iter().find(|s| s.name == name)
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory of the built dashboard, served at `/` when present
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            static_dir: None,
        }
    }
}

/// One managed stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StackConfig {
    pub name: String,
    /// Working directory for orchestration commands
    pub project_dir: PathBuf,
    /// Compose file, relative to `project_dir`
    pub compose_file: Option<PathBuf>,
    /// Container runtime executable (`docker`, `podman`)
    pub runtime: String,
    /// Per-service overrides keyed by service name
    pub services: HashMap<String, ServiceOverride>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            project_dir: PathBuf::from("."),
            compose_file: None,
            runtime: "docker".to_string(),
            services: HashMap::new(),
        }
    }
}

/// Per-service settings the orchestrator does not know about.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceOverride {
    pub health_url: Option<String>,
    pub port: Option<u16>,
    /// Host log file to tail instead of the container output
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogsConfig {
    /// Lines kept in each stack's history ring buffer
    pub history_capacity: usize,
    /// Lines replayed when a tail starts
    pub tail_backlog: usize,
    pub reconcile_interval_secs: u64,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            tail_backlog: 100,
            reconcile_interval_secs: 2,
        }
    }
}

impl LogsConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            probe_timeout_secs: 2,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LifecycleConfig {
    pub teardown_timeout_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            teardown_timeout_secs: 120,
        }
    }
}

impl LifecycleConfig {
    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_secs(self.teardown_timeout_secs)
    }
}

/// Settings for AI diagnosis sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiagnoseConfig {
    /// Provider CLI executable
    pub command: String,
    /// Extra arguments passed on every invocation
    pub args: Vec<String>,
    pub turn_timeout_secs: u64,
    pub startup_timeout_secs: u64,
    /// Recent log lines included in the initial diagnostic prompt
    pub prompt_log_lines: usize,
}

impl Default for DiagnoseConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: Vec::new(),
            turn_timeout_secs: 600,
            startup_timeout_secs: 30,
            prompt_log_lines: 50,
        }
    }
}

impl DiagnoseConfig {
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

//! Adapter configuration parsing and validation.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

fn default_stop_grace_ms() -> u64 {
    2000
}

fn default_stdout_drain_ms() -> u64 {
    200
}

/// Configuration for one agent process managed by an
/// [`AcpProcessAdapter`](crate::acp::adapter::AcpProcessAdapter).
///
/// Loadable from TOML:
///
/// ```toml
/// command = "my-agent"
/// args = ["--acp"]
/// cwd = "/srv/workspace"
///
/// [env]
/// AGENT_MODE = "headless"
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AdapterConfig {
    /// Agent binary to spawn (looked up on `PATH` if not a path).
    pub command: String,
    /// Arguments passed to the agent.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory of the agent; inherited when absent.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Variables overlaid on the inherited environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Time the agent gets to exit after `SIGTERM` before it is killed.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Time the reader may keep draining stdout after the process exits.
    #[serde(default = "default_stdout_drain_ms")]
    pub stdout_drain_ms: u64,
}

impl AdapterConfig {
    /// Configuration for `command` with every other field at its default.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            stop_grace_ms: default_stop_grace_ms(),
            stdout_drain_ms: default_stdout_drain_ms(),
        }
    }

    /// Replace the argument list.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Overlay one environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Grace period between `SIGTERM` and a forced kill.
    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// How long stdout may still be drained after the process exits.
    #[must_use]
    pub fn stdout_drain(&self) -> Duration {
        Duration::from_millis(self.stdout_drain_ms)
    }

    /// Check the invariants the adapter relies on.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when `command` is blank or an environment
    /// key is empty or contains `=`.
    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(AppError::Config("command must not be empty".into()));
        }

        if let Some(key) = self
            .env
            .keys()
            .find(|key| key.is_empty() || key.contains('=') || key.contains('\0'))
        {
            return Err(AppError::Config(format!(
                "invalid environment variable name: {key:?}"
            )));
        }

        Ok(())
    }
}

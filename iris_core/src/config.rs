//! # Fleet Configuration
//!
//! This module defines the data structures and loading logic for the
//! orchestrator configuration. The whole fleet is described by a single
//! YAML document at `$IRIS_HOME/config.yaml` (fallback `config.yml`;
//! `$IRIS_HOME` defaults to `~/.iris`):
//!
//! - **`Settings`**: global scheduling knobs — idle timeout, pool cap,
//!   health-check cadence, session init timeout and the default assistant
//!   command line.
//! - **`TeamConfig`**: one entry per named team — working directory,
//!   description and optional per-team overrides.
//! - **`DashboardConfig`**: bind address for the HTTP status dashboard.
//!
//! Configuration is immutable per load. `ConfigHandle` holds the current
//! snapshot behind an `Arc` and swaps it atomically on an explicit reload;
//! verb handlers only ever observe a consistent snapshot. In-place edits
//! (the `team add`/`team remove` CLI path) go through `config_edit`, which
//! preserves comments and ordering of untouched keys.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::Duration,
};

use crate::error::{OrchestratorError, Result};

fn default_command() -> Vec<String> {
    vec!["claude".to_string()]
}

/// Global orchestrator settings. All intervals are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Settings {
    /// Terminate a child after this much inactivity.
    pub idle_timeout: u64,
    /// Hard cap on concurrently live children (1..=50).
    pub max_processes: usize,
    /// Cadence of the idle/health sweeper.
    pub health_check_interval: u64,
    /// How long a freshly spawned child may take to signal readiness.
    pub session_init_timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_transport: Option<Transport>,
    /// Program + argv used to start an assistant unless the team overrides it.
    #[serde(default = "default_command")]
    pub default_command: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Stdio,
    Http,
}

/// One configured team.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TeamConfig {
    /// Working directory the assistant is spawned in.
    pub path: PathBuf,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_init_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_permissions: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Per-team assistant command override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
    pub host: String,
}

/// The complete parsed configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IrisConfig {
    pub settings: Settings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard: Option<DashboardConfig>,
    #[serde(default)]
    pub teams: BTreeMap<String, TeamConfig>,
}

impl IrisConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: IrisConfig = serde_yaml::from_str(text)
            .map_err(|e| OrchestratorError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit file path.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    /// Load from `$IRIS_HOME`, trying `config.yaml` then `config.yml`.
    pub fn load(home: &Path) -> Result<Self> {
        let path = config_path(home).ok_or_else(|| {
            OrchestratorError::Configuration(format!(
                "no config.yaml or config.yml under {}",
                home.display()
            ))
        })?;
        tracing::info!("Loading configuration from {}", path.display());
        Self::load_from_file(&path)
    }

    fn validate(&self) -> Result<()> {
        if !(1..=50).contains(&self.settings.max_processes) {
            return Err(OrchestratorError::Configuration(format!(
                "settings.maxProcesses must be in 1..=50, got {}",
                self.settings.max_processes
            )));
        }
        for (field, value) in [
            ("idleTimeout", self.settings.idle_timeout),
            ("healthCheckInterval", self.settings.health_check_interval),
            ("sessionInitTimeout", self.settings.session_init_timeout),
        ] {
            if value == 0 {
                return Err(OrchestratorError::Configuration(format!(
                    "settings.{} must be a positive number of milliseconds",
                    field
                )));
            }
        }
        if self.settings.default_command.is_empty() {
            return Err(OrchestratorError::Configuration(
                "settings.defaultCommand must not be empty".to_string(),
            ));
        }
        for (name, team) in &self.teams {
            if name.is_empty() {
                return Err(OrchestratorError::Configuration(
                    "team names must be non-empty".to_string(),
                ));
            }
            if team.path.as_os_str().is_empty() {
                return Err(OrchestratorError::Configuration(format!(
                    "team '{}' has an empty path",
                    name
                )));
            }
            if let Some(color) = &team.color
                && !is_hex_color(color)
            {
                return Err(OrchestratorError::Configuration(format!(
                    "team '{}' color must look like #RRGGBB, got '{}'",
                    name, color
                )));
            }
            if let Some(command) = &team.command
                && command.is_empty()
            {
                return Err(OrchestratorError::Configuration(format!(
                    "team '{}' command override must not be empty",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn team(&self, name: &str) -> Result<&TeamConfig> {
        self.teams
            .get(name)
            .ok_or_else(|| OrchestratorError::UnknownTeam(name.to_string()))
    }

    /// Idle timeout for a team, preferring the per-team override.
    pub fn effective_idle_timeout(&self, name: &str) -> Duration {
        let ms = self
            .teams
            .get(name)
            .and_then(|t| t.idle_timeout)
            .unwrap_or(self.settings.idle_timeout);
        Duration::from_millis(ms)
    }

    /// Session init timeout for a team, preferring the per-team override.
    pub fn effective_session_init_timeout(&self, name: &str) -> Duration {
        let ms = self
            .teams
            .get(name)
            .and_then(|t| t.session_init_timeout)
            .unwrap_or(self.settings.session_init_timeout);
        Duration::from_millis(ms)
    }

    /// Program + argv used to spawn the assistant for a team.
    pub fn assistant_command(&self, name: &str) -> &[String] {
        self.teams
            .get(name)
            .and_then(|t| t.command.as_deref())
            .unwrap_or(&self.settings.default_command)
    }
}

fn is_hex_color(s: &str) -> bool {
    s.len() == 7
        && s.starts_with('#')
        && s[1..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Resolve `$IRIS_HOME`, defaulting to `~/.iris`.
pub fn iris_home() -> PathBuf {
    if let Ok(home) = std::env::var("IRIS_HOME")
        && !home.is_empty()
    {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".iris")
}

/// The config file inside a home directory, if one exists.
pub fn config_path(home: &Path) -> Option<PathBuf> {
    let yaml = home.join("config.yaml");
    if yaml.exists() {
        return Some(yaml);
    }
    let yml = home.join("config.yml");
    if yml.exists() {
        return Some(yml);
    }
    None
}

/// Directory holding the persisted session/notification stores.
pub fn data_dir(home: &Path) -> PathBuf {
    home.join("data")
}

/// Process-wide handle to the current configuration snapshot.
///
/// Reload swaps the snapshot atomically; readers keep whatever `Arc` they
/// already cloned, so a verb never observes a half-applied reload.
#[derive(Debug)]
pub struct ConfigHandle {
    inner: RwLock<Arc<IrisConfig>>,
}

impl ConfigHandle {
    pub fn new(config: IrisConfig) -> Self {
        Self {
            inner: RwLock::new(Arc::new(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<IrisConfig> {
        self.inner
            .read()
            .expect("config lock poisoned")
            .clone()
    }

    pub fn replace(&self, config: IrisConfig) {
        let mut guard = self.inner.write().expect("config lock poisoned");
        *guard = Arc::new(config);
        tracing::info!("Configuration snapshot replaced");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r##"
settings:
  idleTimeout: 300000
  maxProcesses: 10
  healthCheckInterval: 30000
  sessionInitTimeout: 15000
teams:
  alpha:
    path: /srv/alpha
    description: Alpha workspace
    idleTimeout: 60000
  beta:
    path: /srv/beta
    description: Beta workspace
    color: "#00ff99"
"##;

    #[test]
    fn parses_and_validates_sample() {
        let config = IrisConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.settings.max_processes, 10);
        assert_eq!(config.teams.len(), 2);
        assert_eq!(config.settings.default_command, vec!["claude".to_string()]);
        assert_eq!(
            config.effective_idle_timeout("alpha"),
            Duration::from_millis(60000)
        );
        assert_eq!(
            config.effective_idle_timeout("beta"),
            Duration::from_millis(300000)
        );
    }

    #[test]
    fn rejects_out_of_range_pool_cap() {
        let text = SAMPLE.replace("maxProcesses: 10", "maxProcesses: 80");
        let err = IrisConfig::from_yaml(&text).unwrap_err();
        assert!(matches!(err, OrchestratorError::Configuration(_)));
    }

    #[test]
    fn rejects_bad_color() {
        let text = SAMPLE.replace("\"#00ff99\"", "\"green\"");
        assert!(IrisConfig::from_yaml(&text).is_err());
    }

    #[test]
    fn unknown_team_lookup_fails() {
        let config = IrisConfig::from_yaml(SAMPLE).unwrap();
        assert!(matches!(
            config.team("gamma"),
            Err(OrchestratorError::UnknownTeam(_))
        ));
    }

    #[test]
    fn snapshot_swap_is_atomic_per_reader() {
        let handle = ConfigHandle::new(IrisConfig::from_yaml(SAMPLE).unwrap());
        let before = handle.snapshot();
        let mut changed = IrisConfig::from_yaml(SAMPLE).unwrap();
        changed.settings.max_processes = 3;
        handle.replace(changed);
        assert_eq!(before.settings.max_processes, 10);
        assert_eq!(handle.snapshot().settings.max_processes, 3);
    }
}

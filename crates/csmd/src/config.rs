//! Configuration loading.
//!
//! Settings come from, in increasing priority: built-in defaults, a TOML
//! file, and command-line overrides applied by the caller. The file is
//! located via `--config`, then `$CSM_CONFIG`, then
//! `<config_dir>/csm/config.toml`. A missing default file is not an error.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use csm_core::{DomainError, Thresholds, DEFAULT_IDLE_THRESHOLD, DEFAULT_RUNNING_THRESHOLD};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::sampler::CommandFilter;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "CSM_CONFIG";

/// Default command basename to track.
pub const DEFAULT_TARGET_COMMAND: &str = "claude";

/// Substring that marks the desktop app sharing the CLI's name.
pub const DEFAULT_GUI_MARKER: &str = "Claude.app";

/// Default sampling period in seconds.
pub const DEFAULT_POLL_INTERVAL_SECS: f64 = 2.0;

/// Default attention auto-clear delay in seconds.
pub const DEFAULT_ATTENTION_CLEAR_SECS: f64 = 5.0;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for [`Config`].
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<DomainError> for ConfigError {
    fn from(err: DomainError) -> Self {
        Self::Invalid(err.to_string())
    }
}

// ============================================================================
// Sampler Backend
// ============================================================================

/// Which process-table reader to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerBackend {
    /// Run `ps` and parse its output.
    #[default]
    Ps,
    /// Query the process table through the `sysinfo` crate.
    Sysinfo,
}

impl fmt::Display for SamplerBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ps => write!(f, "ps"),
            Self::Sysinfo => write!(f, "sysinfo"),
        }
    }
}

impl FromStr for SamplerBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ps" => Ok(Self::Ps),
            "sysinfo" => Ok(Self::Sysinfo),
            other => Err(ConfigError::Invalid(format!(
                "unknown backend '{other}' (expected 'ps' or 'sysinfo')"
            ))),
        }
    }
}

// ============================================================================
// Config
// ============================================================================

/// Effective settings for the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Command basename to track
    pub target_command: String,
    /// Commands containing this substring are ignored
    pub gui_marker: String,
    /// Seconds between samples
    pub poll_interval_secs: f64,
    /// Seconds the attention signal stays raised after the latest completion
    pub attention_clear_secs: f64,
    /// CPU% above which a session is running
    pub running_threshold: f32,
    /// CPU% below which a running session is done
    pub idle_threshold: f32,
    /// Process-table reader
    pub backend: SamplerBackend,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_command: DEFAULT_TARGET_COMMAND.to_string(),
            gui_marker: DEFAULT_GUI_MARKER.to_string(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            attention_clear_secs: DEFAULT_ATTENTION_CLEAR_SECS,
            running_threshold: DEFAULT_RUNNING_THRESHOLD,
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
            backend: SamplerBackend::Ps,
        }
    }
}

impl Config {
    /// Returns `<config_dir>/csm/config.toml`, if a config dir exists.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("csm").join("config.toml"))
    }

    /// Loads configuration following the lookup order in the module docs.
    ///
    /// An explicit path (argument or `$CSM_CONFIG`) must exist; the default
    /// location may be absent, in which case defaults are returned.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a file cannot be read, parsed or validated.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        if let Some(path) = env::var_os(CONFIG_ENV_VAR).filter(|v| !v.is_empty()) {
            return Self::from_file(Path::new(&path));
        }

        match Self::default_path() {
            Some(path) if path.is_file() => Self::from_file(&path),
            _ => {
                debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Reads and validates a TOML config file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.validate()?;
        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_command.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "target_command must not be empty".to_string(),
            ));
        }
        if self.target_command.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "target_command '{}' must be a basename, not a path",
                self.target_command
            )));
        }
        check_positive_secs("poll_interval_secs", self.poll_interval_secs)?;
        check_positive_secs("attention_clear_secs", self.attention_clear_secs)?;
        self.thresholds()?;
        Ok(())
    }

    /// Threshold pair for the state machine.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` unless `0 <= idle < running`.
    pub fn thresholds(&self) -> Result<Thresholds, ConfigError> {
        Ok(Thresholds::new(self.running_threshold, self.idle_threshold)?)
    }

    /// Sampling period.
    pub fn poll_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.poll_interval_secs)
            .unwrap_or(Duration::from_secs_f64(DEFAULT_POLL_INTERVAL_SECS))
    }

    /// Attention auto-clear delay.
    pub fn attention_clear(&self) -> Duration {
        Duration::try_from_secs_f64(self.attention_clear_secs)
            .unwrap_or(Duration::from_secs_f64(DEFAULT_ATTENTION_CLEAR_SECS))
    }

    /// Record filter for the sampler.
    pub fn command_filter(&self) -> CommandFilter {
        CommandFilter::new(&self.target_command, &self.gui_marker)
    }

    /// Serializes the effective configuration as TOML.
    pub fn to_toml_string(&self) -> String {
        // Config has no maps or non-string keys, so serialization is infallible.
        toml::to_string(self).unwrap_or_default()
    }
}

fn check_positive_secs(field: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 && value <= u32::MAX as f64 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{field} must be a positive number of seconds, got {value}"
        )))
    }
}

//! Configuration schema (sqlweave.toml)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Where models are materialized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Optional database/catalog qualifier
    #[serde(default)]
    pub database: Option<String>,

    /// Schema every model is materialized into
    #[serde(default = "default_schema")]
    pub schema: String,
}

fn default_schema() -> String {
    "public".to_string()
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            database: None,
            schema: default_schema(),
        }
    }
}

/// How a named subset of models is expanded into a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Named models plus every transitive upstream model
    #[default]
    WithUpstream,

    /// Exactly the named models; upstream output must already exist
    Exact,
}

/// Execution engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Maximum models executing concurrently within one level
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Per-model timeout in seconds
    #[serde(default = "default_model_timeout_secs")]
    pub model_timeout_secs: u64,

    /// Stop launching new levels after the first level with a failure
    #[serde(default)]
    pub fail_fast: bool,

    /// Rebuild incremental models from scratch
    #[serde(default)]
    pub full_refresh: bool,

    /// Expansion policy for partial runs
    #[serde(default)]
    pub selection_policy: SelectionPolicy,
}

fn default_max_workers() -> usize {
    4
}

fn default_model_timeout_secs() -> u64 {
    300
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            model_timeout_secs: default_model_timeout_secs(),
            fail_fast: false,
            full_refresh: false,
            selection_policy: SelectionPolicy::default(),
        }
    }
}

impl EngineSettings {
    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }
}

/// Run recorder settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecorderSettings {
    /// Directory run summaries, logs and model records are written to
    #[serde(default = "default_output_dir")]
    pub output_dir: std::path::PathBuf,
}

fn default_output_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("target")
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Target relation settings
    #[serde(default)]
    pub target: TargetConfig,

    /// Engine settings
    #[serde(default)]
    pub engine: EngineSettings,

    /// Recorder settings
    #[serde(default)]
    pub recorder: RecorderSettings,

    /// Project variables available to `var()`
    #[serde(default)]
    pub vars: BTreeMap<String, String>,

    /// Project root path (for resolving relative paths)
    #[serde(skip)]
    pub project_root: std::path::PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: TargetConfig::default(),
            engine: EngineSettings::default(),
            recorder: RecorderSettings::default(),
            vars: BTreeMap::new(),
            project_root: std::env::current_dir().unwrap_or_default(),
        }
    }
}

impl Config {
    /// Load config from TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let mut config = Self::from_toml(&contents)?;

        // Set project root to parent of config file
        if let Some(parent) = path.parent() {
            config.project_root = parent.to_path_buf();
        }

        Ok(config)
    }

    /// Load config from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(toml)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Recorder output directory, resolved against the project root
    pub fn output_dir(&self) -> std::path::PathBuf {
        if self.recorder.output_dir.is_absolute() {
            self.recorder.output_dir.clone()
        } else {
            self.project_root.join(&self.recorder.output_dir)
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_workers == 0 {
            return Err(ConfigError::Invalid("engine.max_workers must be at least 1".to_string()));
        }
        if self.engine.model_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "engine.model_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.target.schema.trim().is_empty() {
            return Err(ConfigError::Invalid("target.schema must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Config error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

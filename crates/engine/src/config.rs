//! Engine configuration.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration. Files ending in `.json` are parsed as JSON; anything
//! else as YAML. Selected limits can be overridden through environment
//! variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use grimoire_types::LlmSettings;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Overrides [`EngineConfig::max_flow_depth`].
pub const MAX_FLOW_DEPTH_ENV: &str = "GRIMOIRE_MAX_FLOW_DEPTH";

/// Overrides [`EngineConfig::max_step_transitions`]; `0` or `none` removes the bound.
pub const MAX_STEP_TRANSITIONS_ENV: &str = "GRIMOIRE_MAX_STEP_TRANSITIONS";

/// Error surfaced when loading configuration fails.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config file '{}': {message}", .path.display())]
    Parse { path: PathBuf, message: String },
    #[error("invalid value '{value}' for {variable}")]
    InvalidEnv { variable: &'static str, value: String },
}

/// Limits and collaborator defaults for a [`FlowEngine`](crate::FlowEngine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Deepest permitted `flow_call` nesting; the top-level flow is depth 0.
    pub max_flow_depth: usize,
    /// Maximum steps one `execute` call may run. `None` leaves cycles unguarded.
    pub max_step_transitions: Option<usize>,
    pub name_defaults: NameDefaults,
    /// Settings beneath prompt and step level LLM settings.
    pub default_llm: LlmSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_flow_depth: 16,
            max_step_transitions: None,
            name_defaults: NameDefaults::default(),
            default_llm: LlmSettings {
                provider: Some("mock".to_string()),
                model: Some("mock-model".to_string()),
                temperature: Some(0.7),
                max_tokens: Some(500),
                api_key: None,
                base_url: None,
            },
        }
    }
}

/// Defaults for `name_generation` settings a step leaves out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NameDefaults {
    pub corpus: String,
    pub segmenter: String,
    pub algorithm: String,
    pub max_length: usize,
}

impl Default for NameDefaults {
    fn default() -> Self {
        Self {
            corpus: "generic-fantasy".to_string(),
            segmenter: "fantasy".to_string(),
            algorithm: "bayesian".to_string(),
            max_length: 15,
        }
    }
}

impl EngineConfig {
    /// Reads a JSON or YAML file (by extension) and applies env overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path
            .extension()
            .and_then(|extension| extension.to_str())
            .is_some_and(|extension| extension.eq_ignore_ascii_case("json"));
        let parsed = if is_json {
            serde_json::from_str::<EngineConfig>(&content).map_err(|error| error.to_string())
        } else if content.trim().is_empty() {
            Ok(EngineConfig::default())
        } else {
            serde_yaml::from_str::<EngineConfig>(&content).map_err(|error| error.to_string())
        };
        let mut config = parsed.map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Defaults with env overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env(MAX_FLOW_DEPTH_ENV) {
            self.max_flow_depth = value.parse().map_err(|_| ConfigError::InvalidEnv {
                variable: MAX_FLOW_DEPTH_ENV,
                value: value.clone(),
            })?;
        }
        if let Some(value) = read_env(MAX_STEP_TRANSITIONS_ENV) {
            self.max_step_transitions = match value.to_ascii_lowercase().as_str() {
                "0" | "none" => None,
                other => Some(other.parse().map_err(|_| ConfigError::InvalidEnv {
                    variable: MAX_STEP_TRANSITIONS_ENV,
                    value: value.clone(),
                })?),
            };
        }
        Ok(())
    }
}

fn read_env(variable: &str) -> Option<String> {
    env::var(variable)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

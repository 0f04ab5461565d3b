//! Application configuration
//!
//! Resolution order: built-in defaults, then an optional TOML file, then
//! `.env` and process environment overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::agent::AgentConfig;
use crate::integrations::generator::DEFAULT_GENERATOR_MODEL;
use crate::llm::client::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::runtime::RuntimeConfig;

/// Environment variables that override file settings
pub const ENV_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_MODEL: &str = "CELLPILOT_MODEL";
pub const ENV_ENV_PATH: &str = "CELLPILOT_ENV_PATH";
pub const ENV_APPS_DIR: &str = "CELLPILOT_APPS_DIR";
pub const ENV_OTLP_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("no API key configured (set {ENV_API_KEY} or [model].api_key)")]
    MissingApiKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub api_key: Option<String>,
    /// Model used for planning and execution
    pub model: String,
    /// Model used by `generate_app`
    pub generator_model: String,
    pub base_url: String,
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            generator_model: DEFAULT_GENERATOR_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppsConfig {
    /// Directory holding `manifest.json` and app modules
    pub dir: PathBuf,
}

impl Default for AppsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("apps"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// OTLP collector; spans are only exported when set
    pub otlp_endpoint: Option<String>,
    pub service_name: String,
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            service_name: "cellpilot".to_string(),
            json_logs: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub runtime: RuntimeConfig,
    pub agent: AgentConfig,
    pub model: ModelConfig,
    pub apps: AppsConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Load defaults, the optional TOML file, `.env` and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        // A missing .env is fine
        let _ = dotenvy::dotenv();
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production); empty values are ignored
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = get(ENV_API_KEY) {
            self.model.api_key = Some(key);
        }
        if let Some(model) = get(ENV_MODEL) {
            self.model.model = model;
        }
        if let Some(path) = get(ENV_ENV_PATH) {
            self.runtime.env_path = PathBuf::from(path);
        }
        if let Some(dir) = get(ENV_APPS_DIR) {
            self.apps.dir = PathBuf::from(dir);
        }
        if let Some(endpoint) = get(ENV_OTLP_ENDPOINT) {
            self.telemetry.otlp_endpoint = Some(endpoint);
        }
    }

    pub fn api_key(&self) -> Result<&str, ConfigError> {
        self.model
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey)
    }
}

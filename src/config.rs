use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::types::survey_data::Condition;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Ollama,
    Simulated,
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_temperature() -> f32 {
    0.7
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub provider: ProviderKind,
    pub model_name: String,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Pacing for this model; unset means no rate limiting.
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
}

impl ModelConfig {
    pub fn new(provider: ProviderKind, model_name: impl Into<String>) -> Self {
        Self {
            provider,
            model_name: model_name.into(),
            api_base: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            requests_per_minute: None,
        }
    }
}

fn default_models() -> IndexMap<String, ModelConfig> {
    let mut models = IndexMap::new();
    models.insert(
        "gpt-4".to_string(),
        ModelConfig {
            api_base: Some("https://api.openai.com/v1".to_string()),
            ..ModelConfig::new(ProviderKind::OpenAi, "gpt-4")
        },
    );
    models.insert(
        "claude".to_string(),
        ModelConfig {
            api_base: Some("https://api.anthropic.com".to_string()),
            ..ModelConfig::new(ProviderKind::Anthropic, "claude-3-sonnet-20240229")
        },
    );
    models.insert("llama".to_string(), ModelConfig::new(ProviderKind::Ollama, "llama3"));
    models
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub personas_path: PathBuf,
    pub instruments_path: PathBuf,
    pub responses_path: PathBuf,
    pub prompts_dir: PathBuf,
    pub template_path: Option<PathBuf>,
    pub seed: u64,
    pub checkpoint_interval: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub triple_timeout_secs: Option<u64>,
    /// One call per context unit instead of one call per item.
    pub batch_prompts: bool,
    pub conditions: Vec<Condition>,
    pub required_demographics: Vec<String>,
    pub log_level: String,
    pub models: IndexMap<String, ModelConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            personas_path: PathBuf::from("outputs/personas.json"),
            instruments_path: PathBuf::from("outputs/instruments.json"),
            responses_path: PathBuf::from("outputs/persona_responses.json"),
            prompts_dir: PathBuf::from("outputs/prompts"),
            template_path: None,
            seed: 42,
            checkpoint_interval: 10,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            triple_timeout_secs: None,
            batch_prompts: false,
            conditions: Condition::ALL.to_vec(),
            required_demographics: Vec::new(),
            log_level: "info".to_string(),
            models: default_models(),
        }
    }
}

impl Config {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn triple_timeout(&self) -> Option<Duration> {
        self.triple_timeout_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.checkpoint_interval == 0 {
            return Err(ConfigError::Invalid("checkpoint_interval must be at least 1".into()));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be at least 1".into()));
        }
        if self.conditions.is_empty() {
            return Err(ConfigError::Invalid("conditions must not be empty".into()));
        }
        for (key, model) in &self.models {
            if model.requests_per_minute == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "models.{}.requests_per_minute must be positive",
                    key
                )));
            }
            if model.model_name.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("models.{}.model_name is empty", key)));
            }
        }
        Ok(())
    }
}

/// Loads and validates `config.toml`. A missing file yields the defaults.
pub fn load_config_from_file(file_path: &Path) -> Result<Config, ConfigError> {
    let config = if file_path.exists() {
        let contents = fs::read_to_string(file_path).map_err(|source| ConfigError::Read {
            path: file_path.to_path_buf(),
            source,
        })?;
        toml::from_str::<Config>(&contents).map_err(|source| ConfigError::Parse {
            path: file_path.to_path_buf(),
            source,
        })?
    } else {
        info!(path = %file_path.display(), "Config file not found; using defaults");
        Config::default()
    };
    config.validate()?;
    Ok(config)
}

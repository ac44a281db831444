//! Uniform interface over the model backends, plus the factory that picks one.

pub mod anthropic;
pub mod ollama;
pub mod openai;
pub mod rate_limiter;
pub mod simulated;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::clock::Clock;
use crate::config::{Config, ModelConfig, ProviderKind};
use crate::error::ProviderError;

pub use anthropic::AnthropicClient;
pub use ollama::OllamaClient;
pub use openai::OpenAiClient;
pub use rate_limiter::RateLimiter;
pub use simulated::SimulatedClient;

pub const OPENAI_API_KEY_VAR: &str = "OPENAI_API_KEY";
pub const ANTHROPIC_API_KEY_VAR: &str = "ANTHROPIC_API_KEY";
pub const OLLAMA_BASE_URL_VAR: &str = "OLLAMA_BASE_URL";

const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GenerationOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl GenerationOptions {
    pub fn from_model(model: &ModelConfig) -> Self {
        Self {
            max_tokens: Some(model.max_tokens),
            temperature: Some(model.temperature),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub request_count: u64,
    pub total_tokens: u64,
    pub model_name: String,
}

/// Request/token bookkeeping shared by every client variant.
#[derive(Debug)]
pub struct UsageCounter {
    model_name: String,
    requests: AtomicU64,
    tokens: AtomicU64,
}

impl UsageCounter {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            requests: AtomicU64::new(0),
            tokens: AtomicU64::new(0),
        }
    }

    pub fn record(&self, tokens: u64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.tokens.fetch_add(tokens, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> UsageStats {
        UsageStats {
            request_count: self.requests.load(Ordering::Relaxed),
            total_tokens: self.tokens.load(Ordering::Relaxed),
            model_name: self.model_name.clone(),
        }
    }

    pub fn reset(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.tokens.store(0, Ordering::Relaxed);
    }
}

/// Rough estimate used when a backend does not report usage (~4 chars per token).
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() / 4) as u64
}

pub trait ProviderClient: Send + Sync {
    fn generate_response(&self, prompt: &str, options: &GenerationOptions) -> Result<String, ProviderError>;

    fn stats(&self) -> UsageStats;

    fn reset_stats(&self);
}

impl<T: ProviderClient + ?Sized> ProviderClient for Box<T> {
    fn generate_response(&self, prompt: &str, options: &GenerationOptions) -> Result<String, ProviderError> {
        (**self).generate_response(prompt, options)
    }

    fn stats(&self) -> UsageStats {
        (**self).stats()
    }

    fn reset_stats(&self) {
        (**self).reset_stats()
    }
}

impl<T: ProviderClient + ?Sized> ProviderClient for Arc<T> {
    fn generate_response(&self, prompt: &str, options: &GenerationOptions) -> Result<String, ProviderError> {
        (**self).generate_response(prompt, options)
    }

    fn stats(&self) -> UsageStats {
        (**self).stats()
    }

    fn reset_stats(&self) {
        (**self).reset_stats()
    }
}

pub(crate) fn http_agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(10))
        .timeout(HTTP_TIMEOUT)
        .build()
}

pub(crate) fn map_ureq_error(provider: &'static str, err: ureq::Error) -> ProviderError {
    match err {
        ureq::Error::Status(status, response) => ProviderError::Http {
            provider,
            status,
            body: response.into_string().unwrap_or_default(),
        },
        ureq::Error::Transport(transport) => ProviderError::Transport {
            provider,
            message: transport.to_string(),
        },
    }
}

/// Factory keyed on the configured model identifier.
///
/// Unknown keys fail with `UnsupportedModel`; cloud providers fail with
/// `MissingCredential` when their key variable is absent. Models with a
/// `requests_per_minute` are wrapped in a [`RateLimiter`].
pub fn create_client_with_env<F>(
    model_key: &str,
    config: &Config,
    env: F,
    clock: Arc<dyn Clock>,
) -> Result<Box<dyn ProviderClient>, ProviderError>
where
    F: Fn(&str) -> Option<String>,
{
    let model = config
        .models
        .get(model_key)
        .ok_or_else(|| ProviderError::UnsupportedModel(model_key.to_string()))?;

    let require = |provider: &'static str, var: &'static str| {
        env(var)
            .filter(|value| !value.trim().is_empty())
            .ok_or(ProviderError::MissingCredential { provider, var })
    };

    let client: Box<dyn ProviderClient> = match model.provider {
        ProviderKind::OpenAi => {
            let key = require("openai", OPENAI_API_KEY_VAR)?;
            Box::new(OpenAiClient::new(&model.model_name, key, model.api_base.clone()))
        }
        ProviderKind::Anthropic => {
            let key = require("anthropic", ANTHROPIC_API_KEY_VAR)?;
            Box::new(AnthropicClient::new(&model.model_name, key, model.api_base.clone()))
        }
        ProviderKind::Ollama => {
            let base = model.api_base.clone().or_else(|| env(OLLAMA_BASE_URL_VAR));
            Box::new(OllamaClient::new(&model.model_name, base))
        }
        ProviderKind::Simulated => Box::new(SimulatedClient::new(&model.model_name, config.seed)),
    };

    Ok(match model.requests_per_minute {
        Some(rpm) => Box::new(RateLimiter::with_clock(client, rpm, clock)),
        None => client,
    })
}

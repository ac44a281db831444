use std::path::PathBuf;

use thiserror::Error;

/// Failures raised by a provider client or by the factory that builds one.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("missing credential for {provider}: environment variable {var} is not set")]
    MissingCredential { provider: &'static str, var: &'static str },

    #[error("{provider} transport failure: {message}")]
    Transport { provider: &'static str, message: String },

    #[error("{provider} returned HTTP {status}: {body}")]
    Http {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("{provider} returned a malformed payload: {message}")]
    MalformedResponse { provider: &'static str, message: String },
}

impl ProviderError {
    /// Config failures disable the provider for the whole run.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            ProviderError::UnsupportedModel(_) | ProviderError::MissingCredential { .. }
        )
    }

    /// Authentication rejections are not worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Transport { .. } | ProviderError::MalformedResponse { .. } => true,
            ProviderError::Http { status, .. } => !matches!(status, 401 | 403),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Structural mismatch in loaded or produced JSON.
#[derive(Debug, Error)]
#[error("{context}: {message}")]
pub struct ValidationError {
    pub context: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("template references missing context key: {0}")]
    MissingContext(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("failed to read template {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level error for a pipeline stage.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json error on {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Prompt(#[from] PromptError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

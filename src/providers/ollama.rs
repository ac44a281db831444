use serde_json::{json, Value};
use tracing::debug;

use super::{estimate_tokens, http_agent, map_ureq_error, GenerationOptions, ProviderClient, UsageCounter, UsageStats};
use crate::error::ProviderError;

const PROVIDER: &str = "ollama";
const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Local inference server speaking the Ollama generate API.
pub struct OllamaClient {
    agent: ureq::Agent,
    base_url: String,
    model: String,
    usage: UsageCounter,
}

impl OllamaClient {
    pub fn new(model: &str, base_url: Option<String>) -> Self {
        Self {
            agent: http_agent(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: model.to_string(),
            usage: UsageCounter::new(model),
        }
    }

    fn request_body(&self, prompt: &str, options: &GenerationOptions) -> Value {
        let mut model_options = json!({});
        if let Some(max_tokens) = options.max_tokens {
            model_options["num_predict"] = json!(max_tokens);
        }
        if let Some(temperature) = options.temperature {
            model_options["temperature"] = json!(temperature);
        }
        json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": model_options,
        })
    }
}

pub(crate) fn parse_generate(body: &Value) -> Result<(String, Option<u64>), ProviderError> {
    let text = body
        .get("response")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::MalformedResponse {
            provider: PROVIDER,
            message: "missing response field".to_string(),
        })?;
    let prompt_tokens = body.get("prompt_eval_count").and_then(Value::as_u64);
    let eval_tokens = body.get("eval_count").and_then(Value::as_u64);
    let tokens = match (prompt_tokens, eval_tokens) {
        (None, None) => None,
        (p, e) => Some(p.unwrap_or(0) + e.unwrap_or(0)),
    };
    Ok((text.to_string(), tokens))
}

impl ProviderClient for OllamaClient {
    fn generate_response(&self, prompt: &str, options: &GenerationOptions) -> Result<String, ProviderError> {
        let url = format!("{}/api/generate", self.base_url.trim_end_matches('/'));
        debug!(model = %self.model, prompt_len = prompt.len(), "Sending local generate request");

        let response = self
            .agent
            .post(&url)
            .set("Content-Type", "application/json")
            .send_json(self.request_body(prompt, options))
            .map_err(|e| map_ureq_error(PROVIDER, e))?;
        let body: Value = response.into_json().map_err(|e| ProviderError::MalformedResponse {
            provider: PROVIDER,
            message: e.to_string(),
        })?;

        let (text, tokens) = parse_generate(&body)?;
        self.usage
            .record(tokens.unwrap_or_else(|| estimate_tokens(prompt) + estimate_tokens(&text)));
        Ok(text)
    }

    fn stats(&self) -> UsageStats {
        self.usage.snapshot()
    }

    fn reset_stats(&self) {
        self.usage.reset()
    }
}

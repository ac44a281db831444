use serde_json::{json, Value};
use tracing::debug;

use super::{estimate_tokens, http_agent, map_ureq_error, GenerationOptions, ProviderClient, UsageCounter, UsageStats};
use crate::error::ProviderError;

const PROVIDER: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Chat-completions backend.
pub struct OpenAiClient {
    agent: ureq::Agent,
    api_key: String,
    base_url: String,
    model: String,
    usage: UsageCounter,
}

impl OpenAiClient {
    pub fn new(model: &str, api_key: String, base_url: Option<String>) -> Self {
        Self {
            agent: http_agent(),
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: model.to_string(),
            usage: UsageCounter::new(model),
        }
    }

    fn request_body(&self, prompt: &str, options: &GenerationOptions) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
        });
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

/// Returns the first choice's message text and the reported total token count.
pub(crate) fn parse_chat_completion(body: &Value) -> Result<(String, Option<u64>), ProviderError> {
    let text = body
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::MalformedResponse {
            provider: PROVIDER,
            message: "missing choices[0].message.content".to_string(),
        })?;
    let tokens = body.pointer("/usage/total_tokens").and_then(Value::as_u64);
    Ok((text.to_string(), tokens))
}

impl ProviderClient for OpenAiClient {
    fn generate_response(&self, prompt: &str, options: &GenerationOptions) -> Result<String, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        debug!(model = %self.model, prompt_len = prompt.len(), "Sending chat completion request");

        let response = self
            .agent
            .post(&url)
            .set("Content-Type", "application/json")
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .send_json(self.request_body(prompt, options))
            .map_err(|e| map_ureq_error(PROVIDER, e))?;
        let body: Value = response.into_json().map_err(|e| ProviderError::MalformedResponse {
            provider: PROVIDER,
            message: e.to_string(),
        })?;

        let (text, tokens) = parse_chat_completion(&body)?;
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

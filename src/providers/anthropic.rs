use serde_json::{json, Value};
use tracing::debug;

use super::{estimate_tokens, http_agent, map_ureq_error, GenerationOptions, ProviderClient, UsageCounter, UsageStats};
use crate::error::ProviderError;

const PROVIDER: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
// the messages API rejects requests without max_tokens
const FALLBACK_MAX_TOKENS: u32 = 1000;

/// Messages-API backend.
pub struct AnthropicClient {
    agent: ureq::Agent,
    api_key: String,
    base_url: String,
    model: String,
    usage: UsageCounter,
}

impl AnthropicClient {
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
            "max_tokens": options.max_tokens.unwrap_or(FALLBACK_MAX_TOKENS),
            "messages": [{ "role": "user", "content": prompt }],
        });
        if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

/// Concatenates the text blocks of a message response; tokens = input + output.
pub(crate) fn parse_message(body: &Value) -> Result<(String, Option<u64>), ProviderError> {
    let blocks = body
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::MalformedResponse {
            provider: PROVIDER,
            message: "missing content array".to_string(),
        })?;

    let text: String = blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");
    if text.is_empty() && !blocks.is_empty() {
        return Err(ProviderError::MalformedResponse {
            provider: PROVIDER,
            message: "no text blocks in content".to_string(),
        });
    }

    let usage = body.get("usage");
    let input = usage.and_then(|u| u.get("input_tokens")).and_then(Value::as_u64);
    let output = usage.and_then(|u| u.get("output_tokens")).and_then(Value::as_u64);
    let tokens = match (input, output) {
        (None, None) => None,
        (i, o) => Some(i.unwrap_or(0) + o.unwrap_or(0)),
    };
    Ok((text, tokens))
}

impl ProviderClient for AnthropicClient {
    fn generate_response(&self, prompt: &str, options: &GenerationOptions) -> Result<String, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        debug!(model = %self.model, prompt_len = prompt.len(), "Sending messages request");

        let response = self
            .agent
            .post(&url)
            .set("Content-Type", "application/json")
            .set("x-api-key", &self.api_key)
            .set("anthropic-version", API_VERSION)
            .send_json(self.request_body(prompt, options))
            .map_err(|e| map_ureq_error(PROVIDER, e))?;
        let body: Value = response.into_json().map_err(|e| ProviderError::MalformedResponse {
            provider: PROVIDER,
            message: e.to_string(),
        })?;

        let (text, tokens) = parse_message(&body)?;
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

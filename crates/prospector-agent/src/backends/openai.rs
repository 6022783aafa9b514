use super::LlmBackend;
use crate::classifier::UpstreamFailure;
use crate::config::{LlmProvider, ProviderConfig};
use async_trait::async_trait;
use prospector_core::{Message, ProspectorError, ProspectorResult};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::time::Duration;
use tracing::debug;

/// OpenAI-compatible chat completions backend.
///
/// Works with OpenAI, OpenRouter, Groq, Ollama, and any other provider
/// that implements the OpenAI chat completions API.
pub struct OpenAiBackend {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl OpenAiBackend {
    /// Build the HTTP client for `config`.
    pub fn new(config: ProviderConfig) -> ProspectorResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ProspectorError::Http(e.to_string()))?;
        Ok(Self { config, http })
    }

    fn build_messages(&self, messages: &[Message]) -> Vec<serde_json::Value> {
        messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": m.role.as_str(),
                    "content": m.content,
                })
            })
            .collect()
    }

    fn add_provider_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json");

        // OpenRouter requires extra headers
        if self.config.provider == LlmProvider::OpenRouter {
            request
                .header("HTTP-Referer", "https://github.com/prospector-app/prospector")
                .header("X-Title", "Prospector")
        } else {
            request
        }
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    async fn invoke(&self, model: &str, messages: &[Message]) -> Result<String, UpstreamFailure> {
        let url = format!("{}/v1/chat/completions", self.config.base_url());
        let body = serde_json::json!({
            "model": model,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "messages": self.build_messages(messages),
        });

        debug!(model, url = %url, messages = messages.len(), "Sending chat completion");

        let resp = self
            .add_provider_headers(self.http.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| failure_from_transport(&e))?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let text = resp.text().await.map_err(|e| failure_from_transport(&e))?;

        if !status.is_success() {
            return Err(failure_from_response(status.as_u16(), &headers, &text));
        }

        let body: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| UpstreamFailure::new(format!("invalid response body: {e}")))?;
        parse_openai_response(&body)
    }
}

/// Extract the assistant text from a chat completions response.
pub fn parse_openai_response(body: &serde_json::Value) -> Result<String, UpstreamFailure> {
    body["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| UpstreamFailure::new(format!("response has no message content: {body}")))
}

/// Normalize a non-2xx response. Reads the OpenAI error envelope
/// (`{"error": {"message", "code", "type"}}`) when present.
pub fn failure_from_response(status: u16, headers: &HeaderMap, body: &str) -> UpstreamFailure {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let error = parsed.as_ref().map(|v| &v["error"]);

    let field = |name: &str| -> Option<String> {
        error
            .and_then(|e| e.get(name))
            .and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    };

    let message = field("message").unwrap_or_else(|| {
        if body.trim().is_empty() {
            format!("upstream returned status {status}")
        } else {
            body.to_string()
        }
    });

    UpstreamFailure {
        status: Some(status),
        message,
        code: field("code"),
        error_type: field("type"),
        retry_after: headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    }
}

fn failure_from_transport(err: &reqwest::Error) -> UpstreamFailure {
    if err.is_timeout() {
        return UpstreamFailure::timeout();
    }
    let failure = UpstreamFailure::new(err.to_string());
    match err.status() {
        Some(status) => failure.with_status(status.as_u16()),
        None => failure,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn parses_assistant_content() {
        let body = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "Hi there"}}]
        });
        assert_eq!(parse_openai_response(&body).unwrap(), "Hi there");

        let empty = serde_json::json!({"choices": []});
        assert!(parse_openai_response(&empty).is_err());
    }

    #[test]
    fn normalizes_error_envelope() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("20"));
        let body = r#"{"error":{"message":"Rate limit reached","type":"requests","code":"rate_limit_exceeded"}}"#;

        let failure = failure_from_response(429, &headers, body);
        assert_eq!(failure.status, Some(429));
        assert_eq!(failure.message, "Rate limit reached");
        assert_eq!(failure.code.as_deref(), Some("rate_limit_exceeded"));
        assert_eq!(failure.error_type.as_deref(), Some("requests"));
        assert_eq!(failure.retry_after.as_deref(), Some("20"));
    }

    #[test]
    fn non_json_error_body_becomes_message() {
        let failure = failure_from_response(502, &HeaderMap::new(), "Bad Gateway");
        assert_eq!(failure.message, "Bad Gateway");
        assert_eq!(failure.code, None);

        let failure = failure_from_response(503, &HeaderMap::new(), "");
        assert_eq!(failure.message, "upstream returned status 503");
    }
}

#![allow(clippy::unwrap_used, clippy::expect_used)]

use prospector_agent::*;
use prospector_core::Message;
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(server: &MockServer) -> ProviderConfig {
    let mut config = ProviderConfig::new(LlmProvider::Custom, "sk-test");
    config.api_base_url = Some(server.uri());
    config
}

fn completion(content: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-1",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }]
    })
}

#[tokio::test]
async fn posts_chat_completion_and_reads_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("Authorization", "Bearer sk-test"))
        .and(body_partial_json(serde_json::json!({
            "model": "llama-3.3-70b",
            "messages": [
                { "role": "system", "content": "Be brief." },
                { "role": "user", "content": "Hello" }
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("Hi there")))
        .expect(1)
        .mount(&server)
        .await;

    let backend = OpenAiBackend::new(provider(&server)).unwrap();
    let reply = backend
        .invoke(
            "llama-3.3-70b",
            &[Message::system("Be brief."), Message::user("Hello")],
        )
        .await
        .unwrap();
    assert_eq!(reply, "Hi there");
}

#[tokio::test]
async fn rate_limit_response_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "7")
                .set_body_json(serde_json::json!({
                    "error": {
                        "message": "Rate limit reached for model",
                        "type": "tokens",
                        "code": "rate_limit_exceeded"
                    }
                })),
        )
        .mount(&server)
        .await;

    let backend = OpenAiBackend::new(provider(&server)).unwrap();
    let failure = backend
        .invoke("m", &[Message::user("hi")])
        .await
        .unwrap_err();

    assert_eq!(failure.status, Some(429));
    assert_eq!(failure.message, "Rate limit reached for model");
    assert_eq!(failure.code.as_deref(), Some("rate_limit_exceeded"));
    assert_eq!(failure.retry_after.as_deref(), Some("7"));

    let classification = classify(&failure);
    assert_eq!(classification.kind, ErrorKind::RateLimit);
    assert_eq!(classification.retry_after_ms, Some(7_000));
}

#[tokio::test]
async fn context_length_error_is_non_recoverable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": {
                "message": "This model's maximum context length is 8192 tokens",
                "code": "context_length_exceeded"
            }
        })))
        .mount(&server)
        .await;

    let backend = OpenAiBackend::new(provider(&server)).unwrap();
    let failure = backend.invoke("m", &[]).await.unwrap_err();
    let classification = classify(&failure);
    assert_eq!(classification.kind, ErrorKind::ContextLength);
    assert!(!classification.recoverable());
}

#[tokio::test]
async fn malformed_success_body_is_a_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})))
        .mount(&server)
        .await;

    let backend = OpenAiBackend::new(provider(&server)).unwrap();
    let failure = backend.invoke("m", &[]).await.unwrap_err();
    assert!(failure.message.contains("no message content"));
    assert_eq!(classify(&failure).kind, ErrorKind::Unknown);
}

// ── Engine over HTTP: 503 on the first model, success on the second ──

#[tokio::test]
async fn engine_fails_over_between_http_models() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({ "model": "primary" })))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream overloaded"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({ "model": "secondary" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("from secondary")))
        .mount(&server)
        .await;

    let backend = Arc::new(OpenAiBackend::new(provider(&server)).unwrap());
    let config = FailoverConfig::new(["primary", "secondary"]).with_retry_policy(RetryPolicy {
        max_retries: 2,
        base_delay_ms: 10,
        max_delay_ms: 10,
        backoff_multiplier: 1.0,
        jitter_ratio: 0.0,
    });
    let engine = FailoverEngine::new(config, backend);

    let result = engine.invoke(&[Message::user("hi")], None).await;
    assert!(result.success);
    assert_eq!(result.content, "from secondary");
    assert_eq!(result.model_used, "secondary");
    assert_eq!(result.retry_count, 2);
    assert_eq!(result.switch_count, 1);

    let primary = &engine.stats().models[0];
    assert_eq!(primary.last_error.as_deref(), Some("server_error"));
    assert!(!primary.available);
}

//! End-to-end relay over a mocked OpenAI-compatible upstream
//!
//! The upstream stops the first generation with `finish_reason: "length"`;
//! the relay must ask for a continuation and stitch both generations into
//! one response body.

mod support;

use std::sync::Arc;

use axum::Router;
use serde_json::json;
use tower::ServiceExt;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use chat_relay::config::RelayConfig;
use chat_relay::providers::OpenAiCompatibleGenerator;
use chat_relay::registry::{ProviderRecord, ProviderRegistry};
use chat_relay::retry::RetryConfig;
use chat_relay::server::{AppState, router};

use support::{post_json_with_cookie, read_body};

fn sse(chunks: &[&str]) -> String {
    chunks.iter().map(|c| format!("data: {c}\n\n")).collect()
}

fn relay_for(upstream: &MockServer) -> Router {
    let mut registry = ProviderRegistry::new();
    registry.register(
        ProviderRecord::new("Mock", format!("{}/v1", upstream.uri()))
            .with_api_key_env("CHAT_RELAY_MOCK_KEY_UNSET")
            .with_model("mock-model", "Mock Model", 8000),
    );
    let catalog = Arc::new(registry);
    let generator =
        OpenAiCompatibleGenerator::new(catalog.clone()).with_retry(RetryConfig::disabled());
    router(AppState::new(
        RelayConfig::builder()
            .default_provider("Mock")
            .default_model("mock-model")
            .build(),
        catalog,
        Arc::new(generator),
    ))
}

const COOKIE: &str = "apiKeys=%7B%22Mock%22%3A%22sk-mock%22%7D";

#[tokio::test]
async fn cutoff_upstream_is_continued_transparently() {
    let upstream = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_string_contains("Continue your prior response"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            sse(&[
                r#"{"choices":[{"delta":{"content":"world"},"finish_reason":"stop"}]}"#,
                "[DONE]",
            ]),
            "text/event-stream",
        ))
        .with_priority(1)
        .expect(1)
        .mount(&upstream)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-mock"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            sse(&[
                r#"{"choices":[{"delta":{"content":"Hello "}}]}"#,
                r#"{"choices":[{"delta":{},"finish_reason":"length"}]}"#,
                "[DONE]",
            ]),
            "text/event-stream",
        ))
        .expect(1)
        .mount(&upstream)
        .await;

    let response = relay_for(&upstream)
        .oneshot(post_json_with_cookie(
            "/api/chat",
            json!({ "messages": [{ "role": "user", "content": "Say hello world" }] }),
            COOKIE,
        ))
        .await
        .unwrap();

    let (text, aborted) = read_body(response.into_body()).await;
    assert_eq!(text, "Hello world");
    assert!(!aborted);

    let requests = upstream.received_requests().await.unwrap();
    let second: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
    let messages = second["messages"].as_array().unwrap();
    assert_eq!(messages[messages.len() - 2]["role"], "assistant");
    assert_eq!(messages[messages.len() - 2]["content"], "Hello ");
    assert_eq!(second["stream"], true);
}

#[tokio::test]
async fn upstream_rejection_is_a_masked_500() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key sk-mock"))
        .mount(&upstream)
        .await;

    let response = relay_for(&upstream)
        .oneshot(post_json_with_cookie(
            "/api/chat",
            json!({ "messages": [{ "role": "user", "content": "hi" }] }),
            COOKIE,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), 500);
    let (text, _) = read_body(response.into_body()).await;
    assert!(!text.contains("sk-mock"));
    assert!(text.contains("Internal Server Error"));
}

#[tokio::test]
async fn missing_api_key_is_a_500_without_an_upstream_call() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let response = relay_for(&upstream)
        .oneshot(support::post_json(
            "/api/chat",
            json!({ "messages": [{ "role": "user", "content": "hi" }] }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), 500);
}

//! Endpoint handlers

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::AppState;
use super::relay::start_relay;
use crate::error::{RelayError, Result};
use crate::prompts::{ENHANCER_MAX_TOKENS, PromptId, enhancer_prompt, prepare_chat};
use crate::registry::ModelInfo;
use crate::source::{Credentials, GenerationRequest};
use crate::types::{ChatMessage, ChatRequestBody};

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| {
        tracing::debug!(error = %e, "rejecting request body");
        RelayError::bad_request("Invalid request body")
    })
}

fn text_field<'a>(value: Option<&'a Value>) -> Option<&'a str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// `model` and `provider.name` of an llmcall or enhancer body.
fn model_and_provider(body: &Value) -> Result<(String, String)> {
    let model = text_field(body.get("model"))
        .ok_or_else(|| RelayError::bad_request("Invalid or missing model"))?;
    let provider = text_field(body.get("provider").and_then(|p| p.get("name")))
        .ok_or_else(|| RelayError::bad_request("Invalid or missing provider"))?;
    Ok((model.to_string(), provider.to_string()))
}

/// Chat bodies may omit `model` and `provider`, but must not send them
/// with the wrong shape.
fn check_chat_overrides(body: &Value) -> Result<()> {
    let present = |v: Option<&Value>| v.is_some_and(|v| !v.is_null());

    if present(body.get("model")) && text_field(body.get("model")).is_none() {
        return Err(RelayError::bad_request("Invalid or missing model"));
    }
    if present(body.get("provider"))
        && text_field(body.get("provider").and_then(|p| p.get("name"))).is_none()
    {
        return Err(RelayError::bad_request("Invalid or missing provider"));
    }
    Ok(())
}

/// `POST /api/chat`
pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let body: Value = parse_body(&body)?;
    check_chat_overrides(&body)?;
    let body: ChatRequestBody = serde_json::from_value(body).map_err(|e| {
        tracing::debug!(error = %e, "rejecting chat body");
        RelayError::bad_request("Invalid request body")
    })?;
    let credentials = Credentials::from_headers(&headers)?;

    let prepared = prepare_chat(
        body.messages,
        PromptId::from_id(body.prompt_id.as_deref()),
        body.files.as_ref(),
        body.context_optimization,
    );
    let model = body
        .model
        .filter(|m| !m.is_empty())
        .or(prepared.model)
        .unwrap_or_else(|| state.config.default_model.clone());
    let provider = body
        .provider
        .map(|p| p.name)
        .filter(|p| !p.is_empty())
        .or(prepared.provider)
        .unwrap_or_else(|| state.config.default_provider.clone());

    let request = GenerationRequest {
        messages: prepared.messages,
        model,
        provider,
        max_tokens: state.config.continuation.max_tokens,
        credentials: Arc::new(credentials),
    };
    start_relay(state.chat_policy(), request).await
}

/// `POST /api/llmcall`
///
/// One-shot call with an explicit system prompt, validated against the
/// catalog. Streams when `streamOutput` is true, otherwise answers with
/// `{"response": text}`.
pub async fn llmcall(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let body: Value = parse_body(&body)?;
    let (model, provider) = model_and_provider(&body)?;

    let record = state
        .catalog
        .provider(&provider)
        .ok_or_else(|| RelayError::bad_request("Unsupported provider"))?;
    if !state.catalog.supports_model(&record.name, &model) {
        return Err(RelayError::bad_request("Unsupported model for the provider"));
    }

    let credentials = Credentials::from_headers(&headers)?;
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = body.get("system").and_then(Value::as_str) {
        messages.push(ChatMessage::system(system));
    }
    messages.push(ChatMessage::user(
        body.get("message").and_then(Value::as_str).unwrap_or_default(),
    ));

    let max_tokens = state.config.continuation.max_tokens;
    let request = GenerationRequest {
        messages,
        model,
        provider: record.name,
        max_tokens,
        credentials: Arc::new(credentials),
    };

    if body.get("streamOutput").and_then(Value::as_bool).unwrap_or(false) {
        return start_relay(state.single_segment_policy(max_tokens), request).await;
    }

    let text = tokio::time::timeout(
        state.config.segment_timeout,
        state.generator.generate_text(request),
    )
    .await
    .map_err(|_| RelayError::TimeoutError("llmcall exceeded segment timeout".into()))??;
    Ok(Json(json!({ "response": text })).into_response())
}

/// `POST /api/enhancer`
pub async fn enhancer(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let body: Value = parse_body(&body)?;
    let (model, provider) = model_and_provider(&body)?;
    let credentials = Credentials::from_headers(&headers)?;

    let message = body.get("message").and_then(Value::as_str).unwrap_or_default();
    let request = GenerationRequest {
        messages: vec![ChatMessage::user(enhancer_prompt(message))],
        model,
        provider,
        max_tokens: ENHANCER_MAX_TOKENS,
        credentials: Arc::new(credentials),
    };
    start_relay(state.single_segment_policy(ENHANCER_MAX_TOKENS), request).await
}

/// `GET /api/models`: every model of every provider, in catalog order.
pub async fn models(State(state): State<AppState>) -> Json<Vec<ModelInfo>> {
    let models = state
        .catalog
        .list_providers()
        .into_iter()
        .flat_map(|p| p.models)
        .collect();
    Json(models)
}

/// `GET /api/health`
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

//! OpenAI-compatible chat completions
//!
//! Most providers the dashboard offers speak the OpenAI wire format, so a
//! single thin client covers them: `POST {base_url}/chat/completions` with
//! `stream: true`, read back as server-sent events.

use std::sync::Arc;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::registry::{ModelCatalog, ProviderRecord};
use crate::retry::{RetryConfig, retry_with_backoff};
use crate::source::{GenerationRequest, SourceEvent, TextGenerator, TokenSource};
use crate::types::ChatMessage;

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

/// One `data:` payload of the completion stream.
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<StreamUsage>,
    error: Option<StreamErrorBody>,
}

/// Error envelope some providers send inside a `200` stream.
#[derive(Debug, Deserialize)]
struct StreamErrorBody {
    message: Option<String>,
    code: Option<serde_json::Value>,
}

impl StreamErrorBody {
    fn into_error(self) -> RelayError {
        let message = self.message.unwrap_or_else(|| "Unknown error".to_string());
        match self.code.as_ref().and_then(serde_json::Value::as_u64) {
            Some(status) => match u16::try_from(status) {
                Ok(status) => RelayError::api_error(status, message),
                Err(_) => RelayError::StreamError(format!("upstream error: {message}")),
            },
            None => RelayError::StreamError(format!("upstream error: {message}")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    completion_tokens: Option<u64>,
}

/// Where a resolved request goes and with which key.
#[derive(Debug)]
struct Target {
    url: String,
    api_key: Option<SecretString>,
}

/// [`TextGenerator`] for providers exposing the OpenAI chat completions API.
#[derive(Clone)]
pub struct OpenAiCompatibleGenerator {
    http: reqwest::Client,
    catalog: Arc<dyn ModelCatalog>,
    retry: RetryConfig,
}

impl OpenAiCompatibleGenerator {
    pub fn new(catalog: Arc<dyn ModelCatalog>) -> Self {
        Self {
            http: reqwest::Client::new(),
            catalog,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn target(&self, request: &GenerationRequest) -> Result<Target> {
        let record = self.catalog.provider(&request.provider).ok_or_else(|| {
            RelayError::UpstreamInvocation(format!("unknown provider {}", request.provider))
        })?;
        let credentials = &request.credentials;

        if credentials
            .provider_settings
            .get(&record.name)
            .and_then(|s| s.enabled)
            == Some(false)
        {
            return Err(RelayError::UpstreamInvocation(format!(
                "provider {} is disabled",
                record.name
            )));
        }

        let base_url = credentials
            .base_url(&record.name)
            .unwrap_or(&record.base_url)
            .trim_end_matches('/');
        let api_key = credentials
            .api_key(&record.name)
            .cloned()
            .or_else(|| server_key(&record));

        if api_key.is_none() && record.api_key_env.is_some() {
            return Err(RelayError::UpstreamInvocation(format!(
                "no API key configured for {}",
                record.name
            )));
        }

        Ok(Target {
            url: format!("{base_url}/chat/completions"),
            api_key,
        })
    }

    async fn open(&self, target: &Target, request: &GenerationRequest) -> Result<reqwest::Response> {
        let body = CompletionRequest {
            model: &request.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
        };

        let mut builder = self.http.post(&target.url).json(&body);
        if let Some(key) = &target.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RelayError::api_error(status.as_u16(), message));
        }
        Ok(response)
    }
}

fn server_key(record: &ProviderRecord) -> Option<SecretString> {
    let var = record.api_key_env.as_deref()?;
    std::env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

#[async_trait]
impl TextGenerator for OpenAiCompatibleGenerator {
    async fn stream_text(&self, request: GenerationRequest) -> Result<TokenSource> {
        let target = self.target(&request)?;
        tracing::debug!(
            provider = %request.provider,
            model = %request.model,
            max_tokens = request.max_tokens,
            messages = request.messages.len(),
            "opening upstream stream"
        );

        let response = retry_with_backoff(self.retry, || self.open(&target, &request)).await?;
        Ok(completion_events(response))
    }
}

/// Translate the SSE body into source events.
///
/// `finish_reason: "length"` is a cutoff; any other reason, `[DONE]` or the
/// body simply ending is a completion. An `error` object in a payload ends
/// the source with that error. The terminal marker is held back until
/// the body ends so that a trailing usage chunk is still accounted for.
fn completion_events(response: reqwest::Response) -> TokenSource {
    let mut events = response.bytes_stream().eventsource();

    let s = async_stream::stream! {
        let mut finish_reason: Option<String> = None;
        let mut reported_tokens: Option<u64> = None;
        let mut deltas: u64 = 0;

        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    yield Err(RelayError::StreamError(format!("SSE parsing error: {e}")));
                    return;
                }
            };

            let data = event.data.trim();
            if data == "[DONE]" {
                break;
            }
            if data.is_empty() {
                continue;
            }

            let chunk: StreamChunk = match serde_json::from_str(data) {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(RelayError::ParseError(format!("invalid stream chunk: {e}")));
                    return;
                }
            };

            if let Some(error) = chunk.error {
                let error = error.into_error();
                tracing::warn!(error = %error, "upstream reported an error mid-stream");
                yield Err(error);
                return;
            }
            if let Some(tokens) = chunk.usage.and_then(|u| u.completion_tokens) {
                reported_tokens = Some(tokens);
            }
            for choice in chunk.choices {
                if let Some(text) = choice.delta.and_then(|d| d.content) {
                    if !text.is_empty() {
                        deltas += 1;
                        yield Ok(SourceEvent::delta(text));
                    }
                }
                if choice.finish_reason.is_some() {
                    finish_reason = choice.finish_reason;
                }
            }
        }

        if finish_reason.as_deref() == Some("length") {
            yield Ok(SourceEvent::cutoff(reported_tokens.unwrap_or(deltas)));
        } else {
            yield Ok(SourceEvent::completed());
        }
    };
    Box::pin(s)
}

//! Token sources
//!
//! A token source is one logical upstream generation call: a lazy stream of
//! text deltas followed by exactly one terminal marker. Generators produce
//! token sources; the switchable stream consumes them.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use secrecy::SecretString;
use serde::Deserialize;
use tokio::time::Instant;

use crate::error::{RelayError, Result};
use crate::types::{ChatMessage, Usage};

/// How a token source ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Natural end of generation
    Completed,
    /// Generation stopped at a length boundary and may be continued
    Cutoff { usage: Usage },
}

/// Item produced by a token source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// Incremental text and the number of tokens it accounts for
    Delta { text: String, tokens: u64 },
    /// Terminal marker; nothing follows it
    End(Termination),
}

impl SourceEvent {
    /// A delta counting as a single token, the granularity streaming APIs report.
    pub fn delta(text: impl Into<String>) -> Self {
        Self::Delta {
            text: text.into(),
            tokens: 1,
        }
    }

    pub fn completed() -> Self {
        Self::End(Termination::Completed)
    }

    pub fn cutoff(completion_tokens: u64) -> Self {
        Self::End(Termination::Cutoff {
            usage: Usage::new(completion_tokens),
        })
    }
}

/// Token Source - a pinned, boxed stream of [`SourceEvent`]s.
pub type TokenSource = Pin<Box<dyn Stream<Item = Result<SourceEvent>> + Send>>;

/// Per-provider settings stored by the dashboard in the `providers` cookie.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSetting {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub base_url: Option<String>,
}

/// Credentials decoded once at the request boundary.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_keys: HashMap<String, SecretString>,
    pub provider_settings: HashMap<String, ProviderSetting>,
}

impl Credentials {
    pub fn api_key(&self, provider: &str) -> Option<&SecretString> {
        self.api_keys.get(provider)
    }

    pub fn base_url(&self, provider: &str) -> Option<&str> {
        self.provider_settings
            .get(provider)
            .and_then(|s| s.base_url.as_deref())
            .filter(|url| !url.trim().is_empty())
    }
}

/// Everything a generator needs to start one segment.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub provider: String,
    pub max_tokens: u32,
    pub credentials: Arc<Credentials>,
}

/// Upstream text generation.
///
/// Implementations start the upstream call in `stream_text` and return once
/// the provider accepted it; the returned source yields the body lazily.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn stream_text(&self, request: GenerationRequest) -> Result<TokenSource>;

    /// Non-streaming generation. The default drains `stream_text`.
    async fn generate_text(&self, request: GenerationRequest) -> Result<String> {
        let mut source = self.stream_text(request).await?;
        let mut text = String::new();
        while let Some(event) = source.next().await {
            match event? {
                SourceEvent::Delta { text: delta, .. } => text.push_str(&delta),
                SourceEvent::End(_) => break,
            }
        }
        Ok(text)
    }
}

/// Bound a source by an absolute deadline.
///
/// The deadline is fixed by the caller, so time spent before the first
/// poll counts against it. When it passes before the source ends, a single
/// `TimeoutError` is yielded and the source is dropped.
pub fn with_deadline(mut source: TokenSource, deadline: Instant) -> TokenSource {
    let s = async_stream::stream! {
        loop {
            match tokio::time::timeout_at(deadline, source.next()).await {
                Ok(Some(item)) => yield item,
                Ok(None) => break,
                Err(_) => {
                    yield Err(RelayError::TimeoutError("segment deadline exceeded".into()));
                    break;
                }
            }
        }
    };
    Box::pin(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::time::Duration;

    struct Scripted;

    #[async_trait]
    impl TextGenerator for Scripted {
        async fn stream_text(&self, _request: GenerationRequest) -> Result<TokenSource> {
            Ok(Box::pin(stream::iter(vec![
                Ok(SourceEvent::delta("Hello ")),
                Ok(SourceEvent::delta("world")),
                Ok(SourceEvent::completed()),
            ])))
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            messages: vec![ChatMessage::user("hi")],
            model: "m".into(),
            provider: "p".into(),
            max_tokens: 16,
            credentials: Arc::default(),
        }
    }

    #[tokio::test]
    async fn generate_text_drains_stream() {
        let text = Scripted.generate_text(request()).await.unwrap();
        assert_eq!(text, "Hello world");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_turns_stall_into_timeout() {
        let stalled: TokenSource = Box::pin(
            stream::iter(vec![Ok(SourceEvent::delta("partial"))]).chain(stream::pending()),
        );
        let deadline = Instant::now() + Duration::from_secs(5);
        let items: Vec<_> = with_deadline(stalled, deadline).collect().await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Ok(SourceEvent::delta("partial")));
        assert!(matches!(items[1], Err(RelayError::TimeoutError(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_counts_time_before_first_poll() {
        let slow: TokenSource = Box::pin(async_stream::stream! {
            tokio::time::sleep(Duration::from_secs(3)).await;
            yield Ok::<_, RelayError>(SourceEvent::delta("late"));
            yield Ok(SourceEvent::completed());
        });
        let bounded = with_deadline(slow, Instant::now() + Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(3)).await;
        let items: Vec<_> = bounded.collect().await;

        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(RelayError::TimeoutError(_))));
    }

    #[test]
    fn blank_base_url_is_ignored() {
        let mut creds = Credentials::default();
        creds.provider_settings.insert(
            "Ollama".into(),
            ProviderSetting {
                enabled: Some(true),
                base_url: Some("  ".into()),
            },
        );
        assert_eq!(creds.base_url("Ollama"), None);
    }
}

//! Shared fixtures for the relay integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, header};
use futures::stream;
use http_body_util::BodyExt;

use chat_relay::config::RelayConfig;
use chat_relay::error::{RelayError, Result};
use chat_relay::registry::ProviderRegistry;
use chat_relay::server::{AppState, router};
use chat_relay::source::{GenerationRequest, SourceEvent, TextGenerator, TokenSource};

/// Generator that hands out prepared sources in order and records every request.
#[derive(Default)]
pub struct ScriptedGenerator {
    sources: Mutex<VecDeque<Result<TokenSource>>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new(sources: Vec<Result<TokenSource>>) -> Arc<Self> {
        Arc::new(Self {
            sources: Mutex::new(sources.into()),
            requests: Mutex::default(),
        })
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn stream_text(&self, request: GenerationRequest) -> Result<TokenSource> {
        self.requests.lock().unwrap().push(request);
        self.sources
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(RelayError::InternalError("script exhausted".into())))
    }
}

/// A source replaying `events`.
pub fn source(events: Vec<SourceEvent>) -> Result<TokenSource> {
    Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
}

/// A source that yields `events` and then never ends. `dropped` flips once
/// the source is released.
pub fn hanging_source(events: Vec<SourceEvent>, dropped: Arc<AtomicBool>) -> Result<TokenSource> {
    struct Guard(Arc<AtomicBool>);
    impl Drop for Guard {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    let guard = Guard(dropped);
    Ok(Box::pin(async_stream::stream! {
        let _guard = guard;
        for event in events {
            yield Ok::<_, RelayError>(event);
        }
        futures::future::pending::<()>().await;
    }))
}

pub fn app_with(generator: Arc<dyn TextGenerator>, config: RelayConfig) -> Router {
    let catalog = Arc::new(ProviderRegistry::with_builtin_providers());
    router(AppState::new(config, catalog, generator))
}

pub fn app(generator: Arc<dyn TextGenerator>) -> Router {
    app_with(generator, RelayConfig::default())
}

pub fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn post_json_with_cookie(uri: &str, body: serde_json::Value, cookie: &str) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::COOKIE, cookie)
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Read a body to its end. Returns the text received and whether the body
/// was aborted with an error.
pub async fn read_body(mut body: Body) -> (String, bool) {
    let mut text = String::new();
    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                if let Ok(data) = frame.into_data() {
                    text.push_str(std::str::from_utf8(&data).unwrap());
                }
            }
            Err(_) => return (text, true),
        }
    }
    (text, false)
}

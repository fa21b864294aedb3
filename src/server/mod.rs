//! HTTP surface of the relay
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use chat_relay::server::{AppState, router};
//!
//! let state = AppState::new(config, catalog, generator);
//! let app = router(state);
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:5173").await?;
//! axum::serve(listener, app).await?;
//! ```

pub mod handlers;
pub mod relay;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::registry::ModelCatalog;
use crate::source::TextGenerator;
use crate::streaming::continuation::{ContinuationConfig, ContinuationPolicy};

pub use relay::start_relay;

/// State shared by every request. Immutable once the server starts.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub catalog: Arc<dyn ModelCatalog>,
    pub generator: Arc<dyn TextGenerator>,
}

impl AppState {
    pub fn new(
        config: RelayConfig,
        catalog: Arc<dyn ModelCatalog>,
        generator: Arc<dyn TextGenerator>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            catalog,
            generator,
        }
    }

    /// Policy for `/api/chat`, continuing per the configured budget.
    pub fn chat_policy(&self) -> ContinuationPolicy {
        self.policy(self.config.continuation)
    }

    /// Policy that relays exactly one segment.
    pub fn single_segment_policy(&self, max_tokens: u32) -> ContinuationPolicy {
        self.policy(ContinuationConfig::single_segment(max_tokens))
    }

    fn policy(&self, config: ContinuationConfig) -> ContinuationPolicy {
        ContinuationPolicy::new(config, self.generator.clone())
            .with_segment_timeout(self.config.segment_timeout)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(handlers::chat))
        .route("/api/llmcall", post(handlers::llmcall))
        .route("/api/enhancer", post(handlers::enhancer))
        .route("/api/models", get(handlers::models))
        .route("/api/health", get(handlers::health))
        .with_state(state)
}

/// Bind the configured address and serve until Ctrl-C.
pub async fn serve(state: AppState) -> Result<()> {
    let addr = state.config.addr;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| RelayError::ConfigurationError(format!("cannot bind {addr}: {e}")))?;
    tracing::info!(%addr, "chat relay listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| RelayError::InternalError(format!("server error: {e}")))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

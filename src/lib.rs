//! # chat-relay
//!
//! Streaming chat relay for the finance dashboard. Requests are forwarded to
//! an OpenAI-compatible provider and the generated text is piped back as one
//! chunked response body.
//!
#![deny(unsafe_code)]

//! ## Continuation
//!
//! A generation that stops because it hit its token limit is continued
//! transparently: the relay asks the provider to pick up where it left off
//! and splices the new tokens into the same body. The client never sees the
//! seam. See [`streaming::SwitchableStream`] and
//! [`streaming::ContinuationPolicy`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chat_relay::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), RelayError> {
//!     let config = RelayConfig::from_env()?;
//!     let catalog: Arc<dyn ModelCatalog> = Arc::new(ProviderRegistry::with_builtin_providers());
//!     let generator = Arc::new(OpenAiCompatibleGenerator::new(catalog.clone()));
//!     serve(AppState::new(config, catalog, generator)).await
//! }
//! ```

pub mod config;
pub mod credentials;
pub mod error;
pub mod prompts;
pub mod providers;
pub mod registry;
pub mod retry;
pub mod server;
pub mod source;
pub mod streaming;
pub mod telemetry;
pub mod types;

pub use error::{RelayError, Result};

/// Commonly used items
pub mod prelude {
    pub use crate::config::RelayConfig;
    pub use crate::error::{RelayError, Result};
    pub use crate::providers::OpenAiCompatibleGenerator;
    pub use crate::registry::{ModelCatalog, ModelInfo, ProviderRecord, ProviderRegistry};
    pub use crate::server::{AppState, router, serve};
    pub use crate::source::{
        Credentials, GenerationRequest, SourceEvent, TextGenerator, TokenSource,
    };
    pub use crate::streaming::{
        ContinuationConfig, ContinuationPolicy, CumulativeUsage, SwitchableStream,
    };
    pub use crate::types::{ChatMessage, MessageRole};
}

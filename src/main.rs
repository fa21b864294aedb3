use std::sync::Arc;

use chat_relay::config::RelayConfig;
use chat_relay::providers::OpenAiCompatibleGenerator;
use chat_relay::registry::{ModelCatalog, ProviderRegistry};
use chat_relay::server::{AppState, serve};
use chat_relay::telemetry::init_subscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = RelayConfig::from_env()?;
    let _guard = init_subscriber(config.telemetry.clone())?;

    let catalog: Arc<dyn ModelCatalog> = Arc::new(ProviderRegistry::with_builtin_providers());
    let generator = Arc::new(OpenAiCompatibleGenerator::new(catalog.clone()));

    tracing::info!(
        max_segments = config.continuation.max_segments,
        max_tokens = config.continuation.max_tokens,
        segment_timeout_secs = config.segment_timeout.as_secs(),
        default_provider = %config.default_provider,
        default_model = %config.default_model,
        "starting chat relay"
    );

    serve(AppState::new(config, catalog, generator)).await?;
    Ok(())
}

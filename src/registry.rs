//! Provider and model registry
//!
//! Requests are validated against a [`ModelCatalog`]; the generator also uses
//! it to find a provider's default base URL and API key variable.

use serde::Serialize;

/// A model offered by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    /// Identifier sent upstream
    pub id: String,
    /// Display name
    pub name: String,
    /// Name of the owning provider
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Largest completion budget the model accepts
    pub max_token_allowed: u32,
}

/// Unified provider record maintained by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRecord {
    pub name: String,
    /// OpenAI-compatible API root, e.g. `https://api.openai.com/v1`
    pub base_url: String,
    /// Environment variable holding a server-side key, if the provider needs one
    pub api_key_env: Option<String>,
    pub aliases: Vec<String>,
    pub models: Vec<ModelInfo>,
}

impl ProviderRecord {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key_env: None,
            aliases: vec![],
            models: vec![],
        }
    }

    pub fn with_api_key_env(mut self, var: impl Into<String>) -> Self {
        self.api_key_env = Some(var.into());
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn with_model(mut self, id: &str, name: &str, max_token_allowed: u32) -> Self {
        self.models.push(ModelInfo {
            id: id.to_string(),
            name: name.to_string(),
            provider: self.name.clone(),
            description: None,
            max_token_allowed,
        });
        self
    }

    fn answers_to(&self, name: &str) -> bool {
        self.name == name || self.aliases.iter().any(|a| a == name)
    }
}

/// Read access to the supported providers and their models.
pub trait ModelCatalog: Send + Sync {
    fn list_providers(&self) -> Vec<ProviderRecord>;

    /// Models of `provider`; empty when the provider is unknown.
    fn list_models(&self, provider: &str) -> Vec<ModelInfo>;

    fn provider(&self, name: &str) -> Option<ProviderRecord> {
        self.list_providers()
            .into_iter()
            .find(|p| p.answers_to(name))
    }

    fn supports_model(&self, provider: &str, model: &str) -> bool {
        self.list_models(provider).iter().any(|m| m.id == model)
    }
}

/// In-memory registry, in registration order.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<ProviderRecord>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a record, replacing any provider with the same name.
    pub fn register(&mut self, record: ProviderRecord) {
        self.providers.retain(|p| p.name != record.name);
        self.providers.push(record);
    }

    /// Resolve a provider record by name or alias
    pub fn resolve(&self, name_or_alias: &str) -> Option<&ProviderRecord> {
        self.providers.iter().find(|p| p.answers_to(name_or_alias))
    }

    /// Registry with the OpenAI-compatible providers the dashboard offers.
    pub fn with_builtin_providers() -> Self {
        let mut registry = Self::new();
        registry.register(
            ProviderRecord::new("OpenAI", "https://api.openai.com/v1")
                .with_api_key_env("OPENAI_API_KEY")
                .with_alias("openai")
                .with_model("gpt-4o", "GPT-4o", 8000)
                .with_model("gpt-4o-mini", "GPT-4o Mini", 8000)
                .with_model("gpt-4-turbo", "GPT-4 Turbo", 8000)
                .with_model("gpt-3.5-turbo", "GPT-3.5 Turbo", 4096),
        );
        registry.register(
            ProviderRecord::new("Groq", "https://api.groq.com/openai/v1")
                .with_api_key_env("GROQ_API_KEY")
                .with_alias("groq")
                .with_model("llama-3.3-70b-versatile", "Llama 3.3 70B Versatile", 8000)
                .with_model("llama-3.1-8b-instant", "Llama 3.1 8B Instant", 8000),
        );
        registry.register(
            ProviderRecord::new("Deepseek", "https://api.deepseek.com/v1")
                .with_api_key_env("DEEPSEEK_API_KEY")
                .with_alias("deepseek")
                .with_model("deepseek-chat", "Deepseek Chat", 8000)
                .with_model("deepseek-reasoner", "Deepseek Reasoner", 8000),
        );
        registry.register(
            ProviderRecord::new("xAI", "https://api.x.ai/v1")
                .with_api_key_env("XAI_API_KEY")
                .with_alias("xai")
                .with_model("grok-beta", "xAI Grok Beta", 8000),
        );
        registry.register(
            ProviderRecord::new("Mistral", "https://api.mistral.ai/v1")
                .with_api_key_env("MISTRAL_API_KEY")
                .with_alias("mistral")
                .with_model("mistral-large-latest", "Mistral Large Latest", 8000)
                .with_model("codestral-latest", "Codestral", 8000),
        );
        registry.register(
            ProviderRecord::new("OpenRouter", "https://openrouter.ai/api/v1")
                .with_api_key_env("OPEN_ROUTER_API_KEY")
                .with_alias("openrouter")
                .with_model("anthropic/claude-3.5-sonnet", "Claude 3.5 Sonnet (OpenRouter)", 8000)
                .with_model("google/gemini-flash-1.5", "Gemini Flash 1.5 (OpenRouter)", 8000),
        );
        registry.register(
            ProviderRecord::new("Together", "https://api.together.xyz/v1")
                .with_api_key_env("TOGETHER_API_KEY")
                .with_alias("together")
                .with_model(
                    "meta-llama/Llama-3.3-70B-Instruct-Turbo",
                    "Llama 3.3 70B Instruct Turbo",
                    8000,
                ),
        );
        registry.register(
            ProviderRecord::new("Ollama", "http://127.0.0.1:11434/v1")
                .with_alias("ollama")
                .with_model("llama3.2", "Llama 3.2", 8000)
                .with_model("qwen2.5-coder", "Qwen 2.5 Coder", 8000),
        );
        registry
    }
}

impl ModelCatalog for ProviderRegistry {
    fn list_providers(&self) -> Vec<ProviderRecord> {
        self.providers.clone()
    }

    fn list_models(&self, provider: &str) -> Vec<ModelInfo> {
        self.resolve(provider)
            .map(|p| p.models.clone())
            .unwrap_or_default()
    }

    fn provider(&self, name: &str) -> Option<ProviderRecord> {
        self.resolve(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_resolves_names_and_aliases() {
        let registry = ProviderRegistry::with_builtin_providers();
        assert_eq!(registry.resolve("OpenAI").unwrap().name, "OpenAI");
        assert_eq!(registry.resolve("groq").unwrap().name, "Groq");
        assert!(registry.resolve("unknown-provider").is_none());
    }

    #[test]
    fn model_support_is_per_provider() {
        let registry = ProviderRegistry::with_builtin_providers();
        assert!(registry.supports_model("OpenAI", "gpt-4o-mini"));
        assert!(!registry.supports_model("Groq", "gpt-4o-mini"));
        assert!(registry.list_models("unknown-provider").is_empty());
    }

    #[test]
    fn register_replaces_same_name() {
        let mut registry = ProviderRegistry::new();
        registry.register(ProviderRecord::new("Local", "http://a").with_model("m1", "M1", 100));
        registry.register(ProviderRecord::new("Local", "http://b"));

        let providers = registry.list_providers();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].base_url, "http://b");
        assert!(registry.list_models("Local").is_empty());
    }

    #[test]
    fn models_serialize_for_the_dashboard() {
        let registry = ProviderRegistry::with_builtin_providers();
        let model = &registry.list_models("xAI")[0];
        let json = serde_json::to_value(model).unwrap();
        assert_eq!(json["id"], "grok-beta");
        assert_eq!(json["provider"], "xAI");
        assert_eq!(json["maxTokenAllowed"], 8000);
        assert!(json.get("description").is_none());
    }
}

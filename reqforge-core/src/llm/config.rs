//! Provider registry configuration
//!
//! One [`ProviderConfig`] per backend plus the chain-level settings
//! (default provider, fallback order). Loaded once at startup from the
//! environment; immutable afterwards.

use serde::{Deserialize, Serialize};

/// Wire protocol spoken by a provider endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    OpenaiChat,
    AnthropicMessages,
    GoogleGenerate,
    OllamaGenerate,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::OpenaiChat => "openai-chat",
            Protocol::AnthropicMessages => "anthropic-messages",
            Protocol::GoogleGenerate => "google-generate",
            Protocol::OllamaGenerate => "ollama-generate",
        }
    }
}

/// Registry entry for one configured backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Identifier used for routing, fallback order and reporting
    pub id: String,
    pub protocol: Protocol,
    /// Base URL; adapters append their protocol-specific path
    pub endpoint: String,
    /// API key, or the sentinel "ollama" for keyless openai-chat endpoints
    pub credential: String,
    pub default_model: String,
    pub enabled: bool,
}

impl ProviderConfig {
    pub fn new(
        id: impl Into<String>,
        protocol: Protocol,
        endpoint: impl Into<String>,
        credential: impl Into<String>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            protocol,
            endpoint: endpoint.into(),
            credential: credential.into(),
            default_model: default_model.into(),
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Full registry configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Provider used when a call names none
    pub default_provider: String,
    /// Providers tried first, in order, during fallback
    pub fallback_order: Vec<String>,
    pub providers: Vec<ProviderConfig>,
}

impl RegistryConfig {
    /// Build the registry configuration from the process environment.
    ///
    /// A provider is registered only when its API key (or the Ollama URL)
    /// is present; `OLLAMA_MODELS` yields one entry per listed model so
    /// the multi-model comparator can iterate them independently.
    pub fn from_env() -> Self {
        let mut providers = Vec::new();

        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            let url = std::env::var("OPENAI_API_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
            let model =
                std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
            providers.push(ProviderConfig::new("openai", Protocol::OpenaiChat, url, key, model));
        }

        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            let url = std::env::var("ANTHROPIC_API_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com".to_string());
            let model = std::env::var("ANTHROPIC_MODEL")
                .unwrap_or_else(|_| "claude-3-5-sonnet-20241022".to_string());
            providers.push(ProviderConfig::new(
                "anthropic",
                Protocol::AnthropicMessages,
                url,
                key,
                model,
            ));
        }

        if let Ok(key) = std::env::var("GOOGLE_API_KEY") {
            let url = std::env::var("GOOGLE_API_URL")
                .unwrap_or_else(|_| "https://generativelanguage.googleapis.com/v1beta".to_string());
            let model =
                std::env::var("GOOGLE_MODEL").unwrap_or_else(|_| "gemini-1.5-flash".to_string());
            providers.push(ProviderConfig::new(
                "google",
                Protocol::GoogleGenerate,
                url,
                key,
                model,
            ));
        }

        if let Ok(url) = std::env::var("OLLAMA_API_URL") {
            let models = std::env::var("OLLAMA_MODELS")
                .unwrap_or_else(|_| "llama3.2".to_string());
            for model in models.split(',').map(str::trim).filter(|m| !m.is_empty()) {
                providers.push(ProviderConfig::new(
                    format!("ollama-{}", model.replace([':', '/'], "-")),
                    Protocol::OllamaGenerate,
                    url.clone(),
                    "ollama",
                    model,
                ));
            }
        }

        let default_provider = std::env::var("DEFAULT_LLM_PROVIDER")
            .ok()
            .or_else(|| providers.first().map(|p| p.id.clone()))
            .unwrap_or_default();

        let fallback_order = std::env::var("LLM_FALLBACK_ORDER")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        Self { providers, default_provider, fallback_order }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_round_trips_through_serde() {
        let json = serde_json::to_string(&Protocol::AnthropicMessages).unwrap();
        assert_eq!(json, "\"anthropic-messages\"");
        let back: Protocol = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Protocol::AnthropicMessages);
    }

    #[test]
    fn disabled_builder_flips_flag() {
        let config = ProviderConfig::new(
            "openai",
            Protocol::OpenaiChat,
            "https://api.openai.com/v1",
            "sk-test",
            "gpt-4o-mini",
        )
        .disabled();
        assert!(!config.enabled);
    }
}

//! Provider registry with routing and fallback
//!
//! The registry presents one call surface over every configured backend.
//! Routing picks the named provider (or the configured default); fallback
//! walks `fallback_order` first, then any remaining enabled providers in
//! registration order, and fails only once every candidate has failed.

use super::adapters::{ChatBackend, HttpBackend};
use super::config::{ProviderConfig, RegistryConfig};
use super::errors::{ProviderError, ProviderResult};
use super::types::{CallOptions, CallOutcome, ChatRequest};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default sampling temperature when the caller leaves it unset
const DEFAULT_TEMPERATURE: f32 = 0.2;

/// Deadline applied when the caller sets none
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Canary prompt used by [`ProviderRegistry::probe`]
const PROBE_PROMPT: &str = "Reply with the single word: ok";

struct ProviderEntry {
    config: ProviderConfig,
    backend: Arc<dyn ChatBackend>,
}

/// Process-wide index of configured LLM backends
pub struct ProviderRegistry {
    entries: Vec<ProviderEntry>,
    by_id: HashMap<String, usize>,
    default_provider: String,
    fallback_order: Vec<String>,
}

impl ProviderRegistry {
    /// Build a registry from configuration, wiring an HTTP backend per entry.
    pub fn new(config: RegistryConfig) -> Self {
        let client = Client::new();
        let mut registry = Self {
            entries: Vec::new(),
            by_id: HashMap::new(),
            default_provider: config.default_provider,
            fallback_order: config.fallback_order,
        };
        for provider in config.providers {
            let backend = Arc::new(HttpBackend::new(client.clone(), &provider));
            registry.register(provider, backend);
        }
        info!(
            providers = registry.entries.len(),
            default = %registry.default_provider,
            "provider registry ready"
        );
        registry
    }

    /// Register a provider with an explicit backend.
    ///
    /// Production wiring goes through [`ProviderRegistry::new`]; this is
    /// the seam integration tests use to inject scripted backends.
    pub fn register(&mut self, config: ProviderConfig, backend: Arc<dyn ChatBackend>) {
        let id = config.id.clone();
        if self.default_provider.is_empty() {
            self.default_provider = id.clone();
        }
        self.by_id.insert(id, self.entries.len());
        self.entries.push(ProviderEntry { config, backend });
    }

    /// Enabled providers, in registration order.
    pub fn list_available(&self) -> Vec<&ProviderConfig> {
        self.entries.iter().map(|e| &e.config).filter(|c| c.enabled).collect()
    }

    /// Enabled providers speaking the given protocol, in registration order.
    pub fn providers_for_protocol(&self, protocol: super::config::Protocol) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.config.enabled && e.config.protocol == protocol)
            .map(|e| e.config.id.clone())
            .collect()
    }

    /// Route one call: the named provider, or the default, with fallback
    /// unless the caller disabled it.
    pub async fn call(
        &self,
        prompt: &str,
        system: Option<&str>,
        options: &CallOptions,
    ) -> ProviderResult<CallOutcome> {
        let primary = options.provider.as_deref().unwrap_or(&self.default_provider);

        match self.call_provider(primary, prompt, system, options).await {
            Ok(outcome) => Ok(outcome),
            Err(err) if options.use_fallback => {
                warn!(provider = primary, error = %err, "primary provider failed, falling back");
                let mut options = options.clone();
                options.exclude_providers.insert(primary.to_string());
                match self.call_with_fallback(prompt, system, &options).await {
                    Ok(outcome) => Ok(outcome),
                    // The chain never saw the primary; fold its failure back in.
                    Err(ProviderError::NoProviders) => Err(err),
                    Err(chain_err) => Err(chain_err),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Try providers in fallback order, then remaining enabled providers,
    /// returning the first success together with the provider that produced
    /// it. Fails only after every candidate failed, reporting the last error.
    pub async fn call_with_fallback(
        &self,
        prompt: &str,
        system: Option<&str>,
        options: &CallOptions,
    ) -> ProviderResult<CallOutcome> {
        let candidates = self.fallback_candidates(options);
        if candidates.is_empty() {
            return Err(ProviderError::NoProviders);
        }

        let mut last_error = None;
        let attempted = candidates.len();
        for id in candidates {
            match self.call_provider(&id, prompt, system, options).await {
                Ok(outcome) => {
                    debug!(provider = %id, "fallback chain succeeded");
                    return Ok(outcome);
                }
                Err(err) => {
                    warn!(provider = %id, error = %err, "fallback candidate failed");
                    last_error = Some(err);
                }
            }
        }

        Err(ProviderError::Exhausted {
            attempted,
            last: Box::new(last_error.expect("at least one candidate was attempted")),
        })
    }

    /// Send the canary prompt; true iff the response contains an
    /// affirmative token.
    pub async fn probe(&self, provider_id: &str) -> bool {
        let options = CallOptions::default()
            .with_provider(provider_id)
            .with_max_tokens(8)
            .with_timeout(Duration::from_secs(10))
            .no_fallback();
        match self.call_provider(provider_id, PROBE_PROMPT, None, &options).await {
            Ok(outcome) => outcome.text.to_lowercase().contains("ok"),
            Err(err) => {
                debug!(provider = provider_id, error = %err, "probe failed");
                false
            }
        }
    }

    fn fallback_candidates(&self, options: &CallOptions) -> Vec<String> {
        let eligible = |id: &str| {
            !options.exclude_providers.contains(id)
                && self
                    .by_id
                    .get(id)
                    .map(|&i| self.entries[i].config.enabled)
                    .unwrap_or(false)
        };

        let mut candidates: Vec<String> = self
            .fallback_order
            .iter()
            .filter(|id| eligible(id))
            .cloned()
            .collect();
        for entry in &self.entries {
            let id = &entry.config.id;
            if eligible(id) && !candidates.contains(id) {
                candidates.push(id.clone());
            }
        }
        candidates
    }

    async fn call_provider(
        &self,
        provider_id: &str,
        prompt: &str,
        system: Option<&str>,
        options: &CallOptions,
    ) -> ProviderResult<CallOutcome> {
        let entry = self
            .by_id
            .get(provider_id)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| ProviderError::Unknown(provider_id.to_string()))?;
        if !entry.config.enabled {
            return Err(ProviderError::Disabled(provider_id.to_string()));
        }

        let request = ChatRequest {
            prompt: prompt.to_string(),
            system: system.map(str::to_string),
            model: entry.config.default_model.clone(),
            temperature: options.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: options.max_tokens,
            timeout: options.timeout.unwrap_or(DEFAULT_TIMEOUT),
        };

        let text = entry.backend.complete(&request).await?;
        Ok(CallOutcome { text, provider: provider_id.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::config::Protocol;
    use crate::llm::testing::ScriptedBackend;

    fn provider(id: &str) -> ProviderConfig {
        ProviderConfig::new(id, Protocol::OpenaiChat, "http://test", "key", "model")
    }

    fn registry_with(
        entries: Vec<(ProviderConfig, Arc<dyn ChatBackend>)>,
        default_provider: &str,
        fallback_order: &[&str],
    ) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new(RegistryConfig {
            providers: Vec::new(),
            default_provider: default_provider.to_string(),
            fallback_order: fallback_order.iter().map(|s| s.to_string()).collect(),
        });
        for (config, backend) in entries {
            registry.register(config, backend);
        }
        registry
    }

    #[tokio::test]
    async fn call_routes_to_default_provider() {
        let registry = registry_with(
            vec![
                (provider("a"), Arc::new(ScriptedBackend::replying("from a"))),
                (provider("b"), Arc::new(ScriptedBackend::replying("from b"))),
            ],
            "b",
            &[],
        );
        let outcome = registry.call("hi", None, &CallOptions::default()).await.unwrap();
        assert_eq!(outcome.provider, "b");
        assert_eq!(outcome.text, "from b");
    }

    #[tokio::test]
    async fn fallback_walks_configured_order_then_remaining() {
        let registry = registry_with(
            vec![
                (provider("a"), Arc::new(ScriptedBackend::failing())),
                (provider("b"), Arc::new(ScriptedBackend::failing())),
                (provider("c"), Arc::new(ScriptedBackend::replying("from c"))),
            ],
            "a",
            &["b"],
        );
        // Order: b (fallback order), then a and c by registration.
        let outcome = registry
            .call_with_fallback("hi", None, &CallOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.provider, "c");
    }

    #[tokio::test]
    async fn fallback_skips_excluded_and_disabled() {
        let registry = registry_with(
            vec![
                (provider("a"), Arc::new(ScriptedBackend::replying("from a"))),
                (provider("b").disabled(), Arc::new(ScriptedBackend::replying("from b"))),
                (provider("c"), Arc::new(ScriptedBackend::replying("from c"))),
            ],
            "a",
            &[],
        );
        let options = CallOptions::default().excluding(["a"]);
        let outcome = registry.call_with_fallback("hi", None, &options).await.unwrap();
        assert_eq!(outcome.provider, "c");
    }

    #[tokio::test]
    async fn exhausted_chain_reports_last_error() {
        let registry = registry_with(
            vec![
                (provider("a"), Arc::new(ScriptedBackend::failing())),
                (provider("b"), Arc::new(ScriptedBackend::failing())),
            ],
            "a",
            &["a", "b"],
        );
        let err = registry
            .call_with_fallback("hi", None, &CallOptions::default())
            .await
            .unwrap_err();
        match err {
            ProviderError::Exhausted { attempted, .. } => assert_eq!(attempted, 2),
            other => panic!("expected Exhausted, got {other}"),
        }
    }

    #[tokio::test]
    async fn call_without_fallback_surfaces_primary_error() {
        let registry = registry_with(
            vec![
                (provider("a"), Arc::new(ScriptedBackend::failing())),
                (provider("b"), Arc::new(ScriptedBackend::replying("from b"))),
            ],
            "a",
            &[],
        );
        let err = registry
            .call("hi", None, &CallOptions::default().no_fallback())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Api { .. }));
    }

    #[test]
    fn list_available_skips_disabled_providers() {
        let registry = registry_with(
            vec![
                (provider("a"), Arc::new(ScriptedBackend::replying("x"))),
                (provider("b").disabled(), Arc::new(ScriptedBackend::replying("x"))),
            ],
            "a",
            &[],
        );
        let ids: Vec<&str> = registry.list_available().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[tokio::test]
    async fn probe_checks_for_affirmative_token() {
        let registry = registry_with(
            vec![
                (provider("yes"), Arc::new(ScriptedBackend::replying("OK, ready."))),
                (provider("no"), Arc::new(ScriptedBackend::replying("unavailable"))),
            ],
            "yes",
            &[],
        );
        assert!(registry.probe("yes").await);
        assert!(!registry.probe("no").await);
        assert!(!registry.probe("missing").await);
    }
}

//! Common types shared by the provider registry and its callers

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Options for a single registry call
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Route to this provider instead of the configured default
    pub provider: Option<String>,
    /// Sampling temperature; adapters fall back to 0.2 when unset
    pub temperature: Option<f32>,
    /// Completion token cap; provider-specific default when unset
    pub max_tokens: Option<u32>,
    /// Walk the fallback chain when the primary provider fails
    pub use_fallback: bool,
    /// Providers to skip during fallback iteration
    pub exclude_providers: HashSet<String>,
    /// Per-request deadline
    pub timeout: Option<Duration>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            provider: None,
            temperature: None,
            max_tokens: None,
            use_fallback: true,
            exclude_providers: HashSet::new(),
            timeout: None,
        }
    }
}

impl CallOptions {
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn no_fallback(mut self) -> Self {
        self.use_fallback = false;
        self
    }

    pub fn excluding<I, S>(mut self, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_providers.extend(providers.into_iter().map(Into::into));
        self
    }
}

/// A successful registry call: the response text and who produced it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallOutcome {
    pub text: String,
    pub provider: String,
}

/// Request handed to a protocol backend after routing
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub timeout: Duration,
}

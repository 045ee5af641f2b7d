//! Error types for LLM provider operations
//!
//! Providers surface two families of failures: transport-level errors
//! (retryable inside the queue) and response-shape errors (not retryable,
//! since the same request would fail the same way).

use std::time::Duration;
use thiserror::Error;

/// Main error type for provider calls
#[derive(Debug, Error)]
pub enum ProviderError {
    /// API returned a non-2xx status
    #[error("provider '{provider}' returned status {status}: {message}")]
    Api { provider: String, status: u16, message: String },

    /// Request could not be sent or the connection dropped
    #[error("network error talking to '{provider}': {message}")]
    Network { provider: String, message: String },

    /// Request exceeded its deadline
    #[error("provider '{provider}' timed out after {duration:?}")]
    Timeout { provider: String, duration: Duration },

    /// Response body did not have the expected shape
    #[error("could not parse response from '{provider}': {message}")]
    Parse { provider: String, message: String },

    /// Provider exists but is disabled in configuration
    #[error("provider '{0}' is disabled")]
    Disabled(String),

    /// Provider id is not registered
    #[error("unknown provider '{0}'")]
    Unknown(String),

    /// No candidate provider was eligible for the call
    #[error("no enabled providers available")]
    NoProviders,

    /// Every candidate in the fallback chain failed
    #[error("all {attempted} providers failed, last error: {last}")]
    Exhausted { attempted: usize, last: Box<ProviderError> },
}

impl ProviderError {
    pub fn api(provider: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::Api { provider: provider.into(), status, message: message.into() }
    }

    pub fn network(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network { provider: provider.into(), message: message.into() }
    }

    pub fn timeout(provider: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout { provider: provider.into(), duration }
    }

    pub fn parse(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse { provider: provider.into(), message: message.into() }
    }

    /// Whether the queue's retry policy should re-attempt after this error.
    ///
    /// Transport failures and non-2xx statuses are transient; a malformed
    /// response body is not, the same request would fail again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api { .. } | Self::Network { .. } | Self::Timeout { .. } => true,
            Self::Exhausted { last, .. } => last.is_retryable(),
            _ => false,
        }
    }
}

/// Result type for provider operations
pub type ProviderResult<T> = Result<T, ProviderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_retryable() {
        assert!(ProviderError::api("openai", 503, "overloaded").is_retryable());
        assert!(ProviderError::network("ollama", "connection refused").is_retryable());
        assert!(ProviderError::timeout("google", Duration::from_secs(60)).is_retryable());
    }

    #[test]
    fn parse_errors_are_not_retryable() {
        assert!(!ProviderError::parse("anthropic", "missing content[0].text").is_retryable());
        assert!(!ProviderError::Unknown("nope".into()).is_retryable());
    }

    #[test]
    fn exhausted_inherits_retryability_from_last() {
        let last = ProviderError::api("openai", 500, "boom");
        let err = ProviderError::Exhausted { attempted: 3, last: Box::new(last) };
        assert!(err.is_retryable());

        let last = ProviderError::parse("openai", "bad json");
        let err = ProviderError::Exhausted { attempted: 2, last: Box::new(last) };
        assert!(!err.is_retryable());
    }
}

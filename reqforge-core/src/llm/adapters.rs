//! Protocol adapters for the supported LLM backends
//!
//! Each protocol has a request/response codec; [`HttpBackend`] carries the
//! protocol tag and a single dispatch routine builds the request, checks
//! the status, and digs the text out of the response body. Transport and
//! non-2xx failures map to retryable errors, a missing field in an
//! otherwise well-formed body maps to a parse error.

use super::config::{Protocol, ProviderConfig};
use super::errors::{ProviderError, ProviderResult};
use super::types::ChatRequest;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::json;

/// Version header required by the Anthropic messages endpoint
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Credential sentinel that suppresses the Authorization header
const KEYLESS_CREDENTIAL: &str = "ollama";

/// Completion seam between the registry and a concrete backend.
///
/// Production uses [`HttpBackend`]; tests register scripted
/// implementations through the same trait.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> ProviderResult<String>;
}

/// HTTP backend for all four wire protocols
pub struct HttpBackend {
    client: Client,
    provider_id: String,
    protocol: Protocol,
    endpoint: String,
    credential: String,
}

impl HttpBackend {
    pub fn new(client: Client, config: &ProviderConfig) -> Self {
        Self {
            client,
            provider_id: config.id.clone(),
            protocol: config.protocol,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            credential: config.credential.clone(),
        }
    }

    async fn post_json(
        &self,
        url: String,
        body: serde_json::Value,
        request: &ChatRequest,
        with_auth: impl FnOnce(reqwest::RequestBuilder) -> reqwest::RequestBuilder,
    ) -> ProviderResult<serde_json::Value> {
        let builder = self.client.post(url).timeout(request.timeout).json(&body);
        let response = with_auth(builder).send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::timeout(&self.provider_id, request.timeout)
            } else {
                ProviderError::network(&self.provider_id, e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::api(&self.provider_id, status.as_u16(), message));
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::parse(&self.provider_id, e.to_string()))
    }

    async fn complete_openai(&self, request: &ChatRequest) -> ProviderResult<String> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(OpenaiMessage { role: "system", content: system });
        }
        messages.push(OpenaiMessage { role: "user", content: &request.prompt });

        let body = json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.temperature,
        });
        let mut body = body;
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        let url = format!("{}/chat/completions", self.endpoint);
        let keyless = self.credential == KEYLESS_CREDENTIAL;
        let credential = self.credential.clone();
        let value = self
            .post_json(url, body, request, move |builder| {
                if keyless {
                    builder
                } else {
                    builder.bearer_auth(credential)
                }
            })
            .await?;

        value
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                ProviderError::parse(&self.provider_id, "missing choices[0].message.content")
            })
    }

    async fn complete_anthropic(&self, request: &ChatRequest) -> ProviderResult<String> {
        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens.unwrap_or(4096),
            "temperature": request.temperature,
            "messages": [{"role": "user", "content": request.prompt}],
        });
        if let Some(system) = &request.system {
            body["system"] = json!(system);
        }

        let url = format!("{}/v1/messages", self.endpoint);
        let credential = self.credential.clone();
        let value = self
            .post_json(url, body, request, move |builder| {
                builder
                    .header("x-api-key", credential)
                    .header("anthropic-version", ANTHROPIC_VERSION)
            })
            .await?;

        value
            .pointer("/content/0/text")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::parse(&self.provider_id, "missing content[0].text"))
    }

    async fn complete_google(&self, request: &ChatRequest) -> ProviderResult<String> {
        let text = match &request.system {
            Some(system) => format!("{}\n\n{}", system, request.prompt),
            None => request.prompt.clone(),
        };
        let mut generation_config = json!({"temperature": request.temperature});
        if let Some(max_tokens) = request.max_tokens {
            generation_config["maxOutputTokens"] = json!(max_tokens);
        }
        let body = json!({
            "contents": [{"parts": [{"text": text}]}],
            "generationConfig": generation_config,
        });

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.endpoint, request.model, self.credential
        );
        let value = self.post_json(url, body, request, |builder| builder).await?;

        value
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                ProviderError::parse(&self.provider_id, "missing candidates[0].content.parts[0].text")
            })
    }

    async fn complete_ollama(&self, request: &ChatRequest) -> ProviderResult<String> {
        let prompt = match &request.system {
            Some(system) => format!("{}\n\n{}", system, request.prompt),
            None => request.prompt.clone(),
        };
        let body = json!({
            "model": request.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens.map(|t| t as i64).unwrap_or(-1),
            },
        });

        let url = format!("{}/api/generate", self.endpoint);
        let value = self.post_json(url, body, request, |builder| builder).await?;

        value
            .get("response")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::parse(&self.provider_id, "missing response field"))
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn complete(&self, request: &ChatRequest) -> ProviderResult<String> {
        match self.protocol {
            Protocol::OpenaiChat => self.complete_openai(request).await,
            Protocol::AnthropicMessages => self.complete_anthropic(request).await,
            Protocol::GoogleGenerate => self.complete_google(request).await,
            Protocol::OllamaGenerate => self.complete_ollama(request).await,
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenaiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

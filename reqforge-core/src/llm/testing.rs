//! Scripted chat backend for tests
//!
//! Implements the [`ChatBackend`] seam with canned replies so suites can
//! exercise routing, fallback, and the full pipeline without a network.
//! Lives outside `#[cfg(test)]` because the integration suites link it
//! from the `tests/` directory.

use super::adapters::ChatBackend;
use super::errors::{ProviderError, ProviderResult};
use super::types::ChatRequest;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// A canned backend that answers by prompt-substring rules.
#[derive(Default)]
pub struct ScriptedBackend {
    rules: Mutex<Vec<(String, String)>>,
    default_reply: Mutex<Option<String>>,
    failure: Mutex<Option<(u16, String)>>,
    /// First N calls fail even when a reply is scripted
    fail_first: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that answers every prompt with the same text.
    pub fn replying(reply: impl Into<String>) -> Self {
        let backend = Self::new();
        *backend.default_reply.lock().unwrap() = Some(reply.into());
        backend
    }

    /// Backend that fails every call with a 503.
    pub fn failing() -> Self {
        Self::failing_with(503, "service unavailable")
    }

    pub fn failing_with(status: u16, message: impl Into<String>) -> Self {
        let backend = Self::new();
        *backend.failure.lock().unwrap() = Some((status, message.into()));
        backend
    }

    /// Reply with `reply` when the prompt contains `needle`.
    ///
    /// Rules are checked in insertion order before the default reply.
    pub fn when(self, needle: impl Into<String>, reply: impl Into<String>) -> Self {
        self.rules.lock().unwrap().push((needle.into(), reply.into()));
        self
    }

    pub fn otherwise(self, reply: impl Into<String>) -> Self {
        *self.default_reply.lock().unwrap() = Some(reply.into());
        self
    }

    /// Fail the first `n` calls with a 503, then follow the script.
    pub fn fail_first(self, n: usize) -> Self {
        self.fail_first.store(n, Ordering::SeqCst);
        self
    }

    /// Prompts received so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn complete(&self, request: &ChatRequest) -> ProviderResult<String> {
        self.prompts.lock().unwrap().push(request.prompt.clone());

        if self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ProviderError::api("scripted", 503, "scripted transient failure"));
        }
        if let Some((status, message)) = self.failure.lock().unwrap().clone() {
            return Err(ProviderError::api("scripted", status, message));
        }

        let rules = self.rules.lock().unwrap();
        for (needle, reply) in rules.iter() {
            if request.prompt.contains(needle.as_str()) {
                return Ok(reply.clone());
            }
        }
        drop(rules);

        self.default_reply
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ProviderError::parse("scripted", "no scripted reply for prompt"))
    }
}

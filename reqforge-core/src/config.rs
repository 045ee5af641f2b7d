//! Pipeline configuration
//!
//! Loaded once at startup, environment first with an optional TOML
//! overlay, and immutable afterwards. A configuration that cannot name a
//! default provider refuses to start rather than limping along.

use crate::llm::RegistryConfig;
use crate::vcs::GitIdentity;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no LLM providers are configured")]
    NoProviders,

    #[error("default provider '{0}' is not among the configured providers")]
    UnknownDefaultProvider(String),
}

/// Per-stage deadlines for outbound calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTimeouts {
    /// Analysis LLM calls
    pub analysis_secs: u64,
    /// Generation LLM calls
    pub generation_secs: u64,
    /// Per-file validation and evaluation calls
    pub validation_secs: u64,
    /// Clone and push, each
    pub git_secs: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self { analysis_secs: 60, generation_secs: 120, validation_secs: 30, git_secs: 120 }
    }
}

impl StageTimeouts {
    pub fn analysis(&self) -> Duration {
        Duration::from_secs(self.analysis_secs)
    }

    pub fn generation(&self) -> Duration {
        Duration::from_secs(self.generation_secs)
    }

    pub fn validation(&self) -> Duration {
        Duration::from_secs(self.validation_secs)
    }

    pub fn git(&self) -> Duration {
        Duration::from_secs(self.git_secs)
    }
}

/// Full pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub database_url: String,
    /// Worker pool size, the queue's concurrency bound
    pub max_concurrent_tasks: usize,
    /// When set, a failing quality verdict fails the task before commit
    pub quality_gate_enforced: bool,
    pub timeouts: StageTimeouts,
    pub git: GitIdentity,
    pub registry: RegistryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_concurrent_tasks: 5,
            registry: RegistryConfig::default(),
            git: GitIdentity::default(),
            quality_gate_enforced: false,
            timeouts: StageTimeouts::default(),
        }
    }
}

impl PipelineConfig {
    /// Build from the process environment.
    pub fn from_env() -> Self {
        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite::memory:".to_string());
        let max_concurrent_tasks = std::env::var("MAX_CONCURRENT_TASKS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);
        let quality_gate_enforced = std::env::var("QUALITY_GATE_ENFORCED")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Self {
            database_url,
            max_concurrent_tasks,
            registry: RegistryConfig::from_env(),
            git: GitIdentity::from_env(),
            quality_gate_enforced,
            timeouts: StageTimeouts::default(),
        }
    }

    /// Load from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Refuse configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registry.providers.is_empty() {
            return Err(ConfigError::NoProviders);
        }
        let default = &self.registry.default_provider;
        if !default.is_empty() && !self.registry.providers.iter().any(|p| &p.id == default) {
            return Err(ConfigError::UnknownDefaultProvider(default.clone()));
        }
        Ok(())
    }
}

//! LLM provider registry
//!
//! A uniform `(prompt, system, options) -> text` call over heterogeneous
//! chat backends, with routing, a deterministic fallback chain, and a
//! liveness probe. Protocol selection is an enum tag dispatched in one
//! place; the [`adapters::ChatBackend`] trait is the seam tests use to
//! substitute scripted backends.

pub mod adapters;
pub mod config;
pub mod errors;
pub mod registry;
pub mod testing;
pub mod types;

pub use adapters::{ChatBackend, HttpBackend};
pub use config::{Protocol, ProviderConfig, RegistryConfig};
pub use errors::{ProviderError, ProviderResult};
pub use registry::ProviderRegistry;
pub use types::{CallOptions, CallOutcome, ChatRequest};

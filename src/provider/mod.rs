//! Provider catalog, capability routing, and health tracking.
//!
//! A provider is a declarative [`ProviderSpec`] plus an optional bound
//! [`ProviderBackend`] callable. The manager routes `(model, capability)`
//! pairs to a provider name, guards each provider with a circuit breaker,
//! and tracks call statistics for operator queries.

mod breaker;
mod manager;

pub use breaker::CircuitBreaker;
pub use manager::ProviderManager;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::completion::CompletionRequest;
use crate::error::ProviderError;
use crate::events::EventData;

/// Declarative description of a completion backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub name: String,
    /// Supported model identifiers; `"*"` matches any model.
    pub models: Vec<String>,
    /// Lower numbers are preferred.
    pub priority: u32,
    #[serde(default)]
    pub supports_streaming: bool,
    #[serde(default)]
    pub supports_mcp: bool,
}

impl ProviderSpec {
    pub fn supports_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == "*" || m == model)
            // claude-cli fronts the local CLI, which accepts any claude-* variant.
            || (self.name == "claude-cli" && model.starts_with("claude-"))
    }
}

/// A provider callable. Implementations perform the actual completion call
/// and return the raw provider payload; the executor wraps it into a
/// standardized response and never inspects it beyond family parsing.
#[async_trait]
pub trait ProviderBackend: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<EventData, ProviderError>;
}

//! Provider selection with failover and circuit breaking.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Mutex;

use crate::config::BreakerConfig;
use crate::error::ProviderError;
use crate::events::EventData;

use super::{CircuitBreaker, ProviderBackend, ProviderSpec};

#[derive(Debug, Default, Clone)]
struct CallStats {
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    total_latency_ms: u64,
    last_call: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl CallStats {
    fn to_status(&self) -> EventData {
        let success_rate = if self.total_calls > 0 {
            self.successful_calls as f64 / self.total_calls as f64
        } else {
            0.0
        };
        let avg_latency_ms = if self.successful_calls > 0 {
            self.total_latency_ms as f64 / self.successful_calls as f64
        } else {
            0.0
        };
        json!({
            "total_calls": self.total_calls,
            "successful_calls": self.successful_calls,
            "failed_calls": self.failed_calls,
            "success_rate": success_rate,
            "avg_latency_ms": avg_latency_ms,
            "last_call": self.last_call,
            "last_error": self.last_error,
        })
    }
}

struct ProviderEntry {
    spec: ProviderSpec,
    backend: Option<Arc<dyn ProviderBackend>>,
    breaker: CircuitBreaker,
    stats: CallStats,
}

impl ProviderEntry {
    fn to_status(&self) -> EventData {
        json!({
            "provider": self.spec.name,
            "config": self.spec,
            "circuit_breaker": {
                "state": self.breaker.state_name(),
                "is_open": self.breaker.currently_open(),
                "recent_failures": self.breaker.recent_failures(),
                "open_remaining_secs": self.breaker.open_remaining().map(|d| d.as_secs()),
                "last_success_age_secs": self.breaker.last_success_age().map(|d| d.as_secs()),
            },
            "stats": self.stats.to_status(),
        })
    }
}

struct Inner {
    providers: HashMap<String, ProviderEntry>,
    /// Model → provider routing cache, bypassed when MCP is required and
    /// ignored while the cached provider's breaker is open.
    model_cache: HashMap<String, String>,
}

/// Catalog of backend providers with health tracking.
pub struct ProviderManager {
    breaker_config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl ProviderManager {
    pub fn new(breaker_config: BreakerConfig) -> Self {
        Self {
            breaker_config,
            inner: Mutex::new(Inner {
                providers: HashMap::new(),
                model_cache: HashMap::new(),
            }),
        }
    }

    fn new_breaker(&self) -> CircuitBreaker {
        CircuitBreaker::new(
            self.breaker_config.failure_threshold,
            self.breaker_config.timeout_window(),
        )
    }

    /// Add or update a provider's declarative config without touching an
    /// existing breaker, stats, or backend binding.
    pub async fn upsert_spec(&self, spec: ProviderSpec) {
        let mut inner = self.inner.lock().await;
        let name = spec.name.clone();
        match inner.providers.get_mut(&name) {
            Some(entry) => {
                entry.spec = spec;
                tracing::info!(provider = %name, "updated provider config");
            }
            None => {
                inner.providers.insert(
                    name.clone(),
                    ProviderEntry {
                        spec,
                        backend: None,
                        breaker: self.new_breaker(),
                        stats: CallStats::default(),
                    },
                );
                tracing::info!(provider = %name, "added provider");
            }
        }
    }

    /// Bind the callable for a provider, registering the spec if new.
    pub async fn register(&self, spec: ProviderSpec, backend: Arc<dyn ProviderBackend>) {
        let name = spec.name.clone();
        self.upsert_spec(spec).await;
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.providers.get_mut(&name) {
            entry.backend = Some(backend);
        }
    }

    /// Select the best available provider for a model.
    pub async fn select(
        &self,
        model: &str,
        require_mcp: bool,
        prefer_streaming: bool,
    ) -> Result<(String, ProviderSpec), ProviderError> {
        let mut inner = self.inner.lock().await;

        // Cache fast path, valid only while the cached provider is healthy.
        if !require_mcp
            && let Some(name) = inner.model_cache.get(model).cloned()
            && let Some(entry) = inner.providers.get_mut(&name)
            && !entry.breaker.is_open()
        {
            return Ok((name, entry.spec.clone()));
        }

        let mut open_circuits = Vec::new();
        let mut candidates: Vec<(String, ProviderSpec)> = Vec::new();
        for (name, entry) in inner.providers.iter_mut() {
            if entry.breaker.is_open() {
                open_circuits.push(name.clone());
                continue;
            }
            if require_mcp && !entry.spec.supports_mcp {
                continue;
            }
            if entry.spec.supports_model(model) {
                candidates.push((name.clone(), entry.spec.clone()));
            }
        }

        if candidates.is_empty() {
            return Err(if open_circuits.is_empty() {
                ProviderError::UnsupportedModel {
                    model: model.to_string(),
                }
            } else {
                open_circuits.sort();
                ProviderError::CircuitsOpen {
                    circuits_open: open_circuits,
                }
            });
        }

        candidates.sort_by_key(|(_, spec)| {
            (
                spec.priority,
                std::cmp::Reverse(spec.supports_streaming && prefer_streaming),
            )
        });
        let Some((name, spec)) = candidates.into_iter().next() else {
            return Err(ProviderError::UnsupportedModel {
                model: model.to_string(),
            });
        };

        // Cache only selections made with every breaker closed. A fallback
        // picked while the preferred provider is open must not shadow it once
        // the window elapses.
        if !require_mcp && open_circuits.is_empty() {
            inner.model_cache.insert(model.to_string(), name.clone());
        }

        tracing::debug!(
            provider = %name,
            model,
            require_mcp,
            prefer_streaming,
            "selected provider"
        );
        Ok((name, spec))
    }

    /// Fetch the bound callable for a selected provider.
    pub async fn backend(&self, name: &str) -> Result<Arc<dyn ProviderBackend>, ProviderError> {
        self.inner
            .lock()
            .await
            .providers
            .get(name)
            .and_then(|entry| entry.backend.clone())
            .ok_or_else(|| ProviderError::NoBackend {
                provider: name.to_string(),
            })
    }

    pub async fn record_success(&self, name: &str, latency_ms: u64) {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.providers.get_mut(name) else {
            return;
        };
        entry.breaker.record_success();
        entry.stats.total_calls += 1;
        entry.stats.successful_calls += 1;
        entry.stats.total_latency_ms += latency_ms;
        entry.stats.last_call = Some(Utc::now());
        tracing::info!(provider = %name, latency_ms, "provider call succeeded");
    }

    pub async fn record_failure(&self, name: &str, error: &str) {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.providers.get_mut(name) else {
            return;
        };
        entry.breaker.record_failure();
        entry.stats.total_calls += 1;
        entry.stats.failed_calls += 1;
        entry.stats.last_call = Some(Utc::now());
        entry.stats.last_error = Some(error.to_string());
        tracing::warn!(
            provider = %name,
            error,
            total_failures = entry.stats.failed_calls,
            "provider call failed"
        );
    }

    /// Fresh breaker and purged routing-cache entries for one provider.
    /// Stats are kept; they describe history, not health.
    pub async fn reset(&self, name: &str) -> Result<EventData, ProviderError> {
        let mut inner = self.inner.lock().await;
        if !inner.providers.contains_key(name) {
            return Err(ProviderError::UnknownProvider {
                provider: name.to_string(),
            });
        }
        let breaker = self.new_breaker();
        if let Some(entry) = inner.providers.get_mut(name) {
            entry.breaker = breaker;
        }
        inner.model_cache.retain(|_, provider| provider != name);
        tracing::info!(provider = %name, "reset provider");
        Ok(json!({"provider": name, "reset": true, "status": "available"}))
    }

    pub async fn status(&self, name: &str) -> Option<EventData> {
        let inner = self.inner.lock().await;
        inner.providers.get(name).map(ProviderEntry::to_status)
    }

    pub async fn all_status(&self) -> EventData {
        let inner = self.inner.lock().await;
        let mut providers = serde_json::Map::new();
        let mut available = 0usize;
        for (name, entry) in &inner.providers {
            if !entry.breaker.currently_open() {
                available += 1;
            }
            providers.insert(name.clone(), entry.to_status());
        }
        json!({
            "total_providers": inner.providers.len(),
            "available_providers": available,
            "providers": providers,
        })
    }
}

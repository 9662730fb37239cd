//! Runtime configuration for the completion daemon.
//!
//! Layering is compiled defaults, then an optional TOML settings file, then
//! environment variables (`.env` is loaded by the host before this module
//! runs). Every option recognized here maps onto the tunables exposed by the
//! completion core: request timeouts, retry policy, circuit breaker, session
//! cleanup, and the response store.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::provider::ProviderSpec;

fn optional_env(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(v) if v.is_empty() => None,
        Ok(v) => Some(v),
        Err(_) => None,
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    optional_env(key)
        .map(|s| {
            s.parse::<T>().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()
}

/// Provider-call deadlines, seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub default_secs: u64,
    pub min_secs: u64,
    pub max_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_secs: 300,
            min_secs: 60,
            max_secs: 1800,
        }
    }
}

impl TimeoutConfig {
    /// Resolve a request-carried timeout against the configured bounds.
    /// Absent timeouts get the default; present ones are clamped.
    pub fn resolve(&self, requested_secs: Option<u64>) -> Duration {
        let secs = requested_secs
            .unwrap_or(self.default_secs)
            .clamp(self.min_secs, self.max_secs);
        Duration::from_secs(secs)
    }
}

/// Exponential-backoff retry policy for transient completion failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_secs: f64,
    pub max_delay_secs: f64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_secs: 2.0,
            max_delay_secs: 60.0,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (zero-based): `initial * mult^attempt`,
    /// capped at the maximum.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay_secs * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay.min(self.max_delay_secs).max(0.0))
    }
}

/// Per-provider circuit breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: usize,
    pub timeout_window_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_window_secs: 300,
        }
    }
}

impl BreakerConfig {
    pub fn timeout_window(&self) -> Duration {
        Duration::from_secs(self.timeout_window_secs)
    }
}

/// Session lifecycle and periodic maintenance tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub inactive_minutes: u64,
    pub cleanup_interval_secs: u64,
    pub default_lock_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactive_minutes: 60,
            cleanup_interval_secs: 300,
            default_lock_timeout_secs: 300,
        }
    }
}

impl SessionConfig {
    pub fn inactive_after(&self) -> Duration {
        Duration::from_secs(self.inactive_minutes * 60)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Response log and recovery index tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub responses_dir: PathBuf,
    pub recovery_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            responses_dir: PathBuf::from("var/logs/responses"),
            recovery_capacity: 1000,
        }
    }
}

/// Full daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub timeouts: TimeoutConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub sessions: SessionConfig,
    pub store: StoreConfig,
    /// Provider catalog. Hosts bind the actual callables at startup; entries
    /// without a bound backend are selectable but fail at invocation.
    pub providers: Vec<ProviderSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            sessions: SessionConfig::default(),
            store: StoreConfig::default(),
            providers: vec![
                ProviderSpec {
                    name: "claude-cli".to_string(),
                    models: vec![
                        "claude-cli/sonnet".to_string(),
                        "claude-cli/haiku".to_string(),
                        "claude-cli/opus".to_string(),
                    ],
                    priority: 1,
                    supports_streaming: true,
                    supports_mcp: true,
                },
                ProviderSpec {
                    name: "litellm".to_string(),
                    models: vec!["*".to_string()],
                    priority: 2,
                    supports_streaming: true,
                    supports_mcp: false,
                },
            ],
        }
    }
}

impl Config {
    /// Load configuration: defaults, optional TOML file, then environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text =
                    std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    })?;
                toml::from_str(&text).map_err(|e| ConfigError::ParseFailed {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?
            }
            None => Config::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = parse_env("KSI_COMPLETION_TIMEOUT_DEFAULT")? {
            self.timeouts.default_secs = v;
        }
        if let Some(v) = parse_env("KSI_COMPLETION_TIMEOUT_MIN")? {
            self.timeouts.min_secs = v;
        }
        if let Some(v) = parse_env("KSI_COMPLETION_TIMEOUT_MAX")? {
            self.timeouts.max_secs = v;
        }
        if let Some(v) = parse_env("KSI_RETRY_MAX_ATTEMPTS")? {
            self.retry.max_attempts = v;
        }
        if let Some(v) = parse_env("KSI_RETRY_INITIAL_DELAY_SECS")? {
            self.retry.initial_delay_secs = v;
        }
        if let Some(v) = parse_env("KSI_RETRY_MAX_DELAY_SECS")? {
            self.retry.max_delay_secs = v;
        }
        if let Some(v) = parse_env("KSI_RETRY_BACKOFF_MULTIPLIER")? {
            self.retry.backoff_multiplier = v;
        }
        if let Some(v) = parse_env("KSI_BREAKER_FAILURE_THRESHOLD")? {
            self.breaker.failure_threshold = v;
        }
        if let Some(v) = parse_env("KSI_BREAKER_TIMEOUT_WINDOW_SECS")? {
            self.breaker.timeout_window_secs = v;
        }
        if let Some(v) = parse_env("KSI_SESSION_INACTIVE_MINUTES")? {
            self.sessions.inactive_minutes = v;
        }
        if let Some(v) = parse_env("KSI_SESSION_CLEANUP_INTERVAL_SECS")? {
            self.sessions.cleanup_interval_secs = v;
        }
        if let Some(v) = parse_env("KSI_RECOVERY_CAPACITY")? {
            self.store.recovery_capacity = v;
        }
        if let Some(dir) = optional_env("KSI_RESPONSES_DIR") {
            self.store.responses_dir = PathBuf::from(dir);
        }
        Ok(())
    }
}

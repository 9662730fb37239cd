//! Error types for the completion core.
//!
//! Each subsystem has its own error enum; [`Error`] aggregates them at the
//! crate boundary. Failures that reach a client-visible event payload carry a
//! stable [`ErrorKind`] string so downstream handlers can classify them
//! without parsing messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable classification for completion failures.
///
/// The retry controller only resubmits kinds where
/// [`ErrorKind::is_retryable`] returns true.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    NetworkError,
    ApiRateLimit,
    ProviderError,
    TemporaryFailure,
    DaemonRestart,
    NoAvailableProvider,
    LockDenied,
    InvalidRequest,
    IoError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::ApiRateLimit => "api_rate_limit",
            ErrorKind::ProviderError => "provider_error",
            ErrorKind::TemporaryFailure => "temporary_failure",
            ErrorKind::DaemonRestart => "daemon_restart",
            ErrorKind::NoAvailableProvider => "no_available_provider",
            ErrorKind::LockDenied => "lock_denied",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::IoError => "io_error",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::NetworkError
                | ErrorKind::ApiRateLimit
                | ErrorKind::ProviderError
                | ErrorKind::TemporaryFailure
                | ErrorKind::DaemonRestart
        )
    }

    /// Map a failure event's `reason`/`message` pair onto a kind.
    ///
    /// Exact reasons win; otherwise the message is scanned for the patterns
    /// providers actually produce. Anything unrecognized is treated as a
    /// transient failure and left to the retry policy.
    pub fn classify(reason: &str, message: &str) -> Self {
        match reason {
            "timeout" => return ErrorKind::Timeout,
            "daemon_restart" => return ErrorKind::DaemonRestart,
            "network_error" => return ErrorKind::NetworkError,
            "api_rate_limit" => return ErrorKind::ApiRateLimit,
            "provider_error" => return ErrorKind::ProviderError,
            "no_available_provider" => return ErrorKind::NoAvailableProvider,
            "lock_denied" => return ErrorKind::LockDenied,
            "invalid_request" => return ErrorKind::InvalidRequest,
            "io_error" => return ErrorKind::IoError,
            _ => {}
        }
        let message = message.to_lowercase();
        if message.contains("rate limit") {
            ErrorKind::ApiRateLimit
        } else if message.contains("network") || message.contains("connection") {
            ErrorKind::NetworkError
        } else if message.contains("provider") {
            ErrorKind::ProviderError
        } else {
            ErrorKind::TemporaryFailure
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider selection and invocation failures.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider call exceeded the {timeout_secs}s deadline")]
    Timeout { timeout_secs: u64 },

    #[error("network error reaching {provider}: {reason}")]
    Network { provider: String, reason: String },

    #[error("{provider} rate limited the request")]
    RateLimited { provider: String },

    #[error("{provider} returned an upstream error: {reason}")]
    Upstream { provider: String, reason: String },

    #[error("no provider supports model '{model}'")]
    UnsupportedModel { model: String },

    #[error("no available provider (circuits open: {})", circuits_open.join(", "))]
    CircuitsOpen { circuits_open: Vec<String> },

    #[error("provider '{provider}' has no backend bound")]
    NoBackend { provider: String },

    #[error("unknown provider '{provider}'")]
    UnknownProvider { provider: String },

    #[error("{provider} call failed: {reason}")]
    Other { provider: String, reason: String },
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Timeout { .. } => ErrorKind::Timeout,
            ProviderError::Network { .. } => ErrorKind::NetworkError,
            ProviderError::RateLimited { .. } => ErrorKind::ApiRateLimit,
            ProviderError::Upstream { .. }
            | ProviderError::NoBackend { .. }
            | ProviderError::UnknownProvider { .. } => ErrorKind::ProviderError,
            ProviderError::UnsupportedModel { .. } | ProviderError::CircuitsOpen { .. } => {
                ErrorKind::NoAvailableProvider
            }
            ProviderError::Other { .. } => ErrorKind::TemporaryFailure,
        }
    }
}

/// Conversation lock and session bookkeeping failures.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("conversation already locked by {holder}")]
    AlreadyLocked {
        holder: String,
        expires_at: Option<DateTime<Utc>>,
    },

    #[error("lock is held by {holder}, not the releasing agent")]
    NotLockHolder { holder: String },

    #[error("conversation is not locked")]
    NotLocked,

    #[error("unknown session '{session_id}'")]
    UnknownSession { session_id: String },
}

/// Response log and recovery index failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("response log write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("response could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Configuration resolution failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("could not read config file {path}: {reason}")]
    ReadFailed { path: String, reason: String },

    #[error("could not parse config file {path}: {reason}")]
    ParseFailed { path: String, reason: String },
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Provider(e) => e.kind(),
            Error::Session(_) => ErrorKind::LockDenied,
            Error::Store(_) => ErrorKind::IoError,
            Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::NetworkError.is_retryable());
        assert!(ErrorKind::ApiRateLimit.is_retryable());
        assert!(ErrorKind::ProviderError.is_retryable());
        assert!(ErrorKind::TemporaryFailure.is_retryable());
        assert!(ErrorKind::DaemonRestart.is_retryable());

        assert!(!ErrorKind::NoAvailableProvider.is_retryable());
        assert!(!ErrorKind::LockDenied.is_retryable());
        assert!(!ErrorKind::InvalidRequest.is_retryable());
        assert!(!ErrorKind::IoError.is_retryable());
    }

    #[test]
    fn test_classify_exact_reasons() {
        assert_eq!(ErrorKind::classify("timeout", ""), ErrorKind::Timeout);
        assert_eq!(
            ErrorKind::classify("daemon_restart", ""),
            ErrorKind::DaemonRestart
        );
        assert_eq!(
            ErrorKind::classify("api_rate_limit", ""),
            ErrorKind::ApiRateLimit
        );
    }

    #[test]
    fn test_classify_message_patterns() {
        assert_eq!(
            ErrorKind::classify("unknown", "Rate limit exceeded, slow down"),
            ErrorKind::ApiRateLimit
        );
        assert_eq!(
            ErrorKind::classify("unknown", "Connection refused by upstream"),
            ErrorKind::NetworkError
        );
        assert_eq!(
            ErrorKind::classify("unknown", "provider returned 503"),
            ErrorKind::ProviderError
        );
        assert_eq!(
            ErrorKind::classify("unknown", "something odd happened"),
            ErrorKind::TemporaryFailure
        );
    }

    #[test]
    fn test_provider_error_kind_mapping() {
        let err = ProviderError::UnsupportedModel {
            model: "m".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::NoAvailableProvider);

        let err = ProviderError::CircuitsOpen {
            circuits_open: vec!["p1".to_string()],
        };
        assert_eq!(err.kind(), ErrorKind::NoAvailableProvider);
        assert!(err.to_string().contains("p1"));

        let err = ProviderError::Timeout { timeout_secs: 300 };
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_kind_serialization_is_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ApiRateLimit).unwrap();
        assert_eq!(json, "\"api_rate_limit\"");
        let back: ErrorKind = serde_json::from_str("\"network_error\"").unwrap();
        assert_eq!(back, ErrorKind::NetworkError);
    }
}

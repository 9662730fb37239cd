//! Standardized completion responses and provider payload parsing.
//!
//! Provider outputs are parsed into tagged family variants rather than being
//! probed shape-by-shape at each use site. Unknown payloads get a
//! conservative fallback that only looks for a top-level `session_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::EventData;

/// Token usage block reported by Claude-family providers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Raw provider output, tagged by provider family.
#[derive(Debug, Clone)]
pub enum RawResponse {
    Claude {
        session_id: Option<String>,
        usage: Option<TokenUsage>,
        raw: EventData,
    },
    OpenAi {
        usage: Option<TokenUsage>,
        raw: EventData,
    },
    Unknown {
        raw: EventData,
    },
}

impl RawResponse {
    /// Parse a raw payload according to the provider that produced it.
    pub fn parse(provider: &str, raw: EventData) -> Self {
        if provider.starts_with("claude") {
            let session_id = extract_session_id(&raw);
            let usage = raw
                .get("usage")
                .and_then(|u| serde_json::from_value::<TokenUsage>(u.clone()).ok());
            return RawResponse::Claude {
                session_id,
                usage,
                raw,
            };
        }

        let looks_openai = raw
            .get("object")
            .and_then(|v| v.as_str())
            .is_some_and(|o| o.starts_with("chat.completion"))
            || matches!(provider, "litellm" | "openai");
        if looks_openai {
            let usage = raw.get("usage").and_then(|u| {
                serde_json::from_value::<OpenAiUsage>(u.clone())
                    .ok()
                    .map(|u| TokenUsage {
                        input_tokens: u.prompt_tokens,
                        output_tokens: u.completion_tokens,
                        ..TokenUsage::default()
                    })
            });
            return RawResponse::OpenAi { usage, raw };
        }

        RawResponse::Unknown { raw }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            RawResponse::Claude { session_id, .. } => session_id.as_deref(),
            RawResponse::OpenAi { raw, .. } | RawResponse::Unknown { raw } => {
                raw.get("session_id").and_then(|v| v.as_str())
            }
        }
    }

    /// Usage as reported by a Claude-family payload; other families do not
    /// feed the token tracker.
    pub fn claude_usage(&self) -> Option<TokenUsage> {
        match self {
            RawResponse::Claude { usage, .. } => *usage,
            _ => None,
        }
    }

    pub fn usage(&self) -> Option<TokenUsage> {
        match self {
            RawResponse::Claude { usage, .. } | RawResponse::OpenAi { usage, .. } => *usage,
            RawResponse::Unknown { .. } => None,
        }
    }

    /// Wrap the raw payload into the envelope persisted per completion.
    pub fn into_standardized(
        self,
        provider: &str,
        request_id: &str,
        client_id: Option<String>,
        duration_ms: u64,
    ) -> StandardizedResponse {
        let raw = match self {
            RawResponse::Claude { raw, .. }
            | RawResponse::OpenAi { raw, .. }
            | RawResponse::Unknown { raw } => raw,
        };
        StandardizedResponse {
            provider: provider.to_string(),
            request_id: request_id.to_string(),
            client_id,
            duration_ms,
            timestamp: Utc::now(),
            response: raw,
        }
    }
}

fn extract_session_id(raw: &EventData) -> Option<String> {
    raw.get("session_id")
        .and_then(|v| v.as_str())
        .map(String::from)
}

/// The envelope persisted per completion, irrespective of provider:
/// `{provider, request_id, client_id?, duration_ms, timestamp, response}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardizedResponse {
    pub provider: String,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    /// Raw provider payload, stored verbatim.
    pub response: EventData,
}

impl StandardizedResponse {
    /// Session id embedded in the raw payload, if any.
    pub fn session_id(&self) -> Option<String> {
        extract_session_id(&self.response)
    }
}

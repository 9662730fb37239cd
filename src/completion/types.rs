//! Request and in-flight completion records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::events::EventData;

/// State of an accepted completion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionState {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl CompletionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionState::Queued => "queued",
            CompletionState::Processing => "processing",
            CompletionState::Completed => "completed",
            CompletionState::Failed => "failed",
            CompletionState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CompletionState::Completed | CompletionState::Failed | CompletionState::Cancelled
        )
    }
}

/// Conversation-lock directive carried by a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockDirective {
    #[serde(default)]
    pub enabled: bool,
    /// Lock timeout in seconds; the configured default applies when absent.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// An accepted completion request, parsed from a `completion:async` payload.
///
/// The raw payload is kept verbatim: it is what recovery stores, what retry
/// resubmits, and what the queue carries between acceptance and execution.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub request_id: String,
    pub session_id: Option<String>,
    pub originator_id: Option<String>,
    pub agent_id: Option<String>,
    pub model: String,
    pub stream: bool,
    pub timeout_secs: Option<u64>,
    pub conversation_lock: LockDirective,
    pub injection_config: Option<EventData>,
    pub extra_body: Option<EventData>,
    pub created_at: DateTime<Utc>,
    pub raw: EventData,
}

impl CompletionRequest {
    /// Parse a request payload. A missing `request_id` is generated and
    /// written back into the raw payload; a missing `conversation_id` gets
    /// the `ksi-<request_id>` default the providers expect.
    pub fn from_event(mut data: EventData) -> Result<Self, Error> {
        let obj = data.as_object_mut().ok_or_else(|| {
            Error::InvalidRequest("completion payload must be a JSON object".to_string())
        })?;

        let request_id = match obj.get("request_id").and_then(|v| v.as_str()) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let id = Uuid::new_v4().to_string();
                obj.insert("request_id".to_string(), EventData::String(id.clone()));
                id
            }
        };

        let model = obj
            .get("model")
            .and_then(|v| v.as_str())
            .filter(|m| !m.is_empty())
            .ok_or_else(|| Error::InvalidRequest("missing model".to_string()))?
            .to_string();

        if !obj.contains_key("conversation_id") {
            obj.insert(
                "conversation_id".to_string(),
                EventData::String(format!("ksi-{request_id}")),
            );
        }

        let session_id = obj
            .get("session_id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(String::from);
        let originator_id = obj
            .get("originator_id")
            .and_then(|v| v.as_str())
            .map(String::from);
        let agent_id = obj.get("agent_id").and_then(|v| v.as_str()).map(String::from);
        let stream = obj.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
        let timeout_secs = obj.get("timeout").and_then(|v| v.as_u64());

        let conversation_lock = match obj.get("conversation_lock") {
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                Error::InvalidRequest(format!("invalid conversation_lock: {e}"))
            })?,
            None => LockDirective::default(),
        };
        let injection_config = obj.get("injection_config").cloned();
        let extra_body = obj.get("extra_body").cloned();

        Ok(Self {
            request_id,
            session_id,
            originator_id,
            agent_id,
            model,
            stream,
            timeout_secs,
            conversation_lock,
            injection_config,
            extra_body,
            created_at: Utc::now(),
            raw: data,
        })
    }

    /// Whether provider selection must require MCP support, derived from the
    /// request's extras.
    pub fn require_mcp(&self) -> bool {
        self.extra_body
            .as_ref()
            .and_then(|body| body.pointer("/ksi/mcp_config_path"))
            .is_some()
    }

    /// Identity used as conversation-lock holder: the agent when known,
    /// falling back to the originator, then the request itself.
    pub fn lock_holder(&self) -> &str {
        self.agent_id
            .as_deref()
            .or(self.originator_id.as_deref())
            .unwrap_or(&self.request_id)
    }

    /// Whether the request asked for result injection.
    pub fn injection_enabled(&self) -> bool {
        self.injection_config
            .as_ref()
            .and_then(|c| c.get("enabled"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Bookkeeping record for a request the daemon has accepted. Removed one
/// minute after reaching a terminal state so late status queries still
/// resolve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveCompletion {
    pub request_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub state: CompletionState,
    pub queued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Original `completion:async` payload, kept for retry resubmission.
    pub data: EventData,
}

impl ActiveCompletion {
    pub fn new(request: &CompletionRequest) -> Self {
        Self {
            request_id: request.request_id.clone(),
            session_id: request.session_id.clone(),
            state: CompletionState::Queued,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            data: request.raw.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_event_generates_request_id() {
        let request =
            CompletionRequest::from_event(json!({"model": "m", "prompt": "hi"})).unwrap();
        assert!(!request.request_id.is_empty());
        assert_eq!(request.raw["request_id"], json!(request.request_id));
    }

    #[test]
    fn test_from_event_keeps_caller_request_id() {
        let request = CompletionRequest::from_event(
            json!({"request_id": "r1", "model": "m", "prompt": "hi"}),
        )
        .unwrap();
        assert_eq!(request.request_id, "r1");
    }

    #[test]
    fn test_from_event_requires_model() {
        let err = CompletionRequest::from_event(json!({"prompt": "hi"})).unwrap_err();
        assert!(err.to_string().contains("model"));

        let err = CompletionRequest::from_event(json!("not an object")).unwrap_err();
        assert!(err.to_string().contains("object"));
    }

    #[test]
    fn test_conversation_id_defaulted() {
        let request = CompletionRequest::from_event(
            json!({"request_id": "r1", "model": "m"}),
        )
        .unwrap();
        assert_eq!(request.raw["conversation_id"], json!("ksi-r1"));

        let request = CompletionRequest::from_event(
            json!({"request_id": "r2", "model": "m", "conversation_id": "custom"}),
        )
        .unwrap();
        assert_eq!(request.raw["conversation_id"], json!("custom"));
    }

    #[test]
    fn test_require_mcp_from_extra_body() {
        let request = CompletionRequest::from_event(json!({
            "model": "m",
            "extra_body": {"ksi": {"mcp_config_path": "/tmp/mcp.json"}},
        }))
        .unwrap();
        assert!(request.require_mcp());

        let request = CompletionRequest::from_event(json!({"model": "m"})).unwrap();
        assert!(!request.require_mcp());
    }

    #[test]
    fn test_lock_holder_fallback_chain() {
        let request = CompletionRequest::from_event(json!({
            "request_id": "r1",
            "model": "m",
            "agent_id": "agent-a",
            "originator_id": "client-1",
        }))
        .unwrap();
        assert_eq!(request.lock_holder(), "agent-a");

        let request = CompletionRequest::from_event(
            json!({"request_id": "r1", "model": "m", "originator_id": "client-1"}),
        )
        .unwrap();
        assert_eq!(request.lock_holder(), "client-1");

        let request =
            CompletionRequest::from_event(json!({"request_id": "r1", "model": "m"})).unwrap();
        assert_eq!(request.lock_holder(), "r1");
    }

    #[test]
    fn test_empty_session_id_means_sessionless() {
        let request = CompletionRequest::from_event(
            json!({"model": "m", "session_id": ""}),
        )
        .unwrap();
        assert!(request.session_id.is_none());

        let request = CompletionRequest::from_event(
            json!({"model": "m", "session_id": null}),
        )
        .unwrap();
        assert!(request.session_id.is_none());
    }

    #[test]
    fn test_active_completion_serde_round_trip() {
        let request = CompletionRequest::from_event(
            json!({"request_id": "r1", "model": "m", "session_id": "s1"}),
        )
        .unwrap();
        let completion = ActiveCompletion::new(&request);

        let value = serde_json::to_value(&completion).unwrap();
        let back: ActiveCompletion = serde_json::from_value(value).unwrap();
        assert_eq!(back.request_id, "r1");
        assert_eq!(back.state, CompletionState::Queued);
        assert_eq!(back.session_id.as_deref(), Some("s1"));
    }
}

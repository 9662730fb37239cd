//! Token usage analytics.
//!
//! Per-request usage records are kept in a bounded ring; aggregate totals by
//! agent and by model are maintained incrementally so summary queries do not
//! scan. Windowed agent queries scan the ring.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;

use super::response::TokenUsage;
use crate::events::EventData;

/// Retained per-request records; older ones only survive in the aggregates.
const MAX_RECORDS: usize = 10_000;

/// One completion's worth of token accounting.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    pub model: String,
    pub provider: String,
    pub usage: TokenUsage,
    pub has_mcp: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Serialize)]
struct Totals {
    requests: u64,
    input_tokens: u64,
    output_tokens: u64,
    cache_creation_tokens: u64,
    cache_read_tokens: u64,
}

impl Totals {
    fn add(&mut self, usage: &TokenUsage) {
        self.requests += 1;
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.cache_creation_tokens += usage.cache_creation_input_tokens;
        self.cache_read_tokens += usage.cache_read_input_tokens;
    }

    fn to_status(&self) -> EventData {
        json!({
            "requests": self.requests,
            "input_tokens": self.input_tokens,
            "output_tokens": self.output_tokens,
            "cache_creation_tokens": self.cache_creation_tokens,
            "cache_read_tokens": self.cache_read_tokens,
        })
    }
}

#[derive(Default)]
struct Inner {
    records: VecDeque<UsageRecord>,
    by_agent: HashMap<String, Totals>,
    by_model: HashMap<String, Totals>,
    overall: Totals,
}

/// Aggregates token usage across completions.
#[derive(Default)]
pub struct TokenTracker {
    inner: Mutex<Inner>,
}

impl TokenTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, record: UsageRecord) {
        let mut inner = self.inner.lock().await;
        if let Some(agent_id) = &record.agent_id {
            inner
                .by_agent
                .entry(agent_id.clone())
                .or_default()
                .add(&record.usage);
        }
        inner
            .by_model
            .entry(record.model.clone())
            .or_default()
            .add(&record.usage);
        inner.overall.add(&record.usage);

        inner.records.push_back(record);
        if inner.records.len() > MAX_RECORDS {
            inner.records.pop_front();
        }
    }

    /// Usage for one agent, optionally limited to the last `hours`.
    pub async fn agent_usage(&self, agent_id: &str, hours: Option<i64>) -> EventData {
        let inner = self.inner.lock().await;
        match hours {
            None => {
                let totals = inner.by_agent.get(agent_id).cloned().unwrap_or_default();
                json!({"agent_id": agent_id, "usage": totals.to_status()})
            }
            Some(hours) => {
                let cutoff = Utc::now() - TimeDelta::hours(hours);
                let mut totals = Totals::default();
                for record in inner
                    .records
                    .iter()
                    .filter(|r| r.agent_id.as_deref() == Some(agent_id))
                    .filter(|r| r.recorded_at >= cutoff)
                {
                    totals.add(&record.usage);
                }
                json!({"agent_id": agent_id, "hours": hours, "usage": totals.to_status()})
            }
        }
    }

    pub async fn model_usage(&self, model: &str) -> EventData {
        let inner = self.inner.lock().await;
        let totals = inner.by_model.get(model).cloned().unwrap_or_default();
        json!({"model": model, "usage": totals.to_status()})
    }

    pub async fn summary(&self) -> EventData {
        let inner = self.inner.lock().await;
        let mut models = serde_json::Map::new();
        for (model, totals) in &inner.by_model {
            models.insert(model.clone(), totals.to_status());
        }
        json!({
            "total": inner.overall.to_status(),
            "by_model": models,
            "tracked_agents": inner.by_agent.len(),
            "recent_records": inner.records.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(agent: Option<&str>, model: &str, input: u64, output: u64) -> UsageRecord {
        UsageRecord {
            request_id: "r".to_string(),
            session_id: None,
            agent_id: agent.map(String::from),
            model: model.to_string(),
            provider: "claude-cli".to_string(),
            usage: TokenUsage {
                input_tokens: input,
                output_tokens: output,
                ..TokenUsage::default()
            },
            has_mcp: false,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_aggregates_by_agent_and_model() {
        let tracker = TokenTracker::new();
        tracker.record(record(Some("a"), "m1", 10, 1)).await;
        tracker.record(record(Some("a"), "m2", 20, 2)).await;
        tracker.record(record(Some("b"), "m1", 5, 5)).await;

        let usage = tracker.agent_usage("a", None).await;
        assert_eq!(usage["usage"]["requests"], 2);
        assert_eq!(usage["usage"]["input_tokens"], 30);

        let usage = tracker.model_usage("m1").await;
        assert_eq!(usage["usage"]["requests"], 2);
        assert_eq!(usage["usage"]["input_tokens"], 15);

        let summary = tracker.summary().await;
        assert_eq!(summary["total"]["requests"], 3);
        assert_eq!(summary["total"]["output_tokens"], 8);
        assert_eq!(summary["tracked_agents"], 2);
    }

    #[tokio::test]
    async fn test_unknown_agent_reports_zero() {
        let tracker = TokenTracker::new();
        let usage = tracker.agent_usage("nobody", None).await;
        assert_eq!(usage["usage"]["requests"], 0);
    }

    #[tokio::test]
    async fn test_windowed_agent_usage_excludes_old_records() {
        let tracker = TokenTracker::new();
        let mut old = record(Some("a"), "m", 100, 10);
        old.recorded_at = Utc::now() - TimeDelta::hours(48);
        tracker.record(old).await;
        tracker.record(record(Some("a"), "m", 7, 3)).await;

        let usage = tracker.agent_usage("a", Some(24)).await;
        assert_eq!(usage["usage"]["requests"], 1);
        assert_eq!(usage["usage"]["input_tokens"], 7);

        // Unwindowed totals still include everything.
        let usage = tracker.agent_usage("a", None).await;
        assert_eq!(usage["usage"]["requests"], 2);
    }
}

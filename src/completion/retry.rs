//! Retry scheduling for failed completions.
//!
//! Failed requests are resubmitted through the normal `completion:async`
//! entry path after an exponential backoff, which means a retry loses its
//! original queue position and re-serializes behind any newer requests for
//! the conversation. A resubmission never reuses the failed `request_id`;
//! attempts are correlated by payload identity instead, so backoff keeps
//! growing across resubmissions until the policy gives up.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use crate::config::RetryConfig;
use crate::error::ErrorKind;
use crate::events::{EventData, EventRouter};

/// Decision for one failure report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Scheduled,
    NotRetryable,
}

struct RetryEntry {
    /// Number of retries already armed for this payload.
    attempt: u32,
    max_attempts: u32,
    last_error: ErrorKind,
    failure_message: Option<String>,
    /// request_id of the most recent failed attempt, for reporting and for
    /// deduplicating repeated failure events of the same attempt.
    last_request_id: String,
    next_fire_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    original_data: EventData,
    timer: Option<AbortHandle>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, RetryEntry>,
}

/// Schedules resubmission of retryable completion failures.
pub struct RetryController {
    router: Arc<EventRouter>,
    policy: RetryConfig,
    running: AtomicBool,
    inner: Mutex<Inner>,
}

impl RetryController {
    pub fn new(router: Arc<EventRouter>, policy: RetryConfig) -> Self {
        Self {
            router,
            policy,
            running: AtomicBool::new(false),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            max_attempts = self.policy.max_attempts,
            initial_delay_secs = self.policy.initial_delay_secs,
            max_delay_secs = self.policy.max_delay_secs,
            backoff_multiplier = self.policy.backoff_multiplier,
            "retry controller started"
        );
    }

    /// Stop scheduling and abort every pending timer.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut inner = self.inner.lock().await;
        for entry in inner.entries.values_mut() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }
        inner.entries.clear();
        tracing::info!("retry controller stopped");
    }

    /// Attempts are correlated by the payload with the per-attempt
    /// `request_id` removed.
    fn fingerprint(original_data: &EventData) -> String {
        let mut data = original_data.clone();
        if let Some(obj) = data.as_object_mut() {
            obj.remove("request_id");
        }
        data.to_string()
    }

    /// Record a failure and, when the policy admits it, arm a resubmission
    /// timer. At most one timer is outstanding per payload; a duplicate
    /// failure report for the same attempt leaves the existing timer alone.
    pub async fn schedule(
        self: &Arc<Self>,
        request_id: &str,
        original_data: EventData,
        kind: ErrorKind,
        message: Option<String>,
    ) -> RetryDecision {
        if !self.running.load(Ordering::SeqCst) {
            return RetryDecision::NotRetryable;
        }

        let key = Self::fingerprint(&original_data);
        let mut inner = self.inner.lock().await;
        let entry = inner.entries.entry(key.clone()).or_insert_with(|| RetryEntry {
            attempt: 0,
            max_attempts: self.policy.max_attempts,
            last_error: kind,
            failure_message: message.clone(),
            last_request_id: request_id.to_string(),
            next_fire_at: None,
            created_at: Utc::now(),
            original_data,
            timer: None,
        });

        // Duplicate report for an attempt that is already scheduled.
        if entry.last_request_id == request_id
            && entry.timer.as_ref().is_some_and(|t| !t.is_finished())
        {
            tracing::debug!(request_id, "retry already scheduled for this attempt");
            return RetryDecision::Scheduled;
        }

        entry.last_error = kind;
        entry.failure_message = message;
        entry.last_request_id = request_id.to_string();

        if !kind.is_retryable() || entry.attempt >= entry.max_attempts {
            tracing::warn!(
                request_id,
                error = %kind,
                attempt = entry.attempt,
                max_attempts = entry.max_attempts,
                "completion not retryable"
            );
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            inner.entries.remove(&key);
            return RetryDecision::NotRetryable;
        }

        let delay = self.policy.delay_for_attempt(entry.attempt);
        entry.attempt += 1;
        entry.next_fire_at =
            Some(Utc::now() + TimeDelta::milliseconds(delay.as_millis() as i64));
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }

        let controller = Arc::clone(self);
        let payload = entry.original_data.clone();
        let log_request_id = request_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            controller.fire(&key, &log_request_id, payload).await;
        });
        entry.timer = Some(handle.abort_handle());

        tracing::info!(
            request_id,
            error = %kind,
            attempt = entry.attempt,
            max_attempts = entry.max_attempts,
            delay_secs = delay.as_secs_f64(),
            "retry scheduled"
        );
        RetryDecision::Scheduled
    }

    async fn fire(&self, key: &str, request_id: &str, payload: EventData) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut inner = self.inner.lock().await;
            let Some(entry) = inner.entries.get_mut(key) else {
                return;
            };
            entry.timer = None;
            entry.next_fire_at = None;
        }

        tracing::info!(failed_request_id = request_id, "resubmitting completion for retry");

        // The resubmission is a new request: strip the failed attempt's id so
        // acceptance mints a fresh one.
        let mut payload = payload;
        if let Some(obj) = payload.as_object_mut() {
            obj.remove("request_id");
        }
        let _ = self.router.emit("completion:async", payload).await;
    }

    /// Drop settled entries (no pending timer) older than `max_age`. Entries
    /// whose retry succeeded have nothing left to correlate and would
    /// otherwise accumulate.
    pub async fn prune_settled(&self, max_age: std::time::Duration) -> usize {
        let cutoff = Utc::now() - TimeDelta::seconds(max_age.as_secs() as i64);
        let mut inner = self.inner.lock().await;
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| {
            entry.timer.as_ref().is_some_and(|t| !t.is_finished()) || entry.created_at >= cutoff
        });
        before - inner.entries.len()
    }

    pub async fn stats(&self) -> EventData {
        let inner = self.inner.lock().await;
        let pending = inner
            .entries
            .values()
            .filter(|e| e.timer.as_ref().is_some_and(|t| !t.is_finished()))
            .count();
        json!({
            "total_retrying": inner.entries.len(),
            "pending_timers": pending,
            "policy": {
                "max_attempts": self.policy.max_attempts,
                "initial_delay": self.policy.initial_delay_secs,
                "max_delay": self.policy.max_delay_secs,
                "backoff_multiplier": self.policy.backoff_multiplier,
            },
        })
    }

    pub async fn list(&self) -> EventData {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        let entries: Vec<EventData> = inner
            .entries
            .values()
            .map(|entry| {
                let next_retry_in = entry.next_fire_at.map(|at| {
                    (at - now).num_milliseconds().max(0) as f64 / 1000.0
                });
                json!({
                    "request_id": entry.last_request_id,
                    "retry_attempt": entry.attempt,
                    "max_retries": entry.max_attempts,
                    "last_error": entry.last_error.as_str(),
                    "failure_message": entry.failure_message,
                    "next_retry_in": next_retry_in,
                    "created_at": entry.created_at,
                })
            })
            .collect();
        json!(entries)
    }
}

//! Completion service: event handlers, per-session dispatchers, and the
//! long-lived maintenance loop.
//!
//! One [`CompletionService`] instance owns the four managers (providers,
//! sessions, queues, response store) plus the retry controller and token
//! tracker. The event emitter and the shutdown signal are constructor
//! dependencies; handlers are registered explicitly on the router during
//! startup, and the host drives [`CompletionService::run`] as the service's
//! long-lived task.

mod executor;
mod response;
mod retry;
mod tokens;
mod types;

pub use response::{RawResponse, StandardizedResponse, TokenUsage};
pub use retry::{RetryController, RetryDecision};
pub use tokens::{TokenTracker, UsageRecord};
pub use types::{ActiveCompletion, CompletionRequest, CompletionState, LockDirective};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;

use crate::config::Config;
use crate::error::{Error, ErrorKind};
use crate::events::{EventData, EventRouter, handler};
use crate::provider::{ProviderBackend, ProviderManager, ProviderSpec};
use crate::queue::QueueManager;
use crate::session::SessionManager;
use crate::store::ResponseStore;

/// Grace period before a terminal completion disappears from status queries.
const TERMINAL_RETENTION: Duration = Duration::from_secs(60);

/// How long a dispatcher waits on an empty queue before checking for exit.
const DEQUEUE_POLL: Duration = Duration::from_secs(1);

/// How long a settled retry entry is kept for correlation before pruning.
const RETRY_SETTLED_RETENTION: Duration = Duration::from_secs(600);

/// The completion subsystem's broker.
pub struct CompletionService {
    pub(crate) config: Config,
    pub(crate) router: Arc<EventRouter>,
    pub(crate) providers: Arc<ProviderManager>,
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) queues: Arc<QueueManager>,
    pub(crate) store: Arc<ResponseStore>,
    pub(crate) tokens: Arc<TokenTracker>,
    pub(crate) retry: Arc<RetryController>,
    /// Cancel handles keyed by request_id, registered while processing.
    pub(crate) cancels: Mutex<HashMap<String, watch::Sender<bool>>>,
    /// Dispatchers, cleanup timers, and sessionless executions.
    pub(crate) tasks: Mutex<JoinSet<()>>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

macro_rules! route {
    ($service:expr, $event:literal, $method:ident) => {{
        let svc = Arc::clone($service);
        $service
            .router
            .register(
                $event,
                handler(move |data| {
                    let svc = Arc::clone(&svc);
                    async move { svc.$method(data).await }
                }),
            )
            .await;
    }};
}

impl CompletionService {
    pub fn new(config: Config, router: Arc<EventRouter>, shutdown: watch::Receiver<bool>) -> Arc<Self> {
        let providers = Arc::new(ProviderManager::new(config.breaker.clone()));
        let sessions = Arc::new(SessionManager::new(Arc::clone(&router)));
        let store = Arc::new(ResponseStore::new(
            config.store.responses_dir.clone(),
            config.store.recovery_capacity,
        ));
        let retry = Arc::new(RetryController::new(
            Arc::clone(&router),
            config.retry.clone(),
        ));
        Arc::new(Self {
            config,
            router,
            providers,
            sessions,
            queues: Arc::new(QueueManager::new()),
            store,
            tokens: Arc::new(TokenTracker::new()),
            retry,
            cancels: Mutex::new(HashMap::new()),
            tasks: Mutex::new(JoinSet::new()),
            shutdown,
        })
    }

    /// Register a provider callable, adding its spec to the catalog if new.
    pub async fn bind_provider(&self, spec: ProviderSpec, backend: Arc<dyn ProviderBackend>) {
        self.providers.register(spec, backend).await;
    }

    pub fn providers(&self) -> &Arc<ProviderManager> {
        &self.providers
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn queues(&self) -> &Arc<QueueManager> {
        &self.queues
    }

    pub fn store(&self) -> &Arc<ResponseStore> {
        &self.store
    }

    pub fn tokens(&self) -> &Arc<TokenTracker> {
        &self.tokens
    }

    /// Register every event handler this service consumes.
    pub async fn register_handlers(self: &Arc<Self>) {
        route!(self, "system:startup", handle_startup);
        route!(self, "system:context", handle_context);
        route!(self, "system:ready", handle_ready);
        route!(self, "system:shutdown", handle_shutdown);
        route!(self, "completion:async", handle_async);
        route!(self, "completion:cancel", handle_cancel);
        route!(self, "completion:status", handle_status);
        route!(self, "completion:session_status", handle_session_status);
        route!(self, "completion:provider_status", handle_provider_status);
        route!(self, "completion:token_usage", handle_token_usage);
        route!(self, "completion:retry_status", handle_retry_status);
        route!(self, "completion:failed", handle_failed);
        route!(self, "checkpoint:collect", handle_checkpoint_collect);
        route!(self, "checkpoint:restore", handle_checkpoint_restore);
    }

    /// Long-lived service task: periodic maintenance until shutdown, then an
    /// orderly teardown of dispatchers, timers, and in-flight requests.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut sweep =
            tokio::time::interval(self.config.sessions.cleanup_interval());
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick is not a maintenance pass.
        sweep.tick().await;

        tracing::info!("completion service ready");
        loop {
            tokio::select! {
                _ = sweep.tick() => self.maintenance().await,
                _ = shutdown.changed() => break,
            }
        }

        tracing::info!("shutdown signal received, completion service exiting");
        self.teardown().await;
    }

    async fn maintenance(&self) {
        let expired_locks = self.sessions.cleanup_expired_locks().await;
        let inactive_sessions = self
            .sessions
            .cleanup_inactive_sessions(self.config.sessions.inactive_after())
            .await;
        let idle_queues = self.queues.cleanup_idle().await;
        let settled_retries = self.retry.prune_settled(RETRY_SETTLED_RETENTION).await;
        // Reap finished task handles so the set does not grow unbounded.
        {
            let mut tasks = self.tasks.lock().await;
            while tasks.try_join_next().is_some() {}
        }
        tracing::debug!(
            expired_locks,
            inactive_sessions,
            idle_queues,
            settled_retries,
            "maintenance sweep complete"
        );
    }

    /// Cancel every non-terminal completion and emit `completion:cancelled`
    /// for each. Safe to call more than once.
    pub(crate) async fn cancel_outstanding(&self) {
        let snapshot = self.store.active_snapshot().await;
        for (request_id, completion) in snapshot {
            if completion.state.is_terminal() {
                continue;
            }
            self.store
                .update_active(&request_id, |c| {
                    c.state = CompletionState::Cancelled;
                    c.completed_at = Some(Utc::now());
                })
                .await;
            // A live executor emits completion:cancelled from its own
            // cancellation path; emit here only for work that never started.
            if !self.fire_cancel(&request_id).await {
                self.router
                    .emit("completion:cancelled", json!({"request_id": request_id}))
                    .await;
            }
        }
    }

    pub(crate) async fn fire_cancel(&self, request_id: &str) -> bool {
        let cancels = self.cancels.lock().await;
        match cancels.get(request_id) {
            Some(tx) => tx.send(true).is_ok(),
            None => false,
        }
    }

    async fn teardown(&self) {
        self.retry.stop().await;
        self.cancel_outstanding().await;
        // Take the set out before joining: children grab the tasks lock to
        // spawn cleanup timers, so joining under the lock would deadlock.
        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        while tasks.join_next().await.is_some() {}
        self.log_shutdown_stats().await;
    }

    async fn log_shutdown_stats(&self) {
        let (active, _) = self.store.active_counts().await;
        let queues = self.queues.all_status().await;
        let sessions = self.sessions.overview().await;
        let tokens = self.tokens.summary().await;
        tracing::info!(
            active_completions = active,
            queues = %queues,
            sessions = %sessions,
            token_usage = %tokens,
            "completion service shutdown complete"
        );
    }

    // --- lifecycle handlers ---

    async fn handle_startup(
        self: &Arc<Self>,
        _data: EventData,
    ) -> Result<Option<EventData>, Error> {
        tracing::info!("completion service startup");
        self.store.ensure_directories().await?;
        for spec in self.config.providers.clone() {
            self.providers.upsert_spec(spec).await;
        }
        self.retry.start();
        Ok(Some(json!({
            "status": "completion_service_ready",
            "version": env!("CARGO_PKG_VERSION"),
        })))
    }

    /// The emitter and shutdown signal are constructor dependencies here;
    /// this handler only acknowledges the context phase.
    async fn handle_context(
        self: &Arc<Self>,
        _data: EventData,
    ) -> Result<Option<EventData>, Error> {
        tracing::debug!("completion service received runtime context");
        Ok(None)
    }

    /// Surrender the long-lived task descriptor; the host drives
    /// [`CompletionService::run`] under this name.
    async fn handle_ready(self: &Arc<Self>, _data: EventData) -> Result<Option<EventData>, Error> {
        Ok(Some(json!({
            "service": "completion_service",
            "tasks": [{"name": "service_manager"}],
        })))
    }

    async fn handle_shutdown(
        self: &Arc<Self>,
        _data: EventData,
    ) -> Result<Option<EventData>, Error> {
        tracing::info!("completion service shutting down");
        self.retry.stop().await;
        self.cancel_outstanding().await;
        self.log_shutdown_stats().await;
        Ok(None)
    }

    // --- cancellation ---

    async fn handle_cancel(self: &Arc<Self>, data: EventData) -> Result<Option<EventData>, Error> {
        let Some(request_id) = data.get("request_id").and_then(|v| v.as_str()) else {
            return Ok(Some(json!({"error": "request_id required"})));
        };

        let Some(completion) = self.store.get_active(request_id).await else {
            return Ok(Some(json!({
                "request_id": request_id,
                "error": "unknown_request",
            })));
        };
        if completion.state.is_terminal() {
            return Ok(Some(json!({
                "request_id": request_id,
                "error": "already_terminal",
                "status": completion.state.as_str(),
            })));
        }

        self.store
            .update_active(request_id, |c| {
                c.state = CompletionState::Cancelled;
                c.completed_at = Some(Utc::now());
            })
            .await;
        // The executor's cancellation path does the cleanup and emits
        // completion:cancelled; return without waiting for it.
        if !self.fire_cancel(request_id).await {
            tracing::debug!(request_id, "cancelled before processing started");
        }
        tracing::info!(request_id, "cancelled completion");
        Ok(Some(json!({"request_id": request_id, "status": "cancelled"})))
    }

    // --- retry ---

    async fn handle_failed(self: &Arc<Self>, data: EventData) -> Result<Option<EventData>, Error> {
        let Some(request_id) = data.get("request_id").and_then(|v| v.as_str()) else {
            tracing::warn!("completion failure without request_id");
            return Ok(Some(json!({"error": "request_id required"})));
        };
        let reason = data
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown_error");
        let message = data
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        // Recover the original payload: recovery index first, then the
        // active-completion record, then checkpoint-injected data.
        let mut original = self.store.get_recovery(request_id).await;
        if original.is_none()
            && let Some(completion) = self.store.remove_active(request_id).await
        {
            original = Some(completion.data);
        }
        if original.is_none() && reason == "daemon_restart" {
            original = data
                .get("completion_data")
                .and_then(|c| c.get("data"))
                .cloned();
            if original.is_some() {
                tracing::info!(request_id, "processing checkpoint restore failure");
            }
        }
        let Some(original) = original else {
            tracing::debug!(request_id, "no recovery data found for failed request");
            return Ok(Some(json!({"status": "not_found"})));
        };

        let kind = ErrorKind::classify(reason, &message);
        let decision = self
            .retry
            .schedule(request_id, original, kind, Some(message))
            .await;
        let status = match decision {
            RetryDecision::Scheduled => "retry_scheduled",
            RetryDecision::NotRetryable => "not_retryable",
        };
        Ok(Some(json!({"request_id": request_id, "status": status})))
    }

    // --- status queries ---

    async fn handle_status(self: &Arc<Self>, _data: EventData) -> Result<Option<EventData>, Error> {
        let (active, counts) = self.store.active_counts().await;
        let active_tasks = self.cancels.lock().await.len();
        let status_counts: serde_json::Map<String, EventData> = counts
            .into_iter()
            .map(|(state, count)| (state.to_string(), json!(count)))
            .collect();
        Ok(Some(json!({
            "service_ready": true,
            "active_completions": active,
            "active_tasks": active_tasks,
            "status_counts": status_counts,
            "queues": self.queues.all_status().await,
            "sessions": self.sessions.overview().await,
            "providers": self.providers.all_status().await,
            "token_usage": self.tokens.summary().await,
            "retry": self.retry.stats().await,
        })))
    }

    async fn handle_session_status(
        self: &Arc<Self>,
        data: EventData,
    ) -> Result<Option<EventData>, Error> {
        let Some(session_id) = data.get("session_id").and_then(|v| v.as_str()) else {
            return Ok(Some(json!({"error": "session_id required"})));
        };

        let snapshot = self.store.active_snapshot().await;
        let completions: Vec<EventData> = snapshot
            .values()
            .filter(|c| c.session_id.as_deref() == Some(session_id))
            .map(|c| {
                json!({
                    "request_id": c.request_id,
                    "status": c.state.as_str(),
                    "queued_at": c.queued_at,
                    "started_at": c.started_at,
                    "completed_at": c.completed_at,
                })
            })
            .collect();

        Ok(Some(json!({
            "session_id": session_id,
            "completions": completions,
            "queue": self.queues.status(session_id).await,
            "session": self.sessions.session_status(session_id).await,
        })))
    }

    async fn handle_provider_status(
        self: &Arc<Self>,
        data: EventData,
    ) -> Result<Option<EventData>, Error> {
        match data.get("provider").and_then(|v| v.as_str()) {
            Some(provider) => match self.providers.status(provider).await {
                Some(status) => Ok(Some(status)),
                None => Ok(Some(json!({"error": format!("unknown provider: {provider}")}))),
            },
            None => Ok(Some(self.providers.all_status().await)),
        }
    }

    async fn handle_token_usage(
        self: &Arc<Self>,
        data: EventData,
    ) -> Result<Option<EventData>, Error> {
        if let Some(agent_id) = data.get("agent_id").and_then(|v| v.as_str()) {
            let hours = data.get("hours").and_then(|v| v.as_i64());
            return Ok(Some(self.tokens.agent_usage(agent_id, hours).await));
        }
        if let Some(model) = data.get("model").and_then(|v| v.as_str()) {
            return Ok(Some(self.tokens.model_usage(model).await));
        }
        Ok(Some(self.tokens.summary().await))
    }

    async fn handle_retry_status(
        self: &Arc<Self>,
        _data: EventData,
    ) -> Result<Option<EventData>, Error> {
        Ok(Some(json!({
            "stats": self.retry.stats().await,
            "retrying_requests": self.retry.list().await,
        })))
    }

    // --- checkpointing ---

    async fn handle_checkpoint_collect(
        self: &Arc<Self>,
        _data: EventData,
    ) -> Result<Option<EventData>, Error> {
        let depths = self.queues.depths().await;
        let mut checkpoint = self.store.collect_checkpoint(&depths).await;
        if let Some(obj) = checkpoint.as_object_mut() {
            obj.insert(
                "components".to_string(),
                json!({
                    "queue_manager": true,
                    "provider_manager": true,
                    "session_manager": true,
                    "token_tracker": true,
                    "retry_controller": true,
                }),
            );
        }
        Ok(Some(checkpoint))
    }

    async fn handle_checkpoint_restore(
        self: &Arc<Self>,
        data: EventData,
    ) -> Result<Option<EventData>, Error> {
        let interrupted = self.store.restore_checkpoint(&data).await;
        let restored = data
            .get("active_completions")
            .and_then(|v| v.as_object())
            .map(|m| m.len())
            .unwrap_or(0);

        // Anything mid-flight at checkpoint time is surfaced to the retry
        // controller; queued-but-unstarted work was never durable.
        for completion in &interrupted {
            self.router
                .emit(
                    "completion:failed",
                    json!({
                        "request_id": completion.request_id,
                        "reason": "daemon_restart",
                        "message": "daemon restarted while request was in flight",
                        "completion_data": completion,
                    }),
                )
                .await;
        }

        Ok(Some(json!({
            "restored": restored,
            "message": "active completions restored, queued items will be retried if needed",
        })))
    }
}

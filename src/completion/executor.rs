//! Per-request execution: acceptance, dispatch, provider invocation, result
//! recording, and event emission.
//!
//! Acceptance binds a request to its session and queue; a per-session
//! dispatcher then executes one request at a time so two in-flight
//! completions can never share a conversation. Sessionless requests bypass
//! queueing entirely and run as their own task.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;

use super::{
    ActiveCompletion, CompletionRequest, CompletionService, CompletionState, DEQUEUE_POLL,
    RawResponse, StandardizedResponse, TERMINAL_RETENTION, UsageRecord,
};
use crate::error::{Error, ErrorKind};
use crate::events::EventData;

/// What happened to one dequeued request.
enum Outcome {
    Success {
        response: StandardizedResponse,
    },
    Cancelled,
    Failed {
        kind: ErrorKind,
        message: String,
    },
}

impl CompletionService {
    /// `completion:async` entry point: record, bind, enqueue, and answer
    /// synchronously with the queue disposition.
    pub(crate) async fn handle_async(
        self: &Arc<Self>,
        data: EventData,
    ) -> Result<Option<EventData>, Error> {
        let request = match CompletionRequest::from_event(data) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "rejected completion request");
                return Ok(Some(json!({
                    "error": e.to_string(),
                    "error_kind": ErrorKind::InvalidRequest.as_str(),
                })));
            }
        };

        tracing::info!(
            request_id = %request.request_id,
            session_id = request.session_id.as_deref(),
            model = %request.model,
            "received async completion request"
        );

        if let Some(session_id) = &request.session_id {
            self.sessions
                .register_request(session_id, &request.request_id, request.agent_id.as_deref())
                .await;
        }
        self.store
            .save_recovery(
                &request.request_id,
                request.session_id.as_deref(),
                request.raw.clone(),
            )
            .await;
        self.store.insert_active(ActiveCompletion::new(&request)).await;

        let response = match &request.session_id {
            // Sessionless requests cannot fork a conversation; run directly.
            None => {
                let svc = Arc::clone(self);
                let request_id = request.request_id.clone();
                let raw = request.raw.clone();
                self.tasks.lock().await.spawn(async move {
                    svc.process_request(&request_id, raw).await;
                    svc.store.clear_recovery(&request_id).await;
                });
                json!({"request_id": request.request_id, "status": "processing"})
            }
            Some(session_id) => {
                let outcome = self
                    .queues
                    .enqueue(session_id, &request.request_id, request.raw.clone())
                    .await;
                if outcome.dispatcher_needed {
                    let svc = Arc::clone(self);
                    let session_id = session_id.clone();
                    self.tasks
                        .lock()
                        .await
                        .spawn(async move { svc.run_dispatcher(session_id).await });
                }
                let status = if outcome.dispatcher_needed && outcome.position == 1 {
                    "processing"
                } else {
                    "queued"
                };
                json!({
                    "request_id": request.request_id,
                    "status": status,
                    "position": outcome.position,
                    "queue_size": outcome.queue_size,
                })
            }
        };
        Ok(Some(response))
    }

    /// Drain one session's queue, one request at a time. Exits when the
    /// queue is observably empty or the service is shutting down.
    pub(crate) async fn run_dispatcher(self: Arc<Self>, session_id: String) {
        tracing::debug!(%session_id, "session dispatcher started");
        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            match self.queues.dequeue(&session_id, DEQUEUE_POLL).await {
                Some((request_id, data)) => {
                    self.process_request(&request_id, data).await;
                    self.sessions.complete_request(&session_id, &request_id).await;
                    self.store.clear_recovery(&request_id).await;
                }
                None => {
                    if self.queues.release_if_drained(&session_id).await {
                        tracing::debug!(%session_id, "session dispatcher idle, exiting");
                        break;
                    }
                }
            }
        }
    }

    /// Execute one request end-to-end and emit its terminal event. Never
    /// panics or propagates: the dispatcher loop must keep serving the
    /// session whatever happens here.
    pub(crate) async fn process_request(self: &Arc<Self>, request_id: &str, data: EventData) {
        let request = match CompletionRequest::from_event(data) {
            Ok(request) => request,
            Err(e) => {
                self.finish_failed(request_id, None, ErrorKind::InvalidRequest, e.to_string())
                    .await;
                return;
            }
        };

        // Register the cancel handle before any suspension so
        // completion:cancel can target this request.
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        self.cancels
            .lock()
            .await
            .insert(request_id.to_string(), cancel_tx);

        // A cancel that raced acceptance wins before we start.
        if let Some(active) = self.store.get_active(request_id).await
            && active.state == CompletionState::Cancelled
        {
            self.cancels.lock().await.remove(request_id);
            self.router
                .emit("completion:cancelled", json!({"request_id": request_id}))
                .await;
            self.schedule_cleanup(request_id).await;
            return;
        }

        self.store
            .update_active(request_id, |c| {
                c.state = CompletionState::Processing;
                c.started_at = Some(Utc::now());
            })
            .await;

        let mut lock_acquired = false;
        let outcome = self.execute(&request, &mut cancel_rx, &mut lock_acquired).await;
        self.cancels.lock().await.remove(request_id);

        match outcome {
            Outcome::Success { response } => {
                self.finish_success(&request, response).await;
            }
            Outcome::Cancelled => {
                tracing::info!(request_id, "completion cancelled");
                self.store
                    .update_active(request_id, |c| {
                        c.state = CompletionState::Cancelled;
                        c.completed_at = Some(Utc::now());
                    })
                    .await;
                self.schedule_cleanup(request_id).await;
                self.router
                    .emit("completion:cancelled", json!({"request_id": request_id}))
                    .await;
            }
            Outcome::Failed { kind, message } => {
                self.finish_failed(request_id, request.session_id.as_deref(), kind, message)
                    .await;
            }
        }

        // The conversation lock is released on every exit path.
        if lock_acquired && let Some(session_id) = &request.session_id {
            if let Err(e) = self
                .sessions
                .release_lock(session_id, request.lock_holder())
                .await
            {
                tracing::warn!(request_id, error = %e, "failed to release conversation lock");
            }
        }
    }

    /// Provider-facing half of the lifecycle: lock, select, call, persist.
    async fn execute(
        &self,
        request: &CompletionRequest,
        cancel_rx: &mut watch::Receiver<bool>,
        lock_acquired: &mut bool,
    ) -> Outcome {
        // Optional cooperative conversation lock.
        if request.conversation_lock.enabled
            && let Some(session_id) = &request.session_id
        {
            let timeout = std::time::Duration::from_secs(
                request
                    .conversation_lock
                    .timeout
                    .unwrap_or(self.config.sessions.default_lock_timeout_secs),
            );
            match self
                .sessions
                .acquire_lock(session_id, request.lock_holder(), timeout)
                .await
            {
                Ok(_) => *lock_acquired = true,
                Err(e) => {
                    return Outcome::Failed {
                        kind: ErrorKind::LockDenied,
                        message: format!("failed to acquire conversation lock: {e}"),
                    };
                }
            }
        }

        let (provider_name, _spec) = match self
            .providers
            .select(&request.model, request.require_mcp(), request.stream)
            .await
        {
            Ok(selected) => selected,
            Err(e) => {
                return Outcome::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                };
            }
        };

        self.router
            .emit(
                "completion:progress",
                json!({
                    "request_id": request.request_id,
                    "session_id": request.session_id,
                    "status": "calling_provider",
                    "provider": provider_name,
                }),
            )
            .await;

        let backend = match self.providers.backend(&provider_name).await {
            Ok(backend) => backend,
            Err(e) => {
                self.providers
                    .record_failure(&provider_name, &e.to_string())
                    .await;
                return Outcome::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                };
            }
        };

        let deadline = self.config.timeouts.resolve(request.timeout_secs);
        let started = std::time::Instant::now();
        let call = tokio::time::timeout(deadline, backend.complete(request));
        let result = tokio::select! {
            _ = cancel_rx.changed() => return Outcome::Cancelled,
            result = call => result,
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let raw = match result {
            Err(_) => {
                self.providers
                    .record_failure(&provider_name, "timeout")
                    .await;
                return Outcome::Failed {
                    kind: ErrorKind::Timeout,
                    message: format!(
                        "provider call exceeded the {}s deadline",
                        deadline.as_secs()
                    ),
                };
            }
            Ok(Err(e)) => {
                self.providers
                    .record_failure(&provider_name, &e.to_string())
                    .await;
                return Outcome::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                };
            }
            Ok(Ok(raw)) => raw,
        };

        self.providers.record_success(&provider_name, latency_ms).await;

        let parsed = RawResponse::parse(&provider_name, raw);
        if let Some(usage) = parsed.claude_usage() {
            self.tokens
                .record(UsageRecord {
                    request_id: request.request_id.clone(),
                    session_id: request.session_id.clone(),
                    agent_id: request.agent_id.clone(),
                    model: request.model.clone(),
                    provider: provider_name.clone(),
                    usage,
                    has_mcp: request.require_mcp(),
                    recorded_at: Utc::now(),
                })
                .await;
        }

        let response = parsed.into_standardized(
            &provider_name,
            &request.request_id,
            request.originator_id.clone(),
            latency_ms,
        );

        // Persistence failures surface to the operator but do not unwind the
        // completion: resubmitting a finished request would fork the
        // conversation.
        if let Err(e) = self.store.save_response(&response).await {
            tracing::error!(
                request_id = %request.request_id,
                error = %e,
                "failed to persist completion response"
            );
        }

        Outcome::Success { response }
    }

    async fn finish_success(
        self: &Arc<Self>,
        request: &CompletionRequest,
        response: StandardizedResponse,
    ) {
        let request_id = &request.request_id;

        // A cancel that raced the provider call wins: the request must not
        // emit completion:result.
        let mut transitioned = false;
        self.store
            .update_active(request_id, |c| {
                if !c.state.is_terminal() {
                    c.state = CompletionState::Completed;
                    c.completed_at = Some(Utc::now());
                    transitioned = true;
                }
            })
            .await;
        self.schedule_cleanup(request_id).await;
        if !transitioned {
            tracing::info!(request_id, "completion cancelled before result emission");
            self.router
                .emit("completion:cancelled", json!({"request_id": request_id}))
                .await;
            return;
        }

        let mut result_value = match serde_json::to_value(&response) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(request_id, error = %e, "response not representable as JSON");
                json!({"request_id": request_id})
            }
        };

        // Injection runs before the result is announced; a returned result
        // replaces the original in the emitted event.
        if request.injection_enabled()
            && let Some(injection_config) = &request.injection_config
        {
            let reply = self
                .router
                .emit(
                    "injection:process_result",
                    json!({
                        "request_id": request_id,
                        "result": result_value,
                        "injection_metadata": {
                            "injection_config": injection_config,
                            "circuit_breaker_config": request
                                .raw
                                .get("circuit_breaker_config")
                                .cloned()
                                .unwrap_or_else(|| json!({})),
                        },
                    }),
                )
                .await;
            if let Some(modified) = reply
                .and_then(|mut r| r.as_object_mut().map(|o| o.remove("result")))
                .flatten()
            {
                result_value = modified;
            }
        }

        self.router
            .emit(
                "completion:result",
                json!({"request_id": request_id, "result": result_value}),
            )
            .await;
    }

    /// Terminal failure path: record, emit `completion:error`, and hand
    /// retryable kinds to the retry controller via `completion:failed`.
    async fn finish_failed(
        self: &Arc<Self>,
        request_id: &str,
        session_id: Option<&str>,
        kind: ErrorKind,
        message: String,
    ) {
        tracing::error!(request_id, error = %message, kind = %kind, "completion failed");
        let mut transitioned = false;
        self.store
            .update_active(request_id, |c| {
                if !c.state.is_terminal() {
                    c.state = CompletionState::Failed;
                    c.error = Some(message.clone());
                    c.completed_at = Some(Utc::now());
                    transitioned = true;
                }
            })
            .await;
        self.schedule_cleanup(request_id).await;
        if !transitioned {
            // A concurrent cancel won; the failure is moot.
            self.router
                .emit("completion:cancelled", json!({"request_id": request_id}))
                .await;
            return;
        }

        self.router
            .emit(
                "completion:error",
                json!({
                    "request_id": request_id,
                    "error": message,
                    "session_id": session_id,
                }),
            )
            .await;

        if kind.is_retryable() {
            self.router
                .emit(
                    "completion:failed",
                    json!({
                        "request_id": request_id,
                        "reason": kind.as_str(),
                        "message": message,
                    }),
                )
                .await;
        }
    }

    /// Keep terminal completions visible to status queries for a grace
    /// period, then drop them.
    async fn schedule_cleanup(self: &Arc<Self>, request_id: &str) {
        let svc = Arc::clone(self);
        let request_id = request_id.to_string();
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow_and_update() {
            // Shutting down: teardown owns cleanup from here.
            return;
        }
        self.tasks.lock().await.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(TERMINAL_RETENTION) => {
                    svc.store.remove_active(&request_id).await;
                    svc.cancels.lock().await.remove(&request_id);
                }
                _ = shutdown.changed() => {}
            }
        });
    }
}

//! Shared harness for completion-core integration tests.
//!
//! Builds a daemon wired to an in-process event router, captures every event
//! the core emits, and provides mock provider backends with scriptable
//! failure behavior.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{Mutex, watch};

use ksi::completion::{CompletionRequest, CompletionService};
use ksi::config::Config;
use ksi::error::ProviderError;
use ksi::events::{EventData, EventRouter, handler};
use ksi::provider::{ProviderBackend, ProviderSpec};

/// Events the harness records for assertions.
const CAPTURED: &[&str] = &[
    "completion:result",
    "completion:error",
    "completion:cancelled",
    "completion:progress",
    "completion:failed",
    "conversation:locked",
    "conversation:unlocked",
];

pub struct TestDaemon {
    pub router: Arc<EventRouter>,
    pub service: Arc<CompletionService>,
    pub events: Arc<Mutex<Vec<(String, EventData)>>>,
    pub shutdown: watch::Sender<bool>,
    pub responses_dir: PathBuf,
    // Held so the per-test response directory outlives the daemon.
    _dir: Option<tempfile::TempDir>,
}

impl TestDaemon {
    pub async fn emit(&self, event: &str, data: EventData) -> Option<EventData> {
        self.router.emit(event, data).await
    }

    /// All captured events with the given name, in emission order.
    pub async fn events_named(&self, name: &str) -> Vec<EventData> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|(event, _)| event == name)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Poll until an event with the given name (and request_id, if given)
    /// has been captured. Panics on timeout.
    pub async fn wait_for(
        &self,
        name: &str,
        request_id: Option<&str>,
        timeout: Duration,
    ) -> EventData {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let events = self.events.lock().await;
                if let Some((_, data)) = events.iter().find(|(event, data)| {
                    event == name
                        && request_id
                            .is_none_or(|id| data.get("request_id").and_then(|v| v.as_str()) == Some(id))
                }) {
                    return data.clone();
                }
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {name} (request_id: {request_id:?})");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn session_log_path(&self, session_id: &str) -> PathBuf {
        self.responses_dir.join(format!("{session_id}.jsonl"))
    }
}

/// Build a daemon with captured events and a private responses directory.
/// The provider catalog starts empty; tests bind their own backends.
pub async fn daemon(configure: impl FnOnce(&mut Config)) -> TestDaemon {
    let dir = tempfile::tempdir().expect("tempdir");
    daemon_in(dir.path().to_path_buf(), Some(dir), configure).await
}

/// Build a daemon writing responses into an existing directory (used by the
/// checkpoint tests to simulate a restart against the same log files).
pub async fn daemon_sharing_dir(
    responses_dir: PathBuf,
    configure: impl FnOnce(&mut Config),
) -> TestDaemon {
    daemon_in(responses_dir, None, configure).await
}

async fn daemon_in(
    responses_dir: PathBuf,
    dir: Option<tempfile::TempDir>,
    configure: impl FnOnce(&mut Config),
) -> TestDaemon {
    let mut config = Config::default();
    config.providers = Vec::new();
    config.store.responses_dir = responses_dir.clone();
    // Keep retry timings test-sized unless a test overrides them.
    config.retry.initial_delay_secs = 0.05;
    config.retry.max_delay_secs = 1.0;
    configure(&mut config);

    let router = Arc::new(EventRouter::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let service = CompletionService::new(config, Arc::clone(&router), shutdown_rx);
    service.register_handlers().await;

    let events = Arc::new(Mutex::new(Vec::new()));
    for name in CAPTURED {
        let log = Arc::clone(&events);
        let event_name = name.to_string();
        router
            .register(
                name,
                handler(move |data| {
                    let log = Arc::clone(&log);
                    let event_name = event_name.clone();
                    async move {
                        log.lock().await.push((event_name, data));
                        Ok(None)
                    }
                }),
            )
            .await;
    }

    let startup = router.emit("system:startup", json!({})).await;
    assert_eq!(
        startup.as_ref().and_then(|r| r.get("status")).and_then(|s| s.as_str()),
        Some("completion_service_ready")
    );

    TestDaemon {
        router,
        service,
        events,
        shutdown: shutdown_tx,
        responses_dir,
        _dir: dir,
    }
}

pub fn spec(name: &str, models: &[&str], priority: u32) -> ProviderSpec {
    ProviderSpec {
        name: name.to_string(),
        models: models.iter().map(|m| m.to_string()).collect(),
        priority,
        supports_streaming: false,
        supports_mcp: false,
    }
}

/// Scriptable mock backend. Records the request ids it serves, in order.
pub struct MockBackend {
    calls: Mutex<Vec<String>>,
    behavior: Behavior,
}

pub enum Behavior {
    /// Succeed immediately.
    Ok,
    /// Fail with a network error this many times, then succeed.
    FailTimes(Mutex<u32>),
    /// Sleep for each listed duration in turn (then not at all), succeeding
    /// afterwards. Long leading delays give tests a window to cancel.
    Delays(Mutex<VecDeque<Duration>>),
}

impl MockBackend {
    pub fn ok() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            behavior: Behavior::Ok,
        })
    }

    pub fn failing(times: u32) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            behavior: Behavior::FailTimes(Mutex::new(times)),
        })
    }

    pub fn delays(delays: &[Duration]) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            behavior: Behavior::Delays(Mutex::new(delays.iter().copied().collect())),
        })
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    fn respond(request: &CompletionRequest) -> EventData {
        json!({
            "session_id": request.session_id,
            "result": format!("echo:{}", request.request_id),
            "usage": {"input_tokens": 10, "output_tokens": 5},
        })
    }
}

#[async_trait]
impl ProviderBackend for MockBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<EventData, ProviderError> {
        self.calls.lock().await.push(request.request_id.clone());
        match &self.behavior {
            Behavior::Ok => Ok(Self::respond(request)),
            Behavior::FailTimes(remaining) => {
                let mut remaining = remaining.lock().await;
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ProviderError::Network {
                        provider: "mock".to_string(),
                        reason: format!("transient failure ({} remaining)", *remaining),
                    });
                }
                Ok(Self::respond(request))
            }
            Behavior::Delays(delays) => {
                let delay = delays.lock().await.pop_front();
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(Self::respond(request))
            }
        }
    }
}

//! Retry scheduling, backoff exhaustion, checkpoint recovery, and graceful
//! shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{MockBackend, daemon, daemon_sharing_dir, spec};

const WAIT: Duration = Duration::from_secs(10);

/// Poll until `count` events with this name have been captured.
async fn wait_for_count(d: &common::TestDaemon, name: &str, count: usize, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if d.events_named(name).await.len() >= count {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "timed out waiting for {count} {name} events (have {})",
                d.events_named(name).await.len()
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_retry_backoff_until_attempts_exhausted() {
    let d = daemon(|c| {
        c.retry.max_attempts = 3;
        c.retry.initial_delay_secs = 0.05;
        c.retry.backoff_multiplier = 2.0;
        c.retry.max_delay_secs = 1.0;
    })
    .await;
    let backend = MockBackend::failing(u32::MAX);
    d.service
        .bind_provider(spec("p1", &["m"], 1), backend.clone())
        .await;

    d.emit(
        "completion:async",
        json!({"request_id": "r2", "model": "m", "prompt": "x", "session_id": null}),
    )
    .await
    .unwrap();

    // Original attempt plus three retries, every one failing.
    wait_for_count(&d, "completion:error", 4, WAIT).await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    let errors = d.events_named("completion:error").await;
    assert_eq!(errors.len(), 4, "no retries beyond max_attempts");
    assert_eq!(backend.calls().await.len(), 4);

    // Each resubmission is a new request referencing the same payload.
    let ids: std::collections::HashSet<String> = backend
        .calls()
        .await
        .into_iter()
        .collect();
    assert_eq!(ids.len(), 4);
    assert!(ids.contains("r2"));

    // The failure reports classified the error as retryable.
    let failed = d.events_named("completion:failed").await;
    assert_eq!(failed.len(), 4);
    assert!(failed.iter().all(|f| f["reason"] == "network_error"));
}

#[tokio::test]
async fn test_retry_eventually_succeeds() {
    let d = daemon(|c| {
        c.retry.max_attempts = 3;
        c.retry.initial_delay_secs = 0.05;
    })
    .await;
    // Fails twice, succeeds on the third call (second retry).
    let backend = MockBackend::failing(2);
    d.service
        .bind_provider(spec("p1", &["*"], 1), backend.clone())
        .await;

    d.emit(
        "completion:async",
        json!({"request_id": "r1", "model": "m", "session_id": "s1", "prompt": "x"}),
    )
    .await
    .unwrap();

    wait_for_count(&d, "completion:result", 1, WAIT).await;
    assert_eq!(backend.calls().await.len(), 3);

    // The successful completion landed in the session log exactly once.
    let text = std::fs::read_to_string(d.session_log_path("s1")).unwrap();
    assert_eq!(text.lines().count(), 1);
}

#[tokio::test]
async fn test_failed_event_without_recovery_reports_not_found() {
    let d = daemon(|_| {}).await;

    let response = d
        .emit(
            "completion:failed",
            json!({"request_id": "ghost", "reason": "timeout", "message": "gone"}),
        )
        .await
        .unwrap();
    assert_eq!(response["status"], "not_found");
}

#[tokio::test]
async fn test_retry_status_reports_pending_retry() {
    let d = daemon(|c| {
        c.retry.max_attempts = 3;
        c.retry.initial_delay_secs = 30.0;
    })
    .await;
    d.service
        .bind_provider(spec("p1", &["m"], 1), MockBackend::failing(u32::MAX))
        .await;

    d.emit(
        "completion:async",
        json!({"request_id": "r1", "model": "m", "session_id": null}),
    )
    .await
    .unwrap();
    d.wait_for("completion:failed", Some("r1"), WAIT).await;
    // Give the failed-handler a beat to arm the timer.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = d.emit("completion:retry_status", json!({})).await.unwrap();
    assert_eq!(status["stats"]["pending_timers"], 1);
    assert_eq!(status["stats"]["policy"]["max_attempts"], 3);
    assert_eq!(status["retrying_requests"][0]["request_id"], "r1");
    assert_eq!(status["retrying_requests"][0]["last_error"], "network_error");
}

#[tokio::test]
async fn test_checkpoint_restore_retries_midflight_request() {
    // Daemon A: request hangs mid-provider-call, checkpoint is collected.
    let a = daemon(|_| {}).await;
    a.service
        .bind_provider(
            spec("p1", &["m"], 1),
            MockBackend::delays(&[Duration::from_secs(120)]),
        )
        .await;

    a.emit(
        "completion:async",
        json!({"request_id": "r6", "session_id": "s6", "model": "m", "prompt": "x"}),
    )
    .await
    .unwrap();
    a.wait_for("completion:progress", Some("r6"), WAIT).await;

    let checkpoint = a.emit("checkpoint:collect", json!({})).await.unwrap();
    assert_eq!(
        checkpoint["active_completions"]["r6"]["state"],
        "processing"
    );
    assert_eq!(checkpoint["components"]["retry_controller"], true);

    // Daemon B: fresh process over the same responses directory.
    let b = daemon_sharing_dir(a.responses_dir.clone(), |c| {
        c.retry.initial_delay_secs = 0.05;
    })
    .await;
    let healthy = MockBackend::ok();
    b.service
        .bind_provider(spec("p1", &["m"], 1), healthy.clone())
        .await;

    let restored = b.emit("checkpoint:restore", checkpoint).await.unwrap();
    assert_eq!(restored["restored"], 1);

    // The interrupted request is classified daemon_restart, retried, and the
    // replacement completes against the same session log.
    let failed = b.events_named("completion:failed").await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["reason"], "daemon_restart");

    wait_for_count(&b, "completion:result", 1, WAIT).await;
    assert_eq!(healthy.calls().await.len(), 1);
    // The resubmission is a new request id.
    assert_ne!(healthy.calls().await[0], "r6");

    let text = std::fs::read_to_string(b.session_log_path("s6")).unwrap();
    let line: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
    assert_eq!(line["response"]["session_id"], "s6");
}

#[tokio::test]
async fn test_graceful_shutdown_cancels_in_flight_work() {
    let d = daemon(|_| {}).await;
    d.service
        .bind_provider(
            spec("p1", &["m"], 1),
            MockBackend::delays(&[Duration::from_secs(120)]),
        )
        .await;

    d.emit(
        "completion:async",
        json!({"request_id": "r1", "session_id": "s1", "model": "m"}),
    )
    .await
    .unwrap();
    d.wait_for("completion:progress", Some("r1"), WAIT).await;

    let run = tokio::spawn(Arc::clone(&d.service).run());
    d.shutdown.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("service must shut down promptly")
        .unwrap();

    let cancelled = d.events_named("completion:cancelled").await;
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0]["request_id"], "r1");
    assert!(d.events_named("completion:result").await.is_empty());
}

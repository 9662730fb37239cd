//! Durable response log plus volatile in-flight bookkeeping.
//!
//! One JSONL file per session keeps successful completions in conversation
//! order (the dispatcher guarantees a single writer per session); an
//! in-memory recovery map remembers the original payload of in-flight
//! requests so the retry controller can resubmit after a failure. The store
//! also holds the active-completion registry used for status queries and
//! checkpointing.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::completion::{ActiveCompletion, CompletionState, StandardizedResponse};
use crate::error::StoreError;
use crate::events::EventData;

struct RecoveryEntry {
    saved_at: DateTime<Utc>,
    /// Insertion order tiebreak for same-timestamp entries.
    seq: u64,
    request_data: EventData,
}

struct Inner {
    recovery: HashMap<String, RecoveryEntry>,
    active: HashMap<String, ActiveCompletion>,
    seq: u64,
}

/// Append-only per-session response log and in-flight request index.
pub struct ResponseStore {
    responses_dir: PathBuf,
    recovery_capacity: usize,
    inner: Mutex<Inner>,
}

impl ResponseStore {
    pub fn new(responses_dir: impl Into<PathBuf>, recovery_capacity: usize) -> Self {
        Self {
            responses_dir: responses_dir.into(),
            recovery_capacity,
            inner: Mutex::new(Inner {
                recovery: HashMap::new(),
                active: HashMap::new(),
                seq: 0,
            }),
        }
    }

    pub async fn ensure_directories(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.responses_dir).await?;
        Ok(())
    }

    pub fn session_log_path(&self, session_id: &str) -> PathBuf {
        self.responses_dir.join(format!("{session_id}.jsonl"))
    }

    /// Append a standardized response to its session's log.
    ///
    /// Responses whose raw payload carries no session id cannot be associated
    /// with a conversation; they are logged and dropped. Only filesystem
    /// failures surface as errors.
    pub async fn save_response(&self, response: &StandardizedResponse) -> Result<(), StoreError> {
        let Some(session_id) = response.session_id() else {
            tracing::warn!(
                request_id = %response.request_id,
                "no session_id in completion response, cannot save to session file"
            );
            return Ok(());
        };
        // Session ids become file names; anything path-shaped is unusable.
        if session_id.contains(['/', '\\']) || session_id == "." || session_id == ".." {
            tracing::warn!(
                request_id = %response.request_id,
                session_id = %session_id,
                "session id is not a valid log file name, response dropped"
            );
            return Ok(());
        }

        let mut line = serde_json::to_string(response)?;
        line.push('\n');

        let path = self.session_log_path(&session_id);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        tracing::debug!(path = %path.display(), "saved completion response");
        Ok(())
    }

    /// Remember a request payload for retry recovery. The map is bounded: at
    /// capacity, the oldest tenth of the entries is evicted by save time.
    pub async fn save_recovery(
        &self,
        request_id: &str,
        session_id: Option<&str>,
        request_data: EventData,
    ) {
        let mut inner = self.inner.lock().await;
        inner.seq += 1;
        let seq = inner.seq;
        inner.recovery.insert(
            request_id.to_string(),
            RecoveryEntry {
                saved_at: Utc::now(),
                seq,
                request_data,
            },
        );
        tracing::debug!(request_id, session_id, "saved recovery data");

        if inner.recovery.len() > self.recovery_capacity {
            let evict = (self.recovery_capacity / 10).max(1);
            let mut by_age: Vec<(String, DateTime<Utc>, u64)> = inner
                .recovery
                .iter()
                .map(|(id, entry)| (id.clone(), entry.saved_at, entry.seq))
                .collect();
            by_age.sort_by_key(|(_, saved_at, seq)| (*saved_at, *seq));
            for (id, _, _) in by_age.into_iter().take(evict) {
                inner.recovery.remove(&id);
            }
            tracing::debug!(evicted = evict, "recovery map over capacity, evicted oldest");
        }
    }

    pub async fn get_recovery(&self, request_id: &str) -> Option<EventData> {
        self.inner
            .lock()
            .await
            .recovery
            .get(request_id)
            .map(|entry| entry.request_data.clone())
    }

    pub async fn clear_recovery(&self, request_id: &str) {
        self.inner.lock().await.recovery.remove(request_id);
    }

    pub async fn recovery_len(&self) -> usize {
        self.inner.lock().await.recovery.len()
    }

    // --- active completion registry ---

    pub async fn insert_active(&self, completion: ActiveCompletion) {
        self.inner
            .lock()
            .await
            .active
            .insert(completion.request_id.clone(), completion);
    }

    /// Mutate an active completion in place. Returns false when unknown.
    pub async fn update_active<F>(&self, request_id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut ActiveCompletion),
    {
        let mut inner = self.inner.lock().await;
        match inner.active.get_mut(request_id) {
            Some(completion) => {
                mutate(completion);
                true
            }
            None => false,
        }
    }

    pub async fn get_active(&self, request_id: &str) -> Option<ActiveCompletion> {
        self.inner.lock().await.active.get(request_id).cloned()
    }

    pub async fn remove_active(&self, request_id: &str) -> Option<ActiveCompletion> {
        self.inner.lock().await.active.remove(request_id)
    }

    pub async fn active_snapshot(&self) -> HashMap<String, ActiveCompletion> {
        self.inner.lock().await.active.clone()
    }

    /// Total count plus per-state counts, for status queries.
    pub async fn active_counts(&self) -> (usize, HashMap<&'static str, usize>) {
        let inner = self.inner.lock().await;
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        for completion in inner.active.values() {
            *counts.entry(completion.state.as_str()).or_default() += 1;
        }
        (inner.active.len(), counts)
    }

    // --- checkpointing ---

    /// Snapshot the active-completions map and per-session queue depths.
    /// Queue items themselves are not extracted; queued work that has not
    /// started is lost across a restart and recovered through retry.
    pub async fn collect_checkpoint(
        &self,
        queue_depths: &HashMap<String, (usize, bool)>,
    ) -> EventData {
        let inner = self.inner.lock().await;
        let active: serde_json::Map<String, EventData> = inner
            .active
            .iter()
            .map(|(id, completion)| {
                (
                    id.clone(),
                    serde_json::to_value(completion).unwrap_or_else(|_| json!({})),
                )
            })
            .collect();

        let mut session_queues = serde_json::Map::new();
        for (session_id, (depth, is_active)) in queue_depths {
            if *depth > 0 {
                tracing::warn!(
                    %session_id,
                    depth,
                    "queued items cannot be extracted for checkpoint"
                );
            }
            session_queues.insert(
                session_id.clone(),
                json!({"items": [], "is_active": is_active}),
            );
        }

        tracing::info!(
            active_completions = active.len(),
            session_queues = session_queues.len(),
            "collected checkpoint data"
        );
        json!({
            "active_completions": active,
            "session_queues": session_queues,
        })
    }

    /// Merge a prior checkpoint's active completions. Entries that were
    /// mid-flight are marked failed and returned so the caller can synthesize
    /// `completion:failed` events for the retry controller.
    pub async fn restore_checkpoint(&self, data: &EventData) -> Vec<ActiveCompletion> {
        let Some(entries) = data.get("active_completions").and_then(|v| v.as_object()) else {
            return Vec::new();
        };

        let mut restored = Vec::new();
        let mut interrupted = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            for (request_id, value) in entries {
                let Ok(mut completion) =
                    serde_json::from_value::<ActiveCompletion>(value.clone())
                else {
                    tracing::warn!(request_id, "unreadable checkpoint entry skipped");
                    continue;
                };
                if !completion.state.is_terminal() {
                    completion.state = CompletionState::Failed;
                    completion.error = Some("daemon_restart".to_string());
                    interrupted.push(completion.clone());
                }
                inner.active.insert(request_id.clone(), completion);
                restored.push(request_id.clone());
            }
        }

        tracing::info!(
            restored = restored.len(),
            interrupted = interrupted.len(),
            "restored checkpoint data"
        );
        interrupted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::StandardizedResponse;

    fn store_in(dir: &std::path::Path) -> ResponseStore {
        ResponseStore::new(dir, 1000)
    }

    fn response_for(session_id: Option<&str>, request_id: &str) -> StandardizedResponse {
        let mut raw = json!({"result": "ok"});
        if let Some(session_id) = session_id {
            raw["session_id"] = json!(session_id);
        }
        StandardizedResponse {
            provider: "claude-cli".to_string(),
            request_id: request_id.to_string(),
            client_id: None,
            duration_ms: 12,
            timestamp: Utc::now(),
            response: raw,
        }
    }

    #[tokio::test]
    async fn test_save_response_appends_one_line_per_completion() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.ensure_directories().await.unwrap();

        store
            .save_response(&response_for(Some("s1"), "r1"))
            .await
            .unwrap();
        store
            .save_response(&response_for(Some("s1"), "r2"))
            .await
            .unwrap();

        let text = std::fs::read_to_string(store.session_log_path("s1")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: StandardizedResponse = serde_json::from_str(lines[0]).unwrap();
        let second: StandardizedResponse = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(first.request_id, "r1");
        assert_eq!(second.request_id, "r2");
    }

    #[tokio::test]
    async fn test_save_response_without_session_id_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.ensure_directories().await.unwrap();

        store.save_response(&response_for(None, "r1")).await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_save_response_rejects_path_shaped_session_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.ensure_directories().await.unwrap();

        store
            .save_response(&response_for(Some("../escape"), "r1"))
            .await
            .unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_recovery_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let payload = json!({"prompt": "hi", "model": "m"});
        store.save_recovery("r1", Some("s1"), payload.clone()).await;

        assert_eq!(store.get_recovery("r1").await, Some(payload));
        store.clear_recovery("r1").await;
        assert_eq!(store.get_recovery("r1").await, None);
    }

    #[tokio::test]
    async fn test_recovery_eviction_drops_oldest_tenth() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResponseStore::new(dir.path(), 100);

        for i in 0..101 {
            store
                .save_recovery(&format!("r{i}"), None, json!({"n": i}))
                .await;
        }

        // Capacity 100: the overflow evicts the 10 oldest entries.
        assert_eq!(store.recovery_len().await, 91);
        assert!(store.get_recovery("r0").await.is_none());
        assert!(store.get_recovery("r9").await.is_none());
        assert!(store.get_recovery("r10").await.is_some());
        assert!(store.get_recovery("r100").await.is_some());
    }

    #[tokio::test]
    async fn test_checkpoint_restore_marks_midflight_failed() {
        use crate::completion::{ActiveCompletion, CompletionState};

        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let checkpoint = json!({
            "active_completions": {
                "r1": {
                    "request_id": "r1",
                    "session_id": "s1",
                    "state": "processing",
                    "queued_at": Utc::now(),
                    "data": {"model": "m", "prompt": "hi", "session_id": "s1"},
                },
                "r2": {
                    "request_id": "r2",
                    "session_id": "s1",
                    "state": "completed",
                    "queued_at": Utc::now(),
                    "data": {},
                },
            },
        });

        let interrupted = store.restore_checkpoint(&checkpoint).await;
        assert_eq!(interrupted.len(), 1);
        assert_eq!(interrupted[0].request_id, "r1");

        let restored: ActiveCompletion = store.get_active("r1").await.unwrap();
        assert_eq!(restored.state, CompletionState::Failed);
        assert_eq!(restored.error.as_deref(), Some("daemon_restart"));

        let untouched = store.get_active("r2").await.unwrap();
        assert_eq!(untouched.state, CompletionState::Completed);
    }

    #[tokio::test]
    async fn test_collect_checkpoint_shape() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let mut depths = HashMap::new();
        depths.insert("s1".to_string(), (2usize, true));

        let data = store.collect_checkpoint(&depths).await;
        assert_eq!(data["session_queues"]["s1"]["items"], json!([]));
        assert_eq!(data["session_queues"]["s1"]["is_active"], json!(true));
        assert!(data["active_completions"].is_object());
    }
}

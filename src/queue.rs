//! Per-session completion queues and dispatcher lifecycle guard.
//!
//! Serializes requests that share a session while letting distinct sessions
//! proceed concurrently. The session-active flag and the queue contents are
//! guarded by one lock, so a dispatcher can only exit when its queue is
//! observably empty: an enqueue that lands between a dequeue timeout and the
//! exit decision keeps the dispatcher alive.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{Mutex, Notify};

use crate::events::EventData;

struct SessionQueue {
    items: VecDeque<(String, EventData)>,
    is_active: bool,
    notify: Arc<Notify>,
}

impl SessionQueue {
    fn new() -> Self {
        Self {
            items: VecDeque::new(),
            is_active: false,
            notify: Arc::new(Notify::new()),
        }
    }
}

/// Result of enqueueing a request.
#[derive(Debug, Clone, Copy)]
pub struct EnqueueOutcome {
    /// 1-based position of the request in its session queue.
    pub position: usize,
    pub queue_size: usize,
    /// True when this enqueue flipped the session from idle to active; the
    /// caller must spawn a dispatcher for the session.
    pub dispatcher_needed: bool,
}

/// Per-session FIFO queues for completion requests.
pub struct QueueManager {
    queues: Mutex<HashMap<String, SessionQueue>>,
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueManager {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Append a request to its session queue, creating the queue lazily.
    /// Marks the session active in the same critical section so exactly one
    /// caller is told to spawn the dispatcher.
    pub async fn enqueue(
        &self,
        session_id: &str,
        request_id: &str,
        data: EventData,
    ) -> EnqueueOutcome {
        let mut queues = self.queues.lock().await;
        let queue = queues
            .entry(session_id.to_string())
            .or_insert_with(SessionQueue::new);
        queue.items.push_back((request_id.to_string(), data));
        let dispatcher_needed = !queue.is_active;
        if dispatcher_needed {
            queue.is_active = true;
        }
        queue.notify.notify_one();
        let queue_size = queue.items.len();
        tracing::debug!(session_id, request_id, queue_size, "enqueued request");
        EnqueueOutcome {
            position: queue_size,
            queue_size,
            dispatcher_needed,
        }
    }

    /// Pop the next request, waiting up to `timeout` for one to arrive.
    /// Returns `None` on timeout or when the session has no queue.
    pub async fn dequeue(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> Option<(String, EventData)> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notify = {
                let mut queues = self.queues.lock().await;
                let queue = queues.get_mut(session_id)?;
                if let Some(item) = queue.items.pop_front() {
                    return Some(item);
                }
                Arc::clone(&queue.notify)
            };
            if tokio::time::timeout_at(deadline, notify.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    /// Atomically deactivate and destroy the session queue if it has drained.
    /// Returns true when the dispatcher should exit; false means an item
    /// arrived since the last dequeue and the loop must continue.
    pub async fn release_if_drained(&self, session_id: &str) -> bool {
        let mut queues = self.queues.lock().await;
        match queues.get(session_id) {
            Some(queue) if queue.items.is_empty() => {
                queues.remove(session_id);
                tracing::debug!(session_id, "session queue drained, released");
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    pub async fn is_active(&self, session_id: &str) -> bool {
        self.queues
            .lock()
            .await
            .get(session_id)
            .is_some_and(|queue| queue.is_active)
    }

    /// Queue depth and active flag per session, for checkpointing.
    pub async fn depths(&self) -> HashMap<String, (usize, bool)> {
        self.queues
            .lock()
            .await
            .iter()
            .map(|(session_id, queue)| {
                (session_id.clone(), (queue.items.len(), queue.is_active))
            })
            .collect()
    }

    pub async fn status(&self, session_id: &str) -> EventData {
        let queues = self.queues.lock().await;
        match queues.get(session_id) {
            Some(queue) => json!({
                "session_id": session_id,
                "queued": queue.items.len(),
                "is_active": queue.is_active,
                "is_empty": queue.items.is_empty(),
            }),
            None => json!({
                "session_id": session_id,
                "queued": 0,
                "is_active": false,
                "is_empty": true,
            }),
        }
    }

    pub async fn all_status(&self) -> EventData {
        let queues = self.queues.lock().await;
        let mut sessions = serde_json::Map::new();
        for (session_id, queue) in queues.iter() {
            sessions.insert(
                session_id.clone(),
                json!({"queued": queue.items.len(), "is_active": queue.is_active}),
            );
        }
        json!({
            "session_queue_count": queues.len(),
            "session_queues": sessions,
        })
    }

    /// Drop empty queues whose dispatcher is gone. Queues normally remove
    /// themselves via [`QueueManager::release_if_drained`]; this sweeps
    /// leftovers from dispatchers that exited abnormally.
    pub async fn cleanup_idle(&self) -> usize {
        let mut queues = self.queues.lock().await;
        let before = queues.len();
        queues.retain(|_, queue| queue.is_active || !queue.items.is_empty());
        before - queues.len()
    }
}

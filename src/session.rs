//! Session continuity: per-session state, active-request gating, and
//! cooperative conversation locks.
//!
//! The active-request flag is the dispatcher's fork-prevention mechanism and
//! is always enforced; the conversation lock is an optional application-level
//! guard agents use to reserve a conversation turn. Both can reject work
//! independently.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use tokio::sync::Mutex;

use crate::error::SessionError;
use crate::events::{EventData, EventRouter};

/// Per-session bookkeeping.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub request_count: u64,
    pub active_request_id: Option<String>,
    lock_holder: Option<String>,
    lock_expires_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Map<String, EventData>,
}

impl SessionState {
    fn new(session_id: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            created_at: now,
            last_activity: now,
            request_count: 0,
            active_request_id: None,
            lock_holder: None,
            lock_expires_at: None,
            metadata: serde_json::Map::new(),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Drop the lock if it has expired, then report whether one is held.
    fn lock_is_held(&mut self) -> bool {
        if self.lock_holder.is_some()
            && let Some(expires_at) = self.lock_expires_at
            && Utc::now() > expires_at
        {
            self.lock_holder = None;
            self.lock_expires_at = None;
        }
        self.lock_holder.is_some()
    }

    fn to_status(&mut self) -> EventData {
        let locked = self.lock_is_held();
        json!({
            "session_id": self.session_id,
            "created_at": self.created_at,
            "last_activity": self.last_activity,
            "request_count": self.request_count,
            "active_request": self.active_request_id,
            "conversation_locked": locked,
            "lock_holder": self.lock_holder,
            "lock_expires_at": self.lock_expires_at,
            "metadata": self.metadata,
        })
    }
}

/// Result of a successful lock acquisition.
#[derive(Debug, Clone)]
pub struct LockGrant {
    pub extended: bool,
    pub expires_at: DateTime<Utc>,
}

struct Inner {
    sessions: HashMap<String, SessionState>,
    agent_sessions: HashMap<String, HashSet<String>>,
}

/// Tracks session state, enforces one-active-request-per-session, and
/// provides advisory conversation locks.
pub struct SessionManager {
    router: Arc<EventRouter>,
    inner: Mutex<Inner>,
}

impl SessionManager {
    pub fn new(router: Arc<EventRouter>) -> Self {
        Self {
            router,
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                agent_sessions: HashMap::new(),
            }),
        }
    }

    /// Bind a request to its session, creating the session on first use.
    pub async fn register_request(
        &self,
        session_id: &str,
        request_id: &str,
        agent_id: Option<&str>,
    ) {
        let mut inner = self.inner.lock().await;
        let session = inner
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                tracing::info!(session_id, "created session");
                SessionState::new(session_id)
            });
        session.active_request_id = Some(request_id.to_string());
        session.request_count += 1;
        session.touch();

        if let Some(agent_id) = agent_id {
            inner
                .agent_sessions
                .entry(agent_id.to_string())
                .or_default()
                .insert(session_id.to_string());
        }
        tracing::debug!(session_id, request_id, agent_id, "registered request");
    }

    /// Clear the active-request flag if it still points at this request.
    pub async fn complete_request(&self, session_id: &str, request_id: &str) {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.sessions.get_mut(session_id) else {
            tracing::warn!(session_id, "completing request for unknown session");
            return;
        };
        if session.active_request_id.as_deref() == Some(request_id) {
            session.active_request_id = None;
        }
        session.touch();
        tracing::debug!(session_id, request_id, "completed request");
    }

    /// Acquire or extend the conversation lock for `agent_id`.
    pub async fn acquire_lock(
        &self,
        session_id: &str,
        agent_id: &str,
        timeout: Duration,
    ) -> Result<LockGrant, SessionError> {
        let grant = {
            let mut inner = self.inner.lock().await;
            let session = inner
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(|| SessionState::new(session_id));
            session.touch();

            let expires_at = Utc::now() + TimeDelta::seconds(timeout.as_secs() as i64);
            if session.lock_is_held() {
                if session.lock_holder.as_deref() == Some(agent_id) {
                    session.lock_expires_at = Some(expires_at);
                    tracing::debug!(session_id, agent_id, "extended conversation lock");
                    return Ok(LockGrant {
                        extended: true,
                        expires_at,
                    });
                }
                let holder = session.lock_holder.clone().unwrap_or_default();
                tracing::warn!(session_id, agent_id, holder = %holder, "lock denied");
                return Err(SessionError::AlreadyLocked {
                    holder,
                    expires_at: session.lock_expires_at,
                });
            }

            session.lock_holder = Some(agent_id.to_string());
            session.lock_expires_at = Some(expires_at);
            tracing::info!(
                session_id,
                agent_id,
                timeout_secs = timeout.as_secs(),
                "conversation lock acquired"
            );
            LockGrant {
                extended: false,
                expires_at,
            }
        };

        self.router
            .emit(
                "conversation:locked",
                json!({
                    "session_id": session_id,
                    "agent_id": agent_id,
                    "expires_at": grant.expires_at,
                }),
            )
            .await;
        Ok(grant)
    }

    /// Release the conversation lock. Only the holder may release.
    pub async fn release_lock(&self, session_id: &str, agent_id: &str) -> Result<(), SessionError> {
        {
            let mut inner = self.inner.lock().await;
            let session = inner.sessions.get_mut(session_id).ok_or_else(|| {
                SessionError::UnknownSession {
                    session_id: session_id.to_string(),
                }
            })?;
            if !session.lock_is_held() {
                return Err(SessionError::NotLocked);
            }
            if session.lock_holder.as_deref() != Some(agent_id) {
                return Err(SessionError::NotLockHolder {
                    holder: session.lock_holder.clone().unwrap_or_default(),
                });
            }
            session.lock_holder = None;
            session.lock_expires_at = None;
            tracing::info!(session_id, agent_id, "conversation lock released");
        }

        self.router
            .emit(
                "conversation:unlocked",
                json!({"session_id": session_id, "agent_id": agent_id}),
            )
            .await;
        Ok(())
    }

    /// Sweep locks whose expiry has passed. Returns the number cleared.
    pub async fn cleanup_expired_locks(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut cleaned = 0;
        for session in inner.sessions.values_mut() {
            if session.lock_holder.is_some()
                && let Some(expires_at) = session.lock_expires_at
                && now > expires_at
            {
                session.lock_holder = None;
                session.lock_expires_at = None;
                cleaned += 1;
                tracing::info!(session_id = %session.session_id, "cleaned up expired lock");
            }
        }
        cleaned
    }

    /// Evict sessions idle longer than `idle`, skipping any with an active
    /// request or a held lock. Returns the number evicted.
    pub async fn cleanup_inactive_sessions(&self, idle: Duration) -> usize {
        let mut inner = self.inner.lock().await;
        let cutoff = Utc::now() - TimeDelta::seconds(idle.as_secs() as i64);

        let stale: Vec<String> = inner
            .sessions
            .values_mut()
            .filter_map(|session| {
                let locked = session.lock_is_held();
                if session.last_activity < cutoff && session.active_request_id.is_none() && !locked
                {
                    Some(session.session_id.clone())
                } else {
                    None
                }
            })
            .collect();

        for session_id in &stale {
            inner.sessions.remove(session_id);
            for sessions in inner.agent_sessions.values_mut() {
                sessions.remove(session_id);
            }
            tracing::debug!(%session_id, "cleaned up inactive session");
        }
        inner.agent_sessions.retain(|_, sessions| !sessions.is_empty());

        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "pruned inactive sessions");
        }
        stale.len()
    }

    /// Sessions touched by an agent.
    pub async fn agent_sessions(&self, agent_id: &str) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .agent_sessions
            .get(agent_id)
            .map(|sessions| sessions.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn session_status(&self, session_id: &str) -> EventData {
        let mut inner = self.inner.lock().await;
        match inner.sessions.get_mut(session_id) {
            Some(session) => {
                let mut status = session.to_status();
                if let Some(obj) = status.as_object_mut() {
                    obj.insert("exists".to_string(), json!(true));
                }
                status
            }
            None => json!({"exists": false, "session_id": session_id}),
        }
    }

    pub async fn overview(&self) -> EventData {
        let mut inner = self.inner.lock().await;
        let total = inner.sessions.len();
        let mut locked = 0usize;
        let mut active = 0usize;
        for session in inner.sessions.values_mut() {
            if session.lock_is_held() {
                locked += 1;
            }
            if session.active_request_id.is_some() {
                active += 1;
            }
        }
        let agents = inner.agent_sessions.len();
        json!({
            "total_sessions": total,
            "locked_sessions": locked,
            "active_sessions": active,
            "agents_with_sessions": agents,
        })
    }
}

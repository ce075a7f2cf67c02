//! In-memory session store.
//!
//! `append` is the only mutation. Each session has its own lock, so
//! appends to one session serialize while different sessions proceed
//! independently. A session idle for longer than the TTL reads as
//! not found and is removed by the next purge.

use crate::a2a::types::Message;
use crate::error::SessionError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<Message>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Session {
    /// An empty history.
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            created_at: Utc::now(),
            messages: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
struct SessionEntry {
    session: Session,
    last_active: Instant,
    /// Set by purge once the entry is out of the map.
    removed: bool,
}

impl SessionEntry {
    fn expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_active) > ttl
    }
}

#[derive(Debug)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionEntry>>>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Append a message, creating the session on first use. Returns the
    /// new history length.
    pub fn append(&self, session_id: &str, message: Message) -> usize {
        self.append_at(session_id, message, Instant::now())
    }

    pub fn append_at(&self, session_id: &str, message: Message, now: Instant) -> usize {
        loop {
            let entry = self.entry_or_create(session_id, now);
            if let Some(len) = self.append_into(&entry, &message, now) {
                return len;
            }
            // Purged between lookup and lock; the next lookup creates a live entry.
        }
    }

    /// Append to `entry` unless purge has already taken it out of the map.
    fn append_into(&self, entry: &Mutex<SessionEntry>, message: &Message, now: Instant) -> Option<usize> {
        let mut entry = entry.lock().unwrap_or_else(PoisonError::into_inner);
        if entry.removed {
            return None;
        }
        if entry.expired(now, self.ttl) {
            tracing::debug!(session = %entry.session.id, "Session expired, starting a new one");
            entry.session = Session::new(&entry.session.id);
        }
        entry.session.messages.push(message.clone());
        entry.last_active = now;
        Some(entry.session.messages.len())
    }

    /// Ordered history of a live session.
    pub fn get(&self, session_id: &str) -> Result<Session, SessionError> {
        self.get_at(session_id, Instant::now())
    }

    pub fn get_at(&self, session_id: &str, now: Instant) -> Result<Session, SessionError> {
        let entry = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let entry = entry.lock().unwrap_or_else(PoisonError::into_inner);
        if entry.expired(now, self.ttl) {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        Ok(entry.session.clone())
    }

    /// Remove expired sessions, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, entry| {
            let mut entry = entry.lock().unwrap_or_else(PoisonError::into_inner);
            if entry.expired(now, self.ttl) {
                entry.removed = true;
                return false;
            }
            true
        });
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Purge on a fixed interval until `cancel` fires.
    pub fn spawn_purger(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.purge_expired();
                        if removed > 0 {
                            tracing::info!(removed, "Purged expired sessions");
                        }
                    }
                }
            }
        })
    }

    fn entry_or_create(&self, session_id: &str, now: Instant) -> Arc<Mutex<SessionEntry>> {
        if let Some(entry) = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
        {
            return entry.clone();
        }
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SessionEntry {
                    session: Session::new(session_id),
                    last_active: now,
                    removed: false,
                }))
            })
            .clone()
    }
}

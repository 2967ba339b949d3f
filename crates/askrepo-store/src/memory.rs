use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, instrument};

use askrepo_core::ids::SessionKey;
use askrepo_core::messages::{Role, Turn};

use crate::error::StoreError;
use crate::store::SessionStore;

struct SessionEntry {
    turns: VecDeque<Turn>,
    last_activity: Instant,
}

impl SessionEntry {
    fn new() -> Self {
        Self {
            turns: VecDeque::new(),
            last_activity: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.last_activity.elapsed() >= ttl
    }
}

/// In-process session store. Lost on restart.
///
/// Past `max_sessions` the least recently active session is evicted.
pub struct MemorySessionStore {
    sessions: DashMap<SessionKey, SessionEntry>,
    window: usize,
    ttl: Duration,
    max_sessions: usize,
}

impl MemorySessionStore {
    pub fn new(window: usize, ttl: Duration, max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            window: window.max(1),
            ttl,
            max_sessions: max_sessions.max(1),
        }
    }

    /// Number of sessions currently held, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn evict_least_recent(&self, keep: &SessionKey) {
        let oldest = self
            .sessions
            .iter()
            .filter(|e| e.key() != keep)
            .min_by_key(|e| e.value().last_activity)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            debug!(session_key = %key, "evicting least recently active session");
            self.sessions.remove(&key);
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn get_context(&self, key: &SessionKey) -> Result<Vec<Turn>, StoreError> {
        match self.sessions.get(key) {
            None => return Ok(Vec::new()),
            Some(entry) if !entry.is_expired(self.ttl) => {
                return Ok(entry.turns.iter().cloned().collect());
            }
            Some(_) => {}
        }
        // passive expiry
        self.sessions.remove_if(key, |_, e| e.is_expired(self.ttl));
        Ok(Vec::new())
    }

    #[instrument(skip(self, content), fields(session_key = %key))]
    fn append_turn(&self, key: &SessionKey, role: Role, content: &str) -> Result<(), StoreError> {
        {
            let mut entry = self
                .sessions
                .entry(key.clone())
                .or_insert_with(SessionEntry::new);
            if entry.is_expired(self.ttl) {
                entry.turns.clear();
            }
            entry.turns.push_back(Turn::new(role, content));
            while entry.turns.len() > self.window {
                entry.turns.pop_front();
            }
            entry.last_activity = Instant::now();
        }

        while self.sessions.len() > self.max_sessions {
            self.evict_least_recent(key);
        }
        Ok(())
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        let before = self.sessions.len();
        self.sessions.retain(|_, e| !e.is_expired(self.ttl));
        Ok(before.saturating_sub(self.sessions.len()))
    }

    fn evict(&self, key: &SessionKey) -> Result<bool, StoreError> {
        Ok(self.sessions.remove(key).is_some())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

use super::{SessionRecord, SessionState};
use crate::clock::Clock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Ids are never reused, even after deletion
    #[error("duplicate session id: {0}")]
    Duplicate(String),
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("invalid-transition: {from} -> {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
}

/// Session records keyed by id.
///
/// The map lock only guards lookup; each record has its own mutex so
/// concurrent updates to one session serialize without blocking others.
/// State changes go through [SessionStore::transition], which refuses
/// anything [SessionState::can_transition] does not allow.
pub struct SessionStore {
    clock: Arc<dyn Clock>,
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionRecord>>>>,
    /// Every id ever used, to enforce no-reuse
    seen_ids: Mutex<HashSet<String>>,
}

impl SessionStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            sessions: RwLock::new(HashMap::new()),
            seen_ids: Mutex::new(HashSet::new()),
        }
    }

    pub fn put(&self, record: SessionRecord) -> Result<(), StoreError> {
        let mut seen = self.seen_ids.lock().unwrap();
        if seen.contains(&record.id) {
            return Err(StoreError::Duplicate(record.id.clone()));
        }
        seen.insert(record.id.clone());
        drop(seen);

        let mut sessions = self.sessions.write().unwrap();
        debug!(session_id = %record.id, "session stored");
        sessions.insert(record.id.clone(), Arc::new(Mutex::new(record)));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<SessionRecord> {
        let entry = self.sessions.read().unwrap().get(id).cloned()?;
        let record = entry.lock().unwrap();
        Some(record.clone())
    }

    /// Apply `f` under the session's lock; timestamps update automatically
    pub fn update<F>(&self, id: &str, f: F) -> Result<SessionRecord, StoreError>
    where
        F: FnOnce(&mut SessionRecord),
    {
        let entry = self
            .sessions
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut record = entry.lock().unwrap();
        f(&mut record);
        record.updated_at = self.clock.now_unix();
        Ok(record.clone())
    }

    /// Move a session to `to`, enforcing the state machine
    pub fn transition(&self, id: &str, to: SessionState) -> Result<SessionRecord, StoreError> {
        let entry = self
            .sessions
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut record = entry.lock().unwrap();
        if !record.state.can_transition(to) {
            return Err(StoreError::InvalidTransition {
                from: record.state,
                to,
            });
        }
        debug!(session_id = id, from = %record.state, to = %to, "session transition");
        record.state = to;
        record.updated_at = self.clock.now_unix();
        Ok(record.clone())
    }

    /// Refresh last-access, e.g. when a playlist is fetched
    pub fn touch(&self, id: &str) -> Result<(), StoreError> {
        let now = self.clock.now_unix();
        self.update(id, |r| r.last_access = now).map(|_| ())
    }

    /// Snapshot of every record
    pub fn list(&self) -> Vec<SessionRecord> {
        let entries: Vec<_> = self.sessions.read().unwrap().values().cloned().collect();
        entries
            .iter()
            .map(|e| e.lock().unwrap().clone())
            .collect()
    }

    /// Non-terminal sessions, hiding those idle past `idle_timeout_secs`
    /// (0 disables the idle filter). Nothing is terminated here.
    pub fn list_active(&self, idle_timeout_secs: i64) -> Vec<SessionRecord> {
        let now = self.clock.now_unix();
        self.list()
            .into_iter()
            .filter(|r| !r.state.is_terminal())
            .filter(|r| idle_timeout_secs <= 0 || now - r.last_access < idle_timeout_secs)
            .collect()
    }

    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().unwrap();
        sessions
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

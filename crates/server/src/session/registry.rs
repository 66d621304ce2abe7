//! Process-wide table of live terminal sessions.
//!
//! The registry is the only place sessions are looked up by ID. Every
//! operation is internally synchronized, so orchestrators for different
//! sessions can insert and remove concurrently without external locking.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

use super::id::SessionId;
use super::terminal::TerminalSession;

/// Errors raised when registering a session.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// A live session already uses this ID.
    #[error("session id already registered: {0}")]
    DuplicateId(SessionId),

    /// The configured session limit has been reached.
    #[error("session limit reached ({0} active)")]
    Full(usize),
}

/// Snapshot of a registered session for diagnostics.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Namespace of the target workload.
    pub namespace: String,
    /// Pod the terminal is attached to.
    pub pod: String,
    /// Container inside the pod.
    pub container: String,
    /// Seconds since the session was created.
    pub age_secs: u64,
}

/// Thread-safe session table backed by `DashMap`.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<TerminalSession>>,
    /// Number of reserved or registered slots; bounded by `max_sessions`.
    active: AtomicUsize,
    max_sessions: usize,
}

impl SessionRegistry {
    /// Creates an empty registry that admits at most `max_sessions` entries.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            active: AtomicUsize::new(0),
            max_sessions,
        }
    }

    /// Registers a session under its ID.
    ///
    /// Fails if the ID is already live or the registry is full. A rejected
    /// insert leaves the registry unchanged.
    pub fn insert(&self, session: Arc<TerminalSession>) -> Result<(), RegistryError> {
        let max = self.max_sessions;
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .map_err(RegistryError::Full)?;

        match self.sessions.entry(session.id().clone()) {
            Entry::Occupied(entry) => {
                self.active.fetch_sub(1, Ordering::SeqCst);
                tracing::error!(session_id = %entry.key(), "Refusing to overwrite live session");
                Err(RegistryError::DuplicateId(entry.key().clone()))
            }
            Entry::Vacant(entry) => {
                tracing::debug!(session_id = %entry.key(), "Registered session");
                entry.insert(session);
                Ok(())
            }
        }
    }

    /// Looks up a live session.
    pub fn get(&self, id: &SessionId) -> Option<Arc<TerminalSession>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Removes a session, returning it if it was registered.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<TerminalSession>> {
        let removed = self.sessions.remove(id).map(|(_, session)| session);
        if removed.is_some() {
            self.active.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!(session_id = %id, "Unregistered session");
        }
        removed
    }

    /// Checks if a session is registered.
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Returns the number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Returns whether another session could be admitted right now.
    pub fn has_capacity(&self) -> bool {
        self.active.load(Ordering::SeqCst) < self.max_sessions
    }

    /// Lists all registered sessions.
    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| {
                let session = entry.value();
                let target = session.target();
                SessionInfo {
                    id: entry.key().clone(),
                    namespace: target.namespace.clone(),
                    pod: target.pod.clone(),
                    container: target.container.clone(),
                    age_secs: session.age().as_secs(),
                }
            })
            .collect()
    }
}

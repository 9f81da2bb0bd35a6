//! The live-session table.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};

use super::hooks::Hooks;
use super::session::Session;

/// Tracks every live session by id behind a dedicated read/write lock.
///
/// Unregistration removes the session from the table and fires the
/// unregister hooks; the session's event channel closes later, once the
/// transport writer has dropped its handle, so in-flight senders never
/// race a closed channel.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<dyn Session>>>,
    hooks: Arc<Hooks>,
    recover_panics: bool,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.read().len())
            .finish()
    }
}

impl SessionManager {
    /// An empty table sharing the server's hook set.
    pub fn new(hooks: Arc<Hooks>, recover_panics: bool) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            hooks,
            recover_panics,
        }
    }

    /// Register a session. Fails with [`Error::SessionExists`] when the
    /// id is already live.
    pub fn register(&self, session: Arc<dyn Session>) -> Result<()> {
        {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(session.id()) {
                return Err(Error::SessionExists(session.id().to_string()));
            }
            sessions.insert(session.id().to_string(), session.clone());
        }
        self.hooks
            .run_session_registered(self.recover_panics, &session);
        Ok(())
    }

    /// Remove a session by id. Idempotent; fires unregister hooks only
    /// when a session was actually removed.
    pub fn unregister(&self, id: &str) {
        let removed = self.sessions.write().remove(id);
        if let Some(session) = removed {
            self.hooks
                .run_session_unregistered(self.recover_panics, &session);
        }
    }

    /// Look up a live session.
    pub fn get(&self, id: &str) -> Result<Arc<dyn Session>> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    /// Whether a session id is live.
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Snapshot of initialized sessions, for fan-out.
    pub fn initialized_sessions(&self) -> Vec<Arc<dyn Session>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.is_initialized())
            .cloned()
            .collect()
    }
}

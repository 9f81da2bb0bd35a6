//! Session-id strategies for the streaming HTTP transport.

use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Prefix carried by ids from the stateful strategy.
pub const SESSION_ID_PREFIX: &str = "mcp-session-";

/// Pluggable session-id policy.
///
/// `validate` returns whether the id belongs to a *terminated* session;
/// unknown or malformed ids are errors. `terminate` returns whether the
/// termination was denied; it is idempotent for unknown and
/// already-terminated ids.
pub trait SessionIdManager: Send + Sync {
    /// Produce an id for a new session. Empty means "no session ids".
    fn generate(&self) -> String;
    /// Check an id presented by a client. `Ok(true)` = terminated.
    fn validate(&self, id: &str) -> Result<bool>;
    /// Mark an id terminated. `Ok(true)` = denied.
    fn terminate(&self, id: &str) -> Result<bool>;
}

/// No session ids at all: requests are anonymous and the
/// `Mcp-Session-Id` header is ignored entirely.
#[derive(Debug, Default)]
pub struct StatelessSessionIdManager;

impl SessionIdManager for StatelessSessionIdManager {
    fn generate(&self) -> String {
        String::new()
    }

    fn validate(&self, _id: &str) -> Result<bool> {
        Ok(false)
    }

    fn terminate(&self, _id: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Fresh id per initialize, no memory of issued ids: any well-formed id
/// on a later request is accepted at face value.
#[derive(Debug, Default)]
pub struct StatelessGeneratingSessionIdManager;

impl SessionIdManager for StatelessGeneratingSessionIdManager {
    fn generate(&self) -> String {
        Uuid::new_v4().to_string()
    }

    fn validate(&self, id: &str) -> Result<bool> {
        if id.is_empty() {
            return Err(Error::InvalidSessionId(id.to_string()));
        }
        Ok(false)
    }

    fn terminate(&self, _id: &str) -> Result<bool> {
        Ok(false)
    }
}

/// In-memory stateful ids of the form `mcp-session-<uuidv4>`.
///
/// "Insecure" because ids are guessable-by-capture and held only in
/// process memory; pair with transport-level auth for anything real.
#[derive(Debug, Default)]
pub struct InsecureStatefulSessionIdManager {
    live: DashMap<String, ()>,
    terminated: DashMap<String, ()>,
}

impl InsecureStatefulSessionIdManager {
    /// An empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    fn well_formed(id: &str) -> bool {
        id.strip_prefix(SESSION_ID_PREFIX)
            .is_some_and(|suffix| Uuid::parse_str(suffix).is_ok())
    }
}

impl SessionIdManager for InsecureStatefulSessionIdManager {
    fn generate(&self) -> String {
        let id = format!("{SESSION_ID_PREFIX}{}", Uuid::new_v4());
        self.live.insert(id.clone(), ());
        id
    }

    fn validate(&self, id: &str) -> Result<bool> {
        if !Self::well_formed(id) {
            return Err(Error::InvalidSessionId(id.to_string()));
        }
        if self.terminated.contains_key(id) {
            return Ok(true);
        }
        if self.live.contains_key(id) {
            return Ok(false);
        }
        Err(Error::SessionNotFound(id.to_string()))
    }

    fn terminate(&self, id: &str) -> Result<bool> {
        if !Self::well_formed(id) {
            return Err(Error::InvalidSessionId(id.to_string()));
        }
        self.live.remove(id);
        self.terminated.insert(id.to_string(), ());
        Ok(false)
    }
}

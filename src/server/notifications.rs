//! Notification fan-out to sessions.
//!
//! Sends are always non-blocking: the session's sender is captured under
//! the table's read lock, the lock is released, and the send happens
//! outside it. A full channel is reported through the error hooks and
//! never stalls the producer.

use serde_json::Value;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::jsonrpc::JSONRPCNotification;

use super::hooks::Hooks;
use super::session::{Session, SessionEvent};
use super::sessions::SessionManager;
use super::RequestContext;

/// Fan-out helper shared by the server and the registries.
pub struct NotificationHub {
    sessions: Arc<SessionManager>,
    hooks: Arc<Hooks>,
    recover_panics: bool,
}

impl std::fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationHub").finish_non_exhaustive()
    }
}

impl NotificationHub {
    pub(crate) fn new(
        sessions: Arc<SessionManager>,
        hooks: Arc<Hooks>,
        recover_panics: bool,
    ) -> Self {
        Self {
            sessions,
            hooks,
            recover_panics,
        }
    }

    fn send_to(&self, session: &Arc<dyn Session>, notification: JSONRPCNotification) -> Result<()> {
        let Some(sender) = session.event_sender() else {
            return Ok(());
        };
        match sender.try_send(SessionEvent::Notification(notification)) {
            Ok(()) => Ok(()),
            Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                let err = Error::NotificationChannelFull(session.id().to_string());
                self.hooks.run_error(
                    self.recover_panics,
                    &RequestContext::default(),
                    None,
                    "notify",
                    &err,
                );
                Err(err)
            },
            Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(
                    target: "mcp.notify",
                    session = %session.id(),
                    "dropping notification for closed session channel"
                );
                Ok(())
            },
        }
    }

    /// Send a notification to one session.
    ///
    /// Fails with [`Error::SessionNotFound`] for unknown ids. A session
    /// that has not finished `initialize` drops the notification
    /// silently.
    pub fn notify_one(&self, session_id: &str, method: &str, params: Value) -> Result<()> {
        let session = self.sessions.get(session_id)?;
        if !session.is_initialized() {
            tracing::debug!(
                target: "mcp.notify",
                session = session_id,
                method,
                "dropping notification for uninitialized session"
            );
            return Ok(());
        }
        self.send_to(&session, JSONRPCNotification::new(method, params))
    }

    /// Send a notification to every initialized session matching the
    /// predicate (or all of them when `predicate` is `None`).
    ///
    /// Individual full-channel failures go to the error hooks; the
    /// fan-out itself never fails and never blocks.
    pub fn notify_all(
        &self,
        predicate: Option<&dyn Fn(&dyn Session) -> bool>,
        method: &str,
        params: Value,
    ) {
        let targets = self.sessions.initialized_sessions();
        for session in targets {
            if let Some(predicate) = predicate {
                if !predicate(session.as_ref()) {
                    continue;
                }
            }
            let _ = self.send_to(&session, JSONRPCNotification::new(method, params.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::session::ServerSession;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn hub_with(
        sessions: Vec<Arc<ServerSession>>,
    ) -> (NotificationHub, Arc<AtomicUsize>) {
        let errors = Arc::new(AtomicUsize::new(0));
        let mut hooks = Hooks::new();
        {
            let errors = errors.clone();
            hooks.add_on_error(move |_, _, _, _| {
                errors.fetch_add(1, Ordering::SeqCst);
            });
        }
        let hooks = Arc::new(hooks);
        let manager = Arc::new(SessionManager::new(hooks.clone(), false));
        for session in sessions {
            manager.register(session as Arc<dyn Session>).unwrap();
        }
        (NotificationHub::new(manager, hooks, false), errors)
    }

    #[test]
    fn notify_one_unknown_session_fails() {
        let (hub, _) = hub_with(vec![]);
        let err = hub.notify_one("ghost", "test/n", json!({})).unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(_)));
    }

    #[test]
    fn uninitialized_sessions_drop_silently() {
        let session = Arc::new(ServerSession::new("s"));
        let mut receiver = session.take_receiver().unwrap();
        let (hub, errors) = hub_with(vec![session]);

        hub.notify_one("s", "test/n", json!({})).unwrap();
        assert!(receiver.try_recv().is_err());
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn full_channel_reports_via_error_hook() {
        let session = Arc::new(ServerSession::with_buffer("s", 1));
        session.mark_initialized();
        let _receiver = session.take_receiver().unwrap();
        let (hub, errors) = hub_with(vec![session]);

        hub.notify_one("s", "test/n", json!({"n": 1})).unwrap();
        let err = hub.notify_one("s", "test/n", json!({"n": 2})).unwrap_err();
        assert!(matches!(err, Error::NotificationChannelFull(_)));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn notify_all_respects_predicate() {
        let a = Arc::new(ServerSession::new("a"));
        a.mark_initialized();
        let mut rx_a = a.take_receiver().unwrap();
        let b = Arc::new(ServerSession::new("b"));
        b.mark_initialized();
        let mut rx_b = b.take_receiver().unwrap();

        let (hub, _) = hub_with(vec![a, b]);
        hub.notify_all(
            Some(&|session: &dyn Session| session.id() == "a"),
            "test/n",
            json!({}),
        );

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn per_session_order_is_submission_order() {
        let session = Arc::new(ServerSession::new("s"));
        session.mark_initialized();
        let mut receiver = session.take_receiver().unwrap();
        let (hub, _) = hub_with(vec![session]);

        for n in 0..5 {
            hub.notify_one("s", "test/n", json!({"n": n})).unwrap();
        }
        for expected in 0..5 {
            match receiver.try_recv().unwrap() {
                SessionEvent::Notification(notification) => {
                    assert_eq!(notification.params["n"], expected);
                },
                other => panic!("unexpected event {other:?}"),
            }
        }
    }
}

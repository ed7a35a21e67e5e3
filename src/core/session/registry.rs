use dashmap::DashMap;
use tracing::debug;

use crate::core::session::{SessionHandle, SessionId};

/// [`SessionRegistry`] maps client ids to their single live session.
///
/// Each operation touches one DashMap entry and never awaits, so the lock is
/// held only for the map mutation itself.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Installs `session` under its client id.
    ///
    /// Returns the session it replaced, if any. The caller owns forcing that
    /// session closed; its own teardown will not remove the new entry because
    /// [`unregister`](Self::unregister) checks the session id.
    pub fn register(&self, session: SessionHandle) -> Option<SessionHandle> {
        let client_id = session.client_id().to_owned();
        let previous = self.sessions.insert(client_id, session);
        if let Some(prev) = &previous {
            debug!(
                client_id = %prev.client_id(),
                replaced = %prev.id(),
                "registry entry superseded"
            );
        }
        previous
    }

    /// Removes the entry for `client_id` only if it still belongs to
    /// `session_id`. Returns whether anything was removed.
    pub fn unregister(&self, client_id: &str, session_id: SessionId) -> bool {
        self.sessions
            .remove_if(client_id, |_, current| current.id() == session_id)
            .is_some()
    }

    pub fn get(&self, client_id: &str) -> Option<SessionHandle> {
        self.sessions.get(client_id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Client ids currently registered.
    pub fn client_ids(&self) -> Vec<String> {
        self.sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}

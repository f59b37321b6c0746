//! Connection registry
//!
//! Live peer sessions of one stream channel, keyed by remote id.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::peer::PeerSession;
use crate::error::{AppError, Result};

/// Concurrently accessed set of peer sessions keyed by remote id
///
/// At most one live (`Negotiating` or `Active`) session exists per remote id.
/// A `Closed` entry may linger until it is replaced or reaped.
#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: Mutex<HashMap<String, Arc<PeerSession>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session
    ///
    /// Fails with `DuplicateKey` if a live session already exists for the
    /// remote id. A closed entry under the same key is replaced.
    pub fn insert(&self, session: Arc<PeerSession>) -> Result<()> {
        let remote_id = session.remote_id().to_string();
        let mut sessions = self.sessions.lock();

        if let Some(existing) = sessions.get(&remote_id) {
            if existing.is_live() {
                return Err(AppError::DuplicateKey(remote_id));
            }
            debug!(remote_id = %remote_id, "Replacing closed session entry");
        }

        sessions.insert(remote_id, session);
        Ok(())
    }

    pub fn find(&self, remote_id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.lock().get(remote_id).cloned()
    }

    /// Find a session that is not closed
    pub fn find_live(&self, remote_id: &str) -> Option<Arc<PeerSession>> {
        self.find(remote_id).filter(|s| s.is_live())
    }

    /// Remove and return the entry for `remote_id`
    pub fn remove(&self, remote_id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.lock().remove(remote_id)
    }

    /// Remove the entry only if it is still `session`
    ///
    /// Used to clean up after a failed negotiation without evicting a newer
    /// session that replaced it.
    pub fn remove_if_same(&self, session: &Arc<PeerSession>) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(session.remote_id()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(session.remote_id());
                true
            }
            _ => false,
        }
    }

    /// Stable snapshot of every entry
    pub fn all(&self) -> Vec<Arc<PeerSession>> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn remote_ids(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Drop closed entries, returning how many were removed
    pub fn reap_closed(&self) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| s.is_live());
        before - sessions.len()
    }

    /// Close every session and empty the registry
    ///
    /// Takes a snapshot first so no lock is held across the close calls.
    /// Close errors are logged and do not stop the sweep. Returns the number
    /// of sessions this call closed.
    pub async fn close_all(&self) -> usize {
        let snapshot = self.all();
        let mut closed = 0;

        for session in &snapshot {
            match session.close().await {
                Ok(true) => closed += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    remote_id = %session.remote_id(),
                    session_id = %session.session_id(),
                    kind = e.kind(),
                    "Failed to close session: {}", e
                ),
            }
            self.remove_if_same(session);
        }

        if !snapshot.is_empty() {
            info!("Closed {} of {} session(s)", closed, snapshot.len());
        }
        closed
    }
}

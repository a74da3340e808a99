//! The set of sessions a server is currently responsible for.
//!
//! The lock is held only for the map operation itself, never across I/O or an `await`.
//! Sessions update their own state; the registry only reads it to decide what to drop.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::session::SessionHandle;
use crate::{Result, ServerError};

#[derive(Debug)]
pub struct SessionRegistry {
    max_sessions: usize,
    sessions: Mutex<HashMap<Uuid, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            max_sessions,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<SessionHandle>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Track a new session, unless the registry is already full of live ones.
    ///
    /// Finished sessions still in the map don't count against the limit; they are dropped here.
    pub fn try_add(&self, handle: Arc<SessionHandle>) -> Result<()> {
        let mut sessions = self.lock();
        sessions.retain(|_, existing| !existing.is_finished());

        if sessions.len() >= self.max_sessions {
            return Err(ServerError::ConnectionLimit {
                max: self.max_sessions,
            });
        }

        sessions.insert(handle.id(), handle);
        Ok(())
    }

    pub fn remove(&self, id: &Uuid) -> Option<Arc<SessionHandle>> {
        self.lock().remove(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<SessionHandle>> {
        self.lock().get(id).cloned()
    }

    /// Every tracked session, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<SessionHandle>> {
        let mut sessions = self.lock().values().cloned().collect::<Vec<_>>();
        sessions.sort_by_key(|handle| (handle.created_at(), handle.id()));
        sessions
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ask every session to stop.  Returns how many were signalled.
    pub fn shutdown_all(&self) -> usize {
        let sessions = self.snapshot();
        for handle in &sessions {
            handle.cancel();
        }
        sessions.len()
    }

    /// Drop sessions that have reached a terminal state.  Returns how many were dropped.
    pub fn cleanup_finished(&self) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, handle| !handle.is_finished());
        before - sessions.len()
    }
}

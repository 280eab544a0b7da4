use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};

use crate::relay::frame::Frame;
use crate::relay::{SessionId, SessionState};

/// Handle to one registered relay session.
///
/// Holds what outside parties need to observe the session and push frames towards
/// its caller. The connections themselves never leave the session's own tasks.
#[derive(Clone)]
pub struct SessionEntry {
    pub id: SessionId,
    pub started_at: DateTime<Utc>,
    state: watch::Receiver<SessionState>,
    outbox: mpsc::Sender<Frame>,
}

impl SessionEntry {
    pub fn new(
        id: SessionId,
        state: watch::Receiver<SessionState>,
        outbox: mpsc::Sender<Frame>,
    ) -> Self {
        Self {
            id,
            started_at: Utc::now(),
            state,
            outbox,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    #[cfg(test)]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Queue a frame for the caller leg without waiting.
    pub fn try_deliver(&self, frame: Frame) -> Result<(), DeliveryError> {
        self.outbox.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
    /// Registered but not active (still connecting, or tearing down).
    pub skipped: usize,
}

/// Registry of active relay sessions, keyed by session id.
///
/// The lock is only held to mutate the map or copy it; iteration runs on a snapshot,
/// so a slow broadcast never stalls session setup or teardown.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashMap<SessionId, SessionEntry>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn register(&self, entry: SessionEntry) -> Result<(), RegistryError> {
        let mut sessions = self.inner.lock().await;
        if sessions.contains_key(&entry.id) {
            tracing::error!(session_id = %entry.id, "Session id already registered");
            return Err(RegistryError::DuplicateSession(entry.id));
        }
        tracing::info!(
            session_id = %entry.id,
            active = sessions.len() + 1,
            "Session registered"
        );
        sessions.insert(entry.id.clone(), entry);
        Ok(())
    }

    /// Remove a session. Removing an unknown id is a no-op.
    pub async fn deregister(&self, id: &SessionId) {
        let mut sessions = self.inner.lock().await;
        if sessions.remove(id).is_some() {
            tracing::info!(session_id = %id, active = sessions.len(), "Session deregistered");
        }
    }

    pub async fn get(&self, id: &SessionId) -> Option<SessionEntry> {
        self.inner.lock().await.get(id).cloned()
    }

    #[cfg(test)]
    pub async fn contains(&self, id: &SessionId) -> bool {
        self.inner.lock().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<SessionEntry> {
        self.inner.lock().await.values().cloned().collect()
    }

    /// Apply `f` to every session registered at the time of the call.
    pub async fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&SessionEntry),
    {
        for entry in self.snapshot().await {
            f(&entry);
        }
    }

    /// Offer `frame` to the caller leg of every active session.
    ///
    /// Each delivery is attempted on its own; a full or closed outbox is logged and
    /// counted but does not affect the remaining sessions.
    pub async fn broadcast(&self, frame: Frame) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        self.for_each(|entry| {
            if entry.state() != SessionState::Active {
                report.skipped += 1;
                return;
            }
            match entry.try_deliver(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(session_id = %entry.id, "Broadcast delivery failed: {e}");
                    report.failed += 1;
                }
            }
        })
        .await;
        tracing::info!(
            delivered = report.delivered,
            failed = report.failed,
            skipped = report.skipped,
            "Broadcast finished"
        );
        report
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session {0} is already registered")]
    DuplicateSession(SessionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("session outbox is full")]
    Full,
    #[error("session is no longer accepting frames")]
    Closed,
}

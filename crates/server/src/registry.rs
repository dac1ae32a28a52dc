use std::collections::HashMap;
use std::sync::Arc;

use slicepull_protocol::SessionProgress;
use slicepull_transfer::{Session, SessionId};
use tokio::sync::RwLock;

/// Live sessions keyed by id.
///
/// Cloneable and cheap; clones share the same map.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new session under a freshly generated id.
    pub async fn create(&self, name: &str, size: u64) -> Arc<Session> {
        let session = Arc::new(Session::new(SessionId::generate(), name, size));
        self.sessions
            .write()
            .await
            .insert(session.id().clone(), Arc::clone(&session));
        tracing::debug!(session = %session.id(), name, size, "session registered");
        session
    }

    pub async fn lookup(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        let removed = self.sessions.write().await.remove(id);
        if removed.is_some() {
            tracing::debug!(session = %id, "session removed");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Progress of every live session, oldest first.
    pub async fn snapshots(&self) -> Vec<SessionProgress> {
        let mut snaps: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.snapshot())
            .collect();
        snaps.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        snaps
    }
}

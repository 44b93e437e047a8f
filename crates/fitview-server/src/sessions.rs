//! Registry of connected `WebSocket` clients.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fitview_types::SessionId;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

/// One connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Session identity.
    pub id: SessionId,
    /// When the client connected.
    pub connected_at: DateTime<Utc>,
}

/// Live sessions keyed by id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<BTreeMap<SessionId, SessionInfo>>,
}

impl SessionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session and return its id.
    pub async fn connect(&self) -> SessionId {
        let info = SessionInfo {
            id: SessionId::new(),
            connected_at: Utc::now(),
        };
        let id = info.id;
        let mut sessions = self.sessions.write().await;
        sessions.insert(id, info);
        info!(session_id = %id, connected = sessions.len(), "Client connected");
        id
    }

    /// Remove a session. Returns `false` if it was not registered.
    pub async fn disconnect(&self, id: SessionId) -> bool {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.remove(&id).is_some();
        if removed {
            info!(session_id = %id, connected = sessions.len(), "Client disconnected");
        }
        removed
    }

    /// Number of connected sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// All connected sessions, oldest first.
    pub async fn list(&self) -> Vec<SessionInfo> {
        self.sessions.read().await.values().cloned().collect()
    }
}

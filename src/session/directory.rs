//! Directory of connected peers

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::types::{PeerHandle, SessionId, UserId};

/// Resolves users and sessions to live peers
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Live peer of a user, if connected
    async fn resolve_peer(&self, user_id: &str) -> Option<PeerHandle>;

    /// Live peer behind a session, if connected
    async fn peer_for_session(&self, session_id: &str) -> Option<PeerHandle>;
}

/// Process-local directory fed by session connect/disconnect commands
#[derive(Debug, Default)]
pub struct InMemoryPeerDirectory {
    by_user: DashMap<UserId, PeerHandle>,
    by_session: DashMap<SessionId, UserId>,
}

impl InMemoryPeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. A user reconnecting from a new session replaces
    /// its previous one.
    pub fn connect(&self, session_id: impl Into<SessionId>, user_id: impl Into<UserId>) {
        let peer = PeerHandle {
            session_id: session_id.into(),
            user_id: user_id.into(),
        };
        if let Some(previous) = self.by_user.insert(peer.user_id.clone(), peer.clone()) {
            if previous.session_id != peer.session_id {
                self.by_session.remove(&previous.session_id);
            }
        }
        self.by_session
            .insert(peer.session_id.clone(), peer.user_id.clone());
        info!("Peer {} connected as {}", peer.session_id, peer.user_id);
    }

    /// Forget a session; returns its peer if it was connected
    pub fn disconnect(&self, session_id: &str) -> Option<PeerHandle> {
        let (_, user_id) = self.by_session.remove(session_id)?;
        let removed = self
            .by_user
            .remove_if(&user_id, |_, peer| peer.session_id == session_id)
            .map(|(_, peer)| peer);
        debug!("Peer {} disconnected", session_id);
        removed
    }

    pub fn len(&self) -> usize {
        self.by_session.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_session.is_empty()
    }
}

#[async_trait]
impl PeerDirectory for InMemoryPeerDirectory {
    async fn resolve_peer(&self, user_id: &str) -> Option<PeerHandle> {
        self.by_user.get(user_id).map(|peer| peer.value().clone())
    }

    async fn peer_for_session(&self, session_id: &str) -> Option<PeerHandle> {
        let user_id = self.by_session.get(session_id)?.value().clone();
        self.resolve_peer(&user_id).await
    }
}

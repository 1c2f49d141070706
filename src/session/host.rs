//! Game session hosting

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{GameFinderError, Result};
use crate::types::SessionId;

/// Hosts game sessions and hands out connection tokens to their players
#[async_trait]
pub trait SessionHost: Send + Sync {
    /// Create a session; returns false if it already existed
    async fn create_session(&self, session_id: &str, config: serde_json::Value) -> Result<bool>;

    /// Token that lets `player_session_id` join `session_id`
    async fn create_connection_token(
        &self,
        session_id: &str,
        player_session_id: &str,
    ) -> Result<String>;
}

/// A game session known to the local host
#[derive(Debug, Clone)]
pub struct HostedSession {
    pub id: String,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// In-process session host
#[derive(Debug, Default)]
pub struct LocalSessionHost {
    sessions: DashMap<String, HostedSession>,
    tokens: DashMap<String, (String, SessionId)>,
}

impl LocalSessionHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self, session_id: &str) -> Option<HostedSession> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Consume a token, returning (game session, player session)
    pub fn redeem_token(&self, token: &str) -> Option<(String, SessionId)> {
        self.tokens.remove(token).map(|(_, target)| target)
    }
}

#[async_trait]
impl SessionHost for LocalSessionHost {
    async fn create_session(&self, session_id: &str, config: serde_json::Value) -> Result<bool> {
        match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(_) => {
                debug!("Game session {} already exists", session_id);
                Ok(false)
            }
            Entry::Vacant(entry) => {
                entry.insert(HostedSession {
                    id: session_id.to_string(),
                    config,
                    created_at: Utc::now(),
                });
                info!("Created game session {}", session_id);
                Ok(true)
            }
        }
    }

    async fn create_connection_token(
        &self,
        session_id: &str,
        player_session_id: &str,
    ) -> Result<String> {
        if !self.sessions.contains_key(session_id) {
            return Err(GameFinderError::InternalError {
                message: format!("Unknown game session {}", session_id),
            }
            .into());
        }

        let token = Uuid::new_v4().simple().to_string();
        self.tokens.insert(
            token.clone(),
            (session_id.to_string(), player_session_id.to_string()),
        );
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_session_is_idempotent() {
        let host = LocalSessionHost::new();

        assert!(host.create_session("gs-1", json!({"teams": 2})).await.unwrap());
        assert!(!host.create_session("gs-1", json!({})).await.unwrap());
        assert_eq!(host.session_count(), 1);
        assert_eq!(host.session("gs-1").unwrap().config["teams"], 2);
    }

    #[tokio::test]
    async fn test_connection_tokens() {
        let host = LocalSessionHost::new();
        assert!(host.create_connection_token("gs-1", "s1").await.is_err());

        host.create_session("gs-1", json!({})).await.unwrap();
        let token = host.create_connection_token("gs-1", "s1").await.unwrap();

        assert_eq!(
            host.redeem_token(&token),
            Some(("gs-1".to_string(), "s1".to_string()))
        );
        assert!(host.redeem_token(&token).is_none());
    }
}

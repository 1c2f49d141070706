//! Notification fan-out to the live peers of groups and games

use std::sync::Arc;
use tracing::warn;

use crate::amqp::publisher::Notifier;
use crate::error::Result;
use crate::session::PeerDirectory;
use crate::types::{Game, Group, Notification, PeerHandle, Player, Priority, Reliability};

/// Resolves players to their live peers and sends them notifications with
/// medium priority and reliable delivery. Disconnected players are skipped.
#[derive(Clone)]
pub struct Broadcaster {
    notifier: Arc<dyn Notifier>,
    directory: Arc<dyn PeerDirectory>,
}

impl Broadcaster {
    pub fn new(notifier: Arc<dyn Notifier>, directory: Arc<dyn PeerDirectory>) -> Self {
        Self {
            notifier,
            directory,
        }
    }

    pub fn directory(&self) -> &Arc<dyn PeerDirectory> {
        &self.directory
    }

    /// Live peers of `players`
    pub async fn peers<'a>(&self, players: impl IntoIterator<Item = &'a Player>) -> Vec<PeerHandle> {
        let mut peers = Vec::new();
        for player in players {
            if let Some(peer) = self.directory.resolve_peer(&player.user_id).await {
                peers.push(peer);
            }
        }
        peers
    }

    /// Send to specific peers, reporting delivery errors
    pub async fn send(&self, peers: &[PeerHandle], notification: Notification) -> Result<()> {
        if peers.is_empty() {
            return Ok(());
        }
        self.notifier
            .broadcast(peers, &notification, Priority::Medium, Reliability::Reliable)
            .await
    }

    /// Best-effort send to every live member of `group`
    pub async fn to_group(&self, group: &Group, notification: Notification) {
        let peers = self.peers(group.players()).await;
        self.deliver(&peers, notification).await;
    }

    /// Best-effort send to every live player of `game`
    pub async fn to_game(&self, game: &Game, notification: Notification) {
        let peers = self.peers(game.all_players()).await;
        self.deliver(&peers, notification).await;
    }

    async fn deliver(&self, peers: &[PeerHandle], notification: Notification) {
        let route = notification.route();
        if let Err(e) = self.send(peers, notification).await {
            warn!("Failed to deliver {} to {} peer(s): {}", route, peers.len(), e);
        }
    }
}

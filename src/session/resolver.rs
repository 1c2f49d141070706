//! Resolver handing found games off to hosted game sessions

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

use super::host::SessionHost;
use crate::error::Result;
use crate::finder::resolution::{GameResolution, Resolver, WriterContext};
use crate::types::Game;

/// Creates a `gs-<game id>` session per game and gives every player a
/// `connectionToken` for it. Games built for a requested game id share the
/// `gs-<requested id>` session.
pub struct SessionResolver {
    host: Arc<dyn SessionHost>,
}

impl SessionResolver {
    pub fn new(host: Arc<dyn SessionHost>) -> Self {
        Self { host }
    }

    pub fn session_id_for(game: &Game) -> String {
        format!("gs-{}", game.requested_id().unwrap_or(&game.id))
    }

    fn session_config(game: &Game) -> Value {
        let teams: Vec<Vec<&str>> = game
            .teams
            .iter()
            .map(|team| {
                team.groups
                    .iter()
                    .flat_map(|g| g.players().iter().map(|p| p.user_id.as_str()))
                    .collect()
            })
            .collect();
        json!({
            "gameId": game.id,
            "teams": teams,
            "customData": game.custom_data,
        })
    }

    /// Create the session, treating an existing one as success
    async fn ensure_session(&self, game: &Game) -> Result<String> {
        let session_id = Self::session_id_for(game);
        let created = self
            .host
            .create_session(&session_id, Self::session_config(game))
            .await?;
        if !created {
            debug!("Reusing game session {}", session_id);
        }
        Ok(session_id)
    }
}

fn write_connection_token(context: &mut WriterContext<'_>) -> Result<()> {
    let token = context.connection_token.map(str::to_string);
    let session_id = context.session_id.map(str::to_string);
    context.write("sessionId", session_id)?;
    context.write("connectionToken", token)
}

#[async_trait]
impl Resolver for SessionResolver {
    async fn prepare_game_resolution(&self, games: &[Arc<Game>]) -> Result<()> {
        for game in games {
            self.ensure_session(game).await?;
        }
        info!("Prepared {} game session(s)", games.len());
        Ok(())
    }

    async fn resolve_game(&self, game: &Game) -> Result<GameResolution> {
        let session_id = self.ensure_session(game).await?;
        Ok(GameResolution {
            session_id: Some(session_id),
            writer: Some(Arc::new(write_connection_token)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::host::LocalSessionHost;
    use crate::types::{Group, GroupData, Player, Team};

    fn game() -> Arc<Game> {
        let group = Arc::new(Group::new(vec![Player::new("s1", "alice")], GroupData::None));
        Arc::new(Game::with_id("g-1", vec![Team::new(vec![group])]))
    }

    #[tokio::test]
    async fn test_prepare_then_resolve_reuses_session() {
        let host = Arc::new(LocalSessionHost::new());
        let resolver = SessionResolver::new(host.clone());
        let game = game();

        resolver.prepare_game_resolution(&[game.clone()]).await.unwrap();
        let resolution = resolver.resolve_game(&game).await.unwrap();

        assert_eq!(resolution.session_id.as_deref(), Some("gs-g-1"));
        assert_eq!(host.session_count(), 1);
        let config = host.session("gs-g-1").unwrap().config;
        assert_eq!(config["teams"][0][0], "alice");
    }

    #[tokio::test]
    async fn test_requested_games_share_one_session() {
        let host = Arc::new(LocalSessionHost::new());
        let resolver = SessionResolver::new(host.clone());
        let team = |session: &str| {
            Team::new(vec![Arc::new(Group::new(
                vec![Player::new(session, session)],
                GroupData::None,
            ))])
        };
        let early = Game::requested("duel", vec![team("s1")]);
        let late = Game::requested("duel", vec![team("s2")]);
        assert_ne!(early.id, late.id);

        let first = resolver.resolve_game(&early).await.unwrap();
        let second = resolver.resolve_game(&late).await.unwrap();

        assert_eq!(first.session_id.as_deref(), Some("gs-duel"));
        assert_eq!(second.session_id, first.session_id);
        assert_eq!(host.session_count(), 1);
    }

    #[tokio::test]
    async fn test_writer_emits_connection_token() {
        let host = Arc::new(LocalSessionHost::new());
        let resolver = SessionResolver::new(host.clone());
        let game = game();
        let resolution = resolver.resolve_game(&game).await.unwrap();
        let writer = resolution.writer.unwrap();

        let peer = crate::types::PeerHandle {
            session_id: "s1".to_string(),
            user_id: "alice".to_string(),
        };
        let token = host.create_connection_token("gs-g-1", "s1").await.unwrap();
        let mut context = WriterContext::for_player(&game, &peer, Some("gs-g-1"), Some(&token));
        writer(&mut context).unwrap();
        let payload = context.into_payload();

        assert_eq!(payload["gameId"], "g-1");
        assert_eq!(payload["sessionId"], "gs-g-1");
        assert_eq!(payload["connectionToken"], token.as_str());
    }
}

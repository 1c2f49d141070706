//! Turning accepted games into live sessions

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::StrategySettings;
use crate::error::{ClientError, GameFinderError, Result};
use crate::finder::broadcast::Broadcaster;
use crate::finder::ready_check::{ReadyCheckCoordinator, ReadyCheckGuard, StateChangedHook};
use crate::finder::registry::RequestRegistry;
use crate::finder::request::Settlement;
use crate::finder::stats::GameFinderStats;
use crate::session::SessionHost;
use crate::types::{
    Game, GameContext, Notification, PeerHandle, ReadyCheckUpdate, RequestState,
    StatusUpdate,
};

/// Reason sent to players whose game could not be resolved
pub const RESOLUTION_FAILED: &str = "resolutionFailed";

/// Per-player payload writer produced by a resolver
pub type ResolutionWriter = Arc<dyn Fn(&mut WriterContext<'_>) -> Result<()> + Send + Sync>;

/// What a resolver decided for one game
#[derive(Clone, Default)]
pub struct GameResolution {
    /// Session the players are handed off to
    pub session_id: Option<String>,
    pub writer: Option<ResolutionWriter>,
}

impl std::fmt::Debug for GameResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameResolution")
            .field("session_id", &self.session_id)
            .field("writer", &self.writer.is_some())
            .finish()
    }
}

/// Success payload being written for one player
pub struct WriterContext<'a> {
    pub game: &'a Game,
    pub player: &'a PeerHandle,
    pub session_id: Option<&'a str>,
    pub connection_token: Option<&'a str>,
    payload: Map<String, Value>,
}

impl<'a> WriterContext<'a> {
    /// Fresh payload for one player, pre-filled with the game id
    pub fn for_player(
        game: &'a Game,
        player: &'a PeerHandle,
        session_id: Option<&'a str>,
        connection_token: Option<&'a str>,
    ) -> Self {
        let mut payload = Map::new();
        payload.insert("gameId".to_string(), Value::String(game.id.clone()));
        Self {
            game,
            player,
            session_id,
            connection_token,
            payload,
        }
    }

    /// Set a field of the payload
    pub fn write<T: Serialize>(&mut self, key: &str, value: T) -> Result<()> {
        self.payload
            .insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn into_payload(self) -> Value {
        Value::Object(self.payload)
    }
}

/// Pluggable component turning an accepted game into a live session
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Called once per pass with every game accepted in it
    async fn prepare_game_resolution(&self, games: &[Arc<Game>]) -> Result<()>;

    async fn resolve_game(&self, game: &Game) -> Result<GameResolution>;

    /// Apply reloaded settings
    fn refresh_config(&self, _settings: &StrategySettings) {}
}

/// Runs resolution for the games found by a pass
#[derive(Clone)]
pub struct ResolutionPipeline {
    resolver: Arc<dyn Resolver>,
    host: Arc<dyn SessionHost>,
    broadcaster: Broadcaster,
    registry: Arc<RequestRegistry>,
    ready_checks: Arc<ReadyCheckCoordinator>,
    stats: Arc<GameFinderStats>,
}

impl ResolutionPipeline {
    pub fn new(
        resolver: Arc<dyn Resolver>,
        host: Arc<dyn SessionHost>,
        broadcaster: Broadcaster,
        registry: Arc<RequestRegistry>,
        ready_checks: Arc<ReadyCheckCoordinator>,
        stats: Arc<GameFinderStats>,
    ) -> Self {
        Self {
            resolver,
            host,
            broadcaster,
            registry,
            ready_checks,
            stats,
        }
    }

    pub fn resolver(&self) -> &Arc<dyn Resolver> {
        &self.resolver
    }

    /// Batched preparation for every game of a pass
    pub async fn prepare(&self, games: &[Arc<Game>]) -> Result<()> {
        if games.is_empty() {
            return Ok(());
        }
        self.resolver.prepare_game_resolution(games).await
    }

    /// Resolve one game end to end. `ready_check_timeout` runs a ready check
    /// first when set. Errors are handled here and never reach the caller.
    pub async fn run(&self, game: Arc<Game>, ready_check_timeout: Option<Duration>) {
        // Open before any await so early answers and departures are not lost
        let check = ready_check_timeout.map(|timeout| (self.open_ready_check(&game), timeout));

        let resolution = match self.resolver.resolve_game(&game).await {
            Ok(resolution) => resolution,
            Err(e) => {
                let err = GameFinderError::ResolutionFailed {
                    game_id: game.id.clone(),
                    reason: e.to_string(),
                };
                error!("{}", err);
                self.fail_game(&game);
                return;
            }
        };

        if let Some((guard, timeout)) = check {
            if !self.ready_check(&game, guard, timeout).await {
                return;
            }
        }

        self.distribute(&game, &resolution).await;

        let context = GameContext {
            game: game.clone(),
            session_id: resolution.session_id.clone(),
        };
        let mut settled = 0;
        for group in game.all_groups() {
            if let Some(request) = self.registry.get(group.id()) {
                if request.settle(Settlement::Resolved(context.clone())) {
                    settled += 1;
                }
            }
        }
        info!(
            "Resolved game {} ({} group(s) settled, session {:?})",
            game.id, settled, resolution.session_id
        );
    }

    /// Register the ready check of `game`. Groups that already left count as
    /// removed.
    fn open_ready_check(&self, game: &Arc<Game>) -> ReadyCheckGuard {
        let broadcaster = self.broadcaster.clone();
        let tally_game = game.clone();
        let hook: StateChangedHook = Box::new(move |update: ReadyCheckUpdate| {
            let broadcaster = broadcaster.clone();
            let game = tally_game.clone();
            tokio::spawn(async move {
                broadcaster
                    .to_game(&game, Notification::ReadyCheck(update))
                    .await;
            });
        });

        let guard = self.ready_checks.create(game.clone(), Some(hook));
        for group in game.all_groups() {
            let gone = self
                .registry
                .get(group.id())
                .map_or(true, |request| request.is_settled());
            if gone {
                guard.group_removed(group.id());
            }
        }
        guard
    }

    /// Run the ready check; returns true when every player accepted
    async fn ready_check(
        &self,
        game: &Arc<Game>,
        guard: ReadyCheckGuard,
        timeout: Duration,
    ) -> bool {
        self.broadcaster
            .to_game(game, Notification::Status(StatusUpdate::WaitingPlayersReady))
            .await;

        let result = guard.wait(timeout).await;
        drop(guard);

        if result.success {
            self.stats.record_ready_check_passed();
            return true;
        }
        self.stats.record_ready_check_failed();

        for (group, reason) in &result.unready_groups {
            if let Some(request) = self.registry.get(group.id()) {
                if request.cancel(*reason) {
                    debug!("Cancelled {} after ready check: {}", group.id(), reason);
                }
            }
        }

        for group in &result.ready_groups {
            let Some(request) = self.registry.get(group.id()) else {
                continue;
            };
            request.clear_candidate();
            if request.transition(RequestState::Found, RequestState::Ready) {
                debug!("Requeued {} after failed ready check", group.id());
                self.broadcaster
                    .to_group(group, Notification::Status(StatusUpdate::SearchStart))
                    .await;
            }
        }
        false
    }

    /// Send the success payload to every live player. A failure only affects
    /// the player it happened for.
    async fn distribute(&self, game: &Game, resolution: &GameResolution) {
        let peers = self.broadcaster.peers(game.all_players()).await;
        for peer in &peers {
            let notification = match self.player_payload(game, resolution, peer).await {
                Ok(payload) => Notification::Status(StatusUpdate::Success { payload }),
                Err(e) => {
                    error!(
                        "An error occurred while resolving game {} for {}: {:#}",
                        game.id, peer.user_id, e
                    );
                    self.stats.record_player_resolution_failure();
                    Notification::Status(StatusUpdate::Failed {
                        reason: Some(RESOLUTION_FAILED.to_string()),
                    })
                }
            };
            if let Err(e) = self
                .broadcaster
                .send(std::slice::from_ref(peer), notification)
                .await
            {
                warn!("Failed to notify {} of game {}: {}", peer.session_id, game.id, e);
            }
        }
    }

    async fn player_payload(
        &self,
        game: &Game,
        resolution: &GameResolution,
        peer: &PeerHandle,
    ) -> Result<Value> {
        let token = match &resolution.session_id {
            Some(session_id) => Some(
                self.host
                    .create_connection_token(session_id, &peer.session_id)
                    .await?,
            ),
            None => None,
        };

        let mut context = WriterContext::for_player(
            game,
            peer,
            resolution.session_id.as_deref(),
            token.as_deref(),
        );
        if let Some(writer) = &resolution.writer {
            writer(&mut context)?;
        }
        Ok(context.into_payload())
    }

    /// Settle every group of a game that could not be resolved at all
    fn fail_game(&self, game: &Game) {
        for group in game.all_groups() {
            if let Some(request) = self.registry.get(group.id()) {
                request.fail(ClientError::Rejected {
                    reason: RESOLUTION_FAILED.to_string(),
                });
            }
        }
    }
}

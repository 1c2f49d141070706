//! Strategy that never mixes unrelated groups

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::{GameFinderContext, GameFinderResult, MatchingStrategy};
use crate::config::StrategySettings;
use crate::error::Result;
use crate::types::{Game, Group, Team};

/// Puts every group in a game of its own, except groups of one pass that
/// asked for the same game id: those share one game, one team per group.
#[derive(Debug, Default)]
pub struct SoloStrategy;

impl SoloStrategy {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MatchingStrategy for SoloStrategy {
    async fn find_games(&self, context: &GameFinderContext) -> Result<GameFinderResult> {
        let mut result = GameFinderResult::default();
        let mut by_game_id: HashMap<&str, Vec<Arc<Group>>> = HashMap::new();
        let mut order: Vec<&str> = Vec::new();

        for group in &context.waiting_groups {
            let requested = group
                .data()
                .parameters()
                .and_then(|p| p.game_id.as_deref());
            match requested {
                Some(game_id) => {
                    let groups = by_game_id.entry(game_id).or_insert_with(|| {
                        order.push(game_id);
                        Vec::new()
                    });
                    groups.push(group.clone());
                }
                None => result
                    .games
                    .push(Game::new(vec![Team::new(vec![group.clone()])])),
            }
        }

        for game_id in order {
            if let Some(groups) = by_game_id.remove(game_id) {
                let teams = groups.into_iter().map(|g| Team::new(vec![g])).collect();
                result.games.push(Game::requested(game_id, teams));
            }
        }

        debug!(
            "Solo strategy built {} game(s) from {} group(s)",
            result.games.len(),
            context.waiting_groups.len()
        );
        Ok(result)
    }

    fn refresh_config(&self, _settings: &StrategySettings) {}
}

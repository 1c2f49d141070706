//! Rating-aware team building using the Weng-Lin (OpenSkill) model

use async_trait::async_trait;
use serde_json::json;
use skillratings::weng_lin::{WengLinConfig, WengLinRating};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use super::{GameFinderContext, GameFinderResult, MatchingStrategy};
use crate::config::StrategySettings;
use crate::error::Result;
use crate::types::{Game, Group, PlayerRating, Team};

/// Rejection reason for groups that can never fit in a team
pub const GROUP_TOO_LARGE: &str = "groupTooLarge";

/// Sorts waiting groups by rating and packs neighbours into games of
/// `team_count` teams of exactly `team_size` players.
///
/// A candidate game is only formed when the rating gap between its lowest and
/// highest group stays within `max_rating_spread`. Groups that do not fit this
/// pass stay waiting for the next one.
#[derive(Debug)]
pub struct RatingStrategy {
    settings: RwLock<StrategySettings>,
    weng_lin_config: WengLinConfig,
}

impl RatingStrategy {
    pub fn new(settings: StrategySettings) -> Self {
        Self {
            settings: RwLock::new(settings),
            weng_lin_config: WengLinConfig {
                beta: 200.0,
                uncertainty_tolerance: 0.0001,
            },
        }
    }

    fn settings(&self) -> StrategySettings {
        match self.settings.read() {
            Ok(settings) => settings.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn group_rating(group: &Group) -> PlayerRating {
        group
            .data()
            .parameters()
            .and_then(|p| p.rating.clone())
            .unwrap_or_default()
    }

    /// Assign groups to teams, largest groups first, each into the fitting
    /// team with the lowest accumulated rating
    fn assign_teams(
        groups: &[(Arc<Group>, PlayerRating)],
        team_count: usize,
        team_size: usize,
    ) -> Option<Vec<Team>> {
        let mut sorted: Vec<&(Arc<Group>, PlayerRating)> = groups.iter().collect();
        sorted.sort_by(|a, b| b.0.players().len().cmp(&a.0.players().len()));

        let mut teams: Vec<(Vec<Arc<Group>>, usize, f64)> = vec![(Vec::new(), 0, 0.0); team_count];
        for (group, rating) in sorted {
            let size = group.players().len();
            let target = teams
                .iter_mut()
                .filter(|(_, filled, _)| filled + size <= team_size)
                .min_by(|a, b| a.2.total_cmp(&b.2))?;
            target.0.push(group.clone());
            target.1 += size;
            target.2 += rating.rating * size as f64;
        }

        if teams.iter().any(|(_, filled, _)| *filled != team_size) {
            return None;
        }
        Some(teams.into_iter().map(|(groups, _, _)| Team::new(groups)).collect())
    }

    /// Quality in [0, 1]: 1 when every rating is identical, falling to 0 as the
    /// standard deviation reaches beta
    fn match_quality(&self, ratings: &[f64]) -> f64 {
        if ratings.len() < 2 {
            return 1.0;
        }
        let mean = ratings.iter().sum::<f64>() / ratings.len() as f64;
        let variance =
            ratings.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / ratings.len() as f64;
        (1.0 - (variance.sqrt() / self.weng_lin_config.beta).min(1.0)).max(0.0)
    }

    /// Expected score of the first team against the second
    fn first_team_expectation(&self, teams: &[Team], ratings: &[(Arc<Group>, PlayerRating)]) -> f64 {
        let team_rating = |team: &Team| -> WengLinRating {
            let members: Vec<&PlayerRating> = ratings
                .iter()
                .filter(|(g, _)| team.groups.iter().any(|t| t.id() == g.id()))
                .map(|(_, r)| r)
                .collect();
            let count = members.len().max(1) as f64;
            WengLinRating {
                rating: members.iter().map(|r| r.rating).sum::<f64>() / count,
                uncertainty: (members.iter().map(|r| r.uncertainty.powi(2)).sum::<f64>() / count)
                    .sqrt(),
            }
        };

        match (teams.first(), teams.get(1)) {
            (Some(first), Some(second)) => {
                let (expected, _) = skillratings::weng_lin::expected_score(
                    &team_rating(first),
                    &team_rating(second),
                    &self.weng_lin_config,
                );
                expected
            }
            _ => 0.5,
        }
    }

    fn build_game(&self, window: &[(Arc<Group>, PlayerRating)], settings: &StrategySettings) -> Option<Game> {
        let teams = Self::assign_teams(window, settings.team_count, settings.team_size)?;
        let ratings: Vec<f64> = window.iter().map(|(_, r)| r.rating).collect();
        let average = ratings.iter().sum::<f64>() / ratings.len() as f64;

        let mut game = Game::new(teams);
        game.custom_data = Some(json!({
            "averageRating": average,
            "quality": self.match_quality(&ratings),
            "expectedScore": self.first_team_expectation(&game.teams, window),
        }));
        Some(game)
    }
}

#[async_trait]
impl MatchingStrategy for RatingStrategy {
    async fn find_games(&self, context: &GameFinderContext) -> Result<GameFinderResult> {
        let settings = self.settings();
        let needed = settings.team_count * settings.team_size;
        let mut result = GameFinderResult::default();

        let mut rated: Vec<(Arc<Group>, PlayerRating)> = Vec::new();
        for group in &context.waiting_groups {
            if group.players().len() > settings.team_size {
                debug!(
                    "{} has {} players, more than a team of {}",
                    group.id(),
                    group.players().len(),
                    settings.team_size
                );
                result.failed.push((group.clone(), GROUP_TOO_LARGE.to_string()));
                continue;
            }
            rated.push((group.clone(), Self::group_rating(group)));
        }
        rated.sort_by(|a, b| a.1.rating.total_cmp(&b.1.rating));

        let mut window: VecDeque<(Arc<Group>, PlayerRating)> = VecDeque::new();
        let mut window_players = 0usize;
        for entry in rated {
            window_players += entry.0.players().len();
            window.push_back(entry);

            loop {
                let spread = match (window.front(), window.back()) {
                    (Some(low), Some(high)) => high.1.rating - low.1.rating,
                    _ => break,
                };
                if spread <= settings.max_rating_spread && window_players <= needed {
                    break;
                }
                if let Some((dropped, _)) = window.pop_front() {
                    window_players -= dropped.players().len();
                }
            }

            if window_players == needed {
                let candidate: Vec<(Arc<Group>, PlayerRating)> = window.iter().cloned().collect();
                match self.build_game(&candidate, &settings) {
                    Some(game) => {
                        result.games.push(game);
                        window.clear();
                        window_players = 0;
                    }
                    None => {
                        if let Some((dropped, _)) = window.pop_front() {
                            window_players -= dropped.players().len();
                        }
                    }
                }
            }
        }

        info!(
            "Rating strategy built {} game(s), rejected {} group(s), {} group(s) left waiting",
            result.games.len(),
            result.failed.len(),
            context.waiting_groups.len()
                - result.failed.len()
                - result.games.iter().map(|g| g.all_groups().count()).sum::<usize>()
        );
        Ok(result)
    }

    fn refresh_config(&self, settings: &StrategySettings) {
        match self.settings.write() {
            Ok(mut current) => *current = settings.clone(),
            Err(poisoned) => *poisoned.into_inner() = settings.clone(),
        }
    }
}

//! Matching strategies
//!
//! A strategy looks at every group waiting in a pass and proposes games.
//! It may also reject groups it can never place; those requests fail with
//! the reason the strategy gives.

pub mod rating;
pub mod solo;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{StrategyKind, StrategySettings};
use crate::error::Result;
use crate::types::{Game, Group};

pub use rating::RatingStrategy;
pub use solo::SoloStrategy;

/// Groups claimed by the current pass, in snapshot order
#[derive(Debug, Clone, Default)]
pub struct GameFinderContext {
    pub waiting_groups: Vec<Arc<Group>>,
}

impl GameFinderContext {
    pub fn new(waiting_groups: Vec<Arc<Group>>) -> Self {
        Self { waiting_groups }
    }
}

/// Output of one strategy run
#[derive(Debug, Clone, Default)]
pub struct GameFinderResult {
    pub games: Vec<Game>,
    /// Groups rejected outright, with a machine-readable reason
    pub failed: Vec<(Arc<Group>, String)>,
}

/// Pluggable matching algorithm run once per pass
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MatchingStrategy: Send + Sync {
    async fn find_games(&self, context: &GameFinderContext) -> Result<GameFinderResult>;

    /// Apply reloaded settings; takes effect on the next pass
    fn refresh_config(&self, settings: &StrategySettings);
}

/// Build the bundled strategy selected by `settings.kind`
pub fn from_settings(settings: &StrategySettings) -> Arc<dyn MatchingStrategy> {
    match settings.kind {
        StrategyKind::Solo => Arc::new(SoloStrategy::new()),
        StrategyKind::Rating => Arc::new(RatingStrategy::new(settings.clone())),
    }
}

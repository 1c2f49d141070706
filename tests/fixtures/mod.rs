//! Test fixtures shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use game_finder::amqp::publisher::MockNotifier;
use game_finder::config::{GameFinderSettings, StrategySettings};
use game_finder::error::{GameFinderError, Result};
use game_finder::finder::{
    DataExtractor, FindGameOutcome, GameFinderService, GroupDraft, ParametersExtractor,
};
use game_finder::session::{InMemoryPeerDirectory, LocalSessionHost, SessionResolver};
use game_finder::strategy::{GameFinderContext, GameFinderResult, MatchingStrategy};
use game_finder::types::{Game, Notification, PeerHandle, RequestState, StatusUpdate, Team};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Pairs waiting groups in arrival order into two-team games
#[derive(Debug, Default)]
pub struct PairingStrategy {
    refreshes: AtomicUsize,
}

impl PairingStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MatchingStrategy for PairingStrategy {
    async fn find_games(&self, context: &GameFinderContext) -> Result<GameFinderResult> {
        let mut groups = context.waiting_groups.clone();
        groups.sort_by_key(|group| group.created_at());
        let games = groups
            .chunks_exact(2)
            .map(|pair| {
                Game::new(vec![
                    Team::new(vec![pair[0].clone()]),
                    Team::new(vec![pair[1].clone()]),
                ])
            })
            .collect();
        Ok(GameFinderResult {
            games,
            failed: Vec::new(),
        })
    }

    fn refresh_config(&self, _settings: &StrategySettings) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Extractor failing on every payload
#[derive(Debug, Default)]
pub struct FailingExtractor;

#[async_trait]
impl DataExtractor for FailingExtractor {
    async fn extract_data(
        &self,
        _payload: &[u8],
        _requester: &PeerHandle,
        _group: &mut GroupDraft,
    ) -> Result<bool> {
        Err(GameFinderError::InvalidCommand {
            reason: "extractor exploded".to_string(),
        }
        .into())
    }
}

/// A game finder wired to in-memory collaborators
pub struct TestSystem {
    pub finder: Arc<GameFinderService>,
    pub notifier: Arc<MockNotifier>,
    pub directory: Arc<InMemoryPeerDirectory>,
    pub host: Arc<LocalSessionHost>,
}

impl TestSystem {
    pub fn new(strategy: Arc<dyn MatchingStrategy>, settings: GameFinderSettings) -> Self {
        Self::with_extractor(strategy, settings, Arc::new(ParametersExtractor::new()))
    }

    pub fn with_extractor(
        strategy: Arc<dyn MatchingStrategy>,
        settings: GameFinderSettings,
        extractor: Arc<dyn DataExtractor>,
    ) -> Self {
        let notifier = Arc::new(MockNotifier::new());
        let directory = Arc::new(InMemoryPeerDirectory::new());
        let host = Arc::new(LocalSessionHost::new());
        let finder = GameFinderService::builder(
            strategy,
            Arc::new(SessionResolver::new(host.clone())),
            host.clone(),
            notifier.clone(),
            directory.clone(),
        )
        .extractor(extractor)
        .settings(settings)
        .build()
        .expect("valid test settings");

        Self {
            finder,
            notifier,
            directory,
            host,
        }
    }

    /// Connect sessions `s1..sN` as users `player-1..player-N`
    pub fn connect_players(&self, count: usize) {
        for i in 1..=count {
            self.directory
                .connect(format!("s{}", i), format!("player-{}", i));
        }
    }

    pub fn find(
        &self,
        session: &str,
        payload: &str,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<FindGameOutcome>> {
        let finder = self.finder.clone();
        let session = session.to_string();
        let payload = payload.as_bytes().to_vec();
        tokio::spawn(async move { finder.find_game(&payload, &session, cancel).await })
    }

    /// Wait until the session's group is searching
    pub async fn wait_ready(&self, session: &str) {
        let finder = self.finder.clone();
        wait_until(|| {
            finder
                .registry()
                .lookup_by_player(session)
                .map(|request| request.state() == RequestState::Ready)
                .unwrap_or(false)
        })
        .await;
    }

    pub fn statuses(&self, session: &str) -> Vec<StatusUpdate> {
        self.notifier
            .sent_to(session)
            .into_iter()
            .filter_map(|notification| match notification {
                Notification::Status(status) => Some(status),
                _ => None,
            })
            .collect()
    }
}

pub fn ready_check_settings(timeout_ms: u64) -> GameFinderSettings {
    let mut settings = GameFinderSettings::default();
    settings.ready_check.enabled = true;
    settings.ready_check.timeout_ms = timeout_ms;
    settings
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

//! Periodic matching passes

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::GameFinderSettings;
use crate::error::{ClientError, GameFinderError, Result};
use crate::finder::registry::RequestRegistry;
use crate::finder::request::PendingRequest;
use crate::finder::resolution::ResolutionPipeline;
use crate::finder::stats::GameFinderStats;
use crate::metrics::MetricsCollector;
use crate::strategy::{GameFinderContext, MatchingStrategy};
use crate::types::{Game, GroupId, RequestState};

/// Summary of one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassOutcome {
    /// Groups claimed for the pass
    pub claimed: usize,
    /// Games handed to resolution
    pub games: usize,
    /// Groups rejected by the strategy
    pub rejected: usize,
}

/// Drives matching passes over the registry. One pass runs at a time.
pub struct PassRunner {
    registry: Arc<RequestRegistry>,
    strategy: Arc<dyn MatchingStrategy>,
    pipeline: ResolutionPipeline,
    settings: watch::Receiver<GameFinderSettings>,
    stats: Arc<GameFinderStats>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl PassRunner {
    pub fn new(
        registry: Arc<RequestRegistry>,
        strategy: Arc<dyn MatchingStrategy>,
        pipeline: ResolutionPipeline,
        settings: watch::Receiver<GameFinderSettings>,
        stats: Arc<GameFinderStats>,
    ) -> Self {
        Self {
            registry,
            strategy,
            pipeline,
            settings,
            stats,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsCollector>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Run passes until `shutdown` fires. A settings change while resting
    /// re-arms the wait with the new interval.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Game finder pass loop started");
        let mut settings = self.settings.clone();
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let started = Instant::now();
            match self.run_pass().await {
                Ok(outcome) if outcome.claimed > 0 => debug!(
                    "Pass finished in {:?}: {} claimed, {} game(s), {} rejected",
                    started.elapsed(),
                    outcome.claimed,
                    outcome.games,
                    outcome.rejected
                ),
                Ok(_) => {}
                Err(e) => {
                    self.stats.record_pass_failure();
                    error!("Game finder pass failed: {:#}", e);
                }
            }
            if let Some(metrics) = &self.metrics {
                metrics.record_pass(started.elapsed());
            }

            if !rest(&mut settings, &shutdown).await {
                break;
            }
        }
        info!("Game finder pass loop stopped");
    }

    /// Run a single pass. Every group claimed here is back to `Ready` when
    /// this returns unless it was rejected or moved into a game.
    pub async fn run_pass(&self) -> Result<PassOutcome> {
        let claimed = self.registry.claim_ready();
        if claimed.is_empty() {
            return Ok(PassOutcome::default());
        }
        self.stats.record_pass();

        let result = self.match_claimed(&claimed).await;

        for request in &claimed {
            request.transition(RequestState::Searching, RequestState::Ready);
        }
        result
    }

    async fn match_claimed(&self, claimed: &[Arc<PendingRequest>]) -> Result<PassOutcome> {
        let by_id: HashMap<GroupId, &Arc<PendingRequest>> = claimed
            .iter()
            .map(|request| (request.group().id(), request))
            .collect();
        let context = GameFinderContext::new(
            claimed.iter().map(|request| request.group().clone()).collect(),
        );

        let found = self
            .strategy
            .find_games(&context)
            .await
            .map_err(|e| GameFinderError::StrategyFailed {
                reason: format!("{:#}", e),
            })?;

        let mut outcome = PassOutcome {
            claimed: claimed.len(),
            ..Default::default()
        };

        let mut rejected: HashSet<GroupId> = HashSet::new();
        for (group, reason) in found.failed {
            let Some(request) = by_id.get(&group.id()) else {
                warn!("Strategy rejected {} which is not part of this pass", group.id());
                continue;
            };
            rejected.insert(group.id());
            if request.fail(ClientError::Rejected {
                reason: reason.clone(),
            }) {
                info!("{} rejected by strategy: {}", group.id(), reason);
                self.stats.record_rejected_group();
                outcome.rejected += 1;
            }
        }

        let mut accepted: Vec<Arc<Game>> = Vec::new();
        let mut used: HashSet<GroupId> = HashSet::new();
        for game in found.games {
            if let Some(game) = self.claim_game(game, &by_id, &rejected, &mut used) {
                accepted.push(game);
            }
        }

        if let Err(e) = self.pipeline.prepare(&accepted).await {
            for game in &accepted {
                for group in game.all_groups() {
                    if let Some(request) = by_id.get(&group.id()) {
                        request.clear_candidate();
                        request.transition(RequestState::Found, RequestState::Searching);
                    }
                }
            }
            return Err(e.context("Game resolution preparation failed"));
        }

        let ready_check_timeout = {
            let settings = self.settings.borrow();
            settings
                .ready_check
                .enabled
                .then(|| settings.ready_check_timeout())
        };

        self.stats.record_games_found(accepted.len() as u64);
        outcome.games = accepted.len();
        for game in accepted {
            info!(
                "Found game {} with {} group(s)",
                game.id,
                game.all_groups().count()
            );
            let pipeline = self.pipeline.clone();
            let game_id = game.id.clone();
            spawn_supervised(game_id, async move {
                pipeline.run(game, ready_check_timeout).await;
            });
        }

        Ok(outcome)
    }

    /// Move every group of `game` to `Found`, or none of them. Games touching
    /// rejected, foreign or already used groups are dropped.
    fn claim_game(
        &self,
        game: Game,
        by_id: &HashMap<GroupId, &Arc<PendingRequest>>,
        rejected: &HashSet<GroupId>,
        used: &mut HashSet<GroupId>,
    ) -> Option<Arc<Game>> {
        let game = Arc::new(game);
        let group_ids: Vec<GroupId> = game.all_groups().map(|g| g.id()).collect();

        if group_ids.is_empty() {
            warn!("Dropping empty game {}", game.id);
            return None;
        }
        if let Some(id) = group_ids.iter().find(|id| rejected.contains(id)) {
            debug!("Dropping game {}: {} was rejected", game.id, id);
            return None;
        }
        let mut distinct = HashSet::new();
        if group_ids
            .iter()
            .any(|id| !by_id.contains_key(id) || used.contains(id) || !distinct.insert(*id))
        {
            warn!(
                "Dropping game {}: it references groups outside this pass or in another game",
                game.id
            );
            return None;
        }

        let mut marked: Vec<&Arc<PendingRequest>> = Vec::with_capacity(group_ids.len());
        for id in &group_ids {
            let request = by_id[id];
            if request.transition(RequestState::Searching, RequestState::Found) {
                marked.push(request);
            } else {
                debug!("Dropping game {}: {} left the pass", game.id, id);
                for request in marked {
                    request.transition(RequestState::Found, RequestState::Searching);
                }
                return None;
            }
        }

        for request in marked {
            request.set_candidate(game.clone());
        }
        used.extend(group_ids);
        Some(game)
    }
}

/// Wait one interval measured from now. Returns false once `shutdown` fires.
async fn rest(
    settings: &mut watch::Receiver<GameFinderSettings>,
    shutdown: &CancellationToken,
) -> bool {
    let since = tokio::time::Instant::now();
    let mut watching = true;
    loop {
        let interval = settings.borrow_and_update().interval();
        tokio::select! {
            _ = shutdown.cancelled() => return false,
            _ = tokio::time::sleep_until(since + interval) => return true,
            changed = settings.changed(), if watching => {
                // The sender is gone; keep the current interval
                if changed.is_err() {
                    watching = false;
                }
            }
        }
    }
}

/// Run `future` on its own task; a panic is logged instead of lost
fn spawn_supervised<F>(game_id: String, future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(future);
    tokio::spawn(async move {
        if let Err(e) = handle.await {
            if e.is_panic() {
                error!("Resolution task for game {} panicked", game_id);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::publisher::MockNotifier;
    use crate::finder::broadcast::Broadcaster;
    use crate::finder::ready_check::ReadyCheckCoordinator;
    use crate::finder::request::{Settlement, SettlementReceiver};
    use crate::finder::resolution::{GameResolution, Resolver};
    use crate::session::{InMemoryPeerDirectory, LocalSessionHost, SessionResolver};
    use crate::strategy::{GameFinderResult, MockMatchingStrategy};
    use crate::types::{Group, GroupData, Player, Team};
    use anyhow::anyhow;
    use async_trait::async_trait;

    struct Harness {
        registry: Arc<RequestRegistry>,
        stats: Arc<GameFinderStats>,
        settings: watch::Sender<GameFinderSettings>,
        runner: PassRunner,
    }

    /// Resolver refusing every batch of games
    struct UnpreparedResolver;

    #[async_trait]
    impl Resolver for UnpreparedResolver {
        async fn prepare_game_resolution(&self, _games: &[Arc<Game>]) -> Result<()> {
            Err(anyhow!("session host unreachable"))
        }

        async fn resolve_game(&self, _game: &Game) -> Result<GameResolution> {
            Ok(GameResolution::default())
        }
    }

    fn harness(strategy: MockMatchingStrategy) -> Harness {
        let host = Arc::new(LocalSessionHost::new());
        harness_with(strategy, Arc::new(SessionResolver::new(host.clone())), host)
    }

    fn harness_with(
        strategy: MockMatchingStrategy,
        resolver: Arc<dyn Resolver>,
        host: Arc<LocalSessionHost>,
    ) -> Harness {
        let registry = Arc::new(RequestRegistry::new());
        let stats = Arc::new(GameFinderStats::new());
        let directory = Arc::new(InMemoryPeerDirectory::new());
        let pipeline = ResolutionPipeline::new(
            resolver,
            host,
            Broadcaster::new(Arc::new(MockNotifier::new()), directory),
            registry.clone(),
            Arc::new(ReadyCheckCoordinator::new()),
            stats.clone(),
        );
        let (settings, rx) = watch::channel(GameFinderSettings::default());
        let runner = PassRunner::new(
            registry.clone(),
            Arc::new(strategy),
            pipeline,
            rx,
            stats.clone(),
        );
        Harness {
            registry,
            stats,
            settings,
            runner,
        }
    }

    fn enqueue_ready(
        registry: &RequestRegistry,
        session: &str,
    ) -> (Arc<PendingRequest>, SettlementReceiver) {
        let group = Arc::new(Group::new(vec![Player::new(session, session)], GroupData::None));
        let (request, rx) = registry.enqueue(group).unwrap();
        request.set_state(RequestState::Ready);
        (request, rx)
    }

    #[tokio::test]
    async fn test_strategy_error_reverts_claims() {
        let mut strategy = MockMatchingStrategy::new();
        strategy
            .expect_find_games()
            .times(1)
            .returning(|_| Err(anyhow!("boom")));
        let h = harness(strategy);
        let (request, _rx) = enqueue_ready(&h.registry, "s1");

        assert!(h.runner.run_pass().await.is_err());
        assert_eq!(request.state(), RequestState::Ready);
        assert!(!request.is_settled());
    }

    #[tokio::test]
    async fn test_rejected_group_drops_its_game() {
        let mut strategy = MockMatchingStrategy::new();
        strategy.expect_find_games().times(1).returning(|context| {
            let a = context.waiting_groups[0].clone();
            let b = context.waiting_groups[1].clone();
            Ok(GameFinderResult {
                games: vec![Game::new(vec![Team::new(vec![a]), Team::new(vec![b.clone()])])],
                failed: vec![(b, "banned".to_string())],
            })
        });
        let h = harness(strategy);
        let (first, _rx1) = enqueue_ready(&h.registry, "s1");
        let (second, rx2) = enqueue_ready(&h.registry, "s2");

        let outcome = h.runner.run_pass().await.unwrap();

        assert_eq!(outcome.games, 0);
        assert_eq!(outcome.rejected, 1);
        assert_eq!(first.state(), RequestState::Ready);
        assert!(first.candidate().is_none());
        assert_eq!(second.state(), RequestState::Rejected);
        match rx2.await.unwrap() {
            Settlement::Failed(ClientError::Rejected { reason }) => assert_eq!(reason, "banned"),
            other => panic!("unexpected settlement {:?}", other),
        }
        assert_eq!(h.stats.snapshot().groups_rejected, 1);
    }

    #[tokio::test]
    async fn test_found_game_marks_groups() {
        let mut strategy = MockMatchingStrategy::new();
        strategy.expect_find_games().returning(|context| {
            Ok(GameFinderResult {
                games: vec![Game::new(vec![Team::new(context.waiting_groups.clone())])],
                failed: Vec::new(),
            })
        });
        let h = harness(strategy);
        h.settings.send_modify(|s| {
            s.ready_check.enabled = true;
            s.ready_check.timeout_ms = 60_000;
        });
        let (a, _rx1) = enqueue_ready(&h.registry, "s1");
        let (b, _rx2) = enqueue_ready(&h.registry, "s2");

        let outcome = h.runner.run_pass().await.unwrap();

        assert_eq!(outcome.games, 1);
        assert_eq!(a.state(), RequestState::Found);
        assert_eq!(b.state(), RequestState::Found);
        assert_eq!(
            a.candidate().map(|g| g.id.clone()),
            b.candidate().map(|g| g.id.clone())
        );
        // Found groups are not claimed again
        assert_eq!(h.runner.run_pass().await.unwrap(), PassOutcome::default());
    }

    #[tokio::test]
    async fn test_failed_preparation_returns_groups_to_ready() {
        let mut strategy = MockMatchingStrategy::new();
        strategy.expect_find_games().times(1).returning(|context| {
            Ok(GameFinderResult {
                games: vec![Game::new(vec![Team::new(context.waiting_groups.clone())])],
                failed: Vec::new(),
            })
        });
        let host = Arc::new(LocalSessionHost::new());
        let h = harness_with(strategy, Arc::new(UnpreparedResolver), host.clone());
        let (a, _rx1) = enqueue_ready(&h.registry, "s1");
        let (b, _rx2) = enqueue_ready(&h.registry, "s2");

        let err = h.runner.run_pass().await.unwrap_err();

        assert!(format!("{:#}", err).contains("session host unreachable"));
        for request in [&a, &b] {
            assert_eq!(request.state(), RequestState::Ready);
            assert!(request.candidate().is_none());
            assert!(!request.is_settled());
        }
        assert_eq!(h.stats.snapshot().games_found, 0);
        assert_eq!(host.session_count(), 0);
    }

    #[tokio::test]
    async fn test_game_with_foreign_group_is_dropped() {
        let mut strategy = MockMatchingStrategy::new();
        strategy.expect_find_games().returning(|_| {
            let stranger = Arc::new(Group::new(vec![Player::new("x", "x")], GroupData::None));
            Ok(GameFinderResult {
                games: vec![Game::new(vec![Team::new(vec![stranger])])],
                failed: Vec::new(),
            })
        });
        let h = harness(strategy);
        let (request, _rx) = enqueue_ready(&h.registry, "s1");

        let outcome = h.runner.run_pass().await.unwrap();
        assert_eq!(outcome.games, 0);
        assert_eq!(request.state(), RequestState::Ready);
    }

    #[tokio::test]
    async fn test_empty_registry_skips_strategy() {
        let mut strategy = MockMatchingStrategy::new();
        strategy.expect_find_games().never();
        let h = harness(strategy);

        assert_eq!(h.runner.run_pass().await.unwrap(), PassOutcome::default());
        assert_eq!(h.stats.snapshot().passes_total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_survives_failed_pass() {
        let mut strategy = MockMatchingStrategy::new();
        let mut calls = 0;
        strategy.expect_find_games().returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(anyhow!("transient"))
            } else {
                Ok(GameFinderResult::default())
            }
        });
        let h = harness(strategy);
        let (_request, _rx) = enqueue_ready(&h.registry, "s1");

        let runner = Arc::new(h.runner);
        let shutdown = CancellationToken::new();
        let task = {
            let runner = runner.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { runner.run(shutdown).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
        shutdown.cancel();
        task.await.unwrap();

        let snapshot = h.stats.snapshot();
        assert_eq!(snapshot.pass_failures, 1);
        assert!(snapshot.passes_total >= 3);
    }
}

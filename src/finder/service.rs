//! The game finder service: FindGame, cancellation, ready answers and
//! configuration refresh

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::amqp::publisher::Notifier;
use crate::config::{validate_game_finder_settings, GameFinderSettings};
use crate::error::{ClientError, GameFinderError, Result};
use crate::finder::broadcast::Broadcaster;
use crate::finder::extractor::{DataExtractor, GroupDraft};
use crate::finder::pass::{PassOutcome, PassRunner};
use crate::finder::ready_check::ReadyCheckCoordinator;
use crate::finder::registry::RequestRegistry;
use crate::finder::request::Settlement;
use crate::finder::resolution::{ResolutionPipeline, Resolver};
use crate::finder::stats::{GameFinderStats, GameFinderStatsSnapshot};
use crate::metrics::MetricsCollector;
use crate::session::{PeerDirectory, SessionHost};
use crate::strategy::MatchingStrategy;
use crate::types::{
    CancelReason, GameContext, Group, Notification, PeerHandle, Player, RequestState,
    StatusUpdate,
};
use crate::utils::seconds_since;

/// How a FindGame call ended when it did not fail
#[derive(Debug, Clone)]
pub enum FindGameOutcome {
    Found(GameContext),
    Cancelled(CancelReason),
}

/// Removes a group from the registry when dropped, and tells a ready check
/// still waiting on the group's candidate game that the group is gone
struct RegistrationGuard {
    registry: Arc<RequestRegistry>,
    ready_checks: Arc<ReadyCheckCoordinator>,
    group: Arc<Group>,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        let Some(request) = self.registry.dequeue(&self.group) else {
            return;
        };
        if let Some(candidate) = request.candidate() {
            if let Some(check) = self.ready_checks.get(&candidate.id) {
                if !check.is_completed() {
                    check.group_removed(self.group.id());
                }
            }
        }
    }
}

/// Orchestrates the registry, pass loop, ready checks and resolution
pub struct GameFinderService {
    registry: Arc<RequestRegistry>,
    ready_checks: Arc<ReadyCheckCoordinator>,
    extractors: Vec<Arc<dyn DataExtractor>>,
    strategy: Arc<dyn MatchingStrategy>,
    resolver: Arc<dyn Resolver>,
    broadcaster: Broadcaster,
    runner: PassRunner,
    settings: watch::Sender<GameFinderSettings>,
    accepting: AtomicBool,
    running: AtomicBool,
    stats: Arc<GameFinderStats>,
    metrics: Option<Arc<MetricsCollector>>,
}

/// Collaborators of a [`GameFinderService`]
pub struct GameFinderServiceBuilder {
    strategy: Arc<dyn MatchingStrategy>,
    resolver: Arc<dyn Resolver>,
    host: Arc<dyn SessionHost>,
    notifier: Arc<dyn Notifier>,
    directory: Arc<dyn PeerDirectory>,
    extractors: Vec<Arc<dyn DataExtractor>>,
    settings: GameFinderSettings,
    metrics: Option<Arc<MetricsCollector>>,
}

impl GameFinderServiceBuilder {
    /// Append a data extractor; extractors run in insertion order
    pub fn extractor(mut self, extractor: Arc<dyn DataExtractor>) -> Self {
        self.extractors.push(extractor);
        self
    }

    pub fn settings(mut self, settings: GameFinderSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<Arc<GameFinderService>> {
        validate_game_finder_settings(&self.settings)?;

        let registry = Arc::new(RequestRegistry::new());
        let ready_checks = Arc::new(ReadyCheckCoordinator::new());
        let stats = Arc::new(GameFinderStats::new());
        let broadcaster = Broadcaster::new(self.notifier, self.directory);
        let (settings, settings_rx) = watch::channel(self.settings);

        let pipeline = ResolutionPipeline::new(
            self.resolver.clone(),
            self.host,
            broadcaster.clone(),
            registry.clone(),
            ready_checks.clone(),
            stats.clone(),
        );
        let runner = PassRunner::new(
            registry.clone(),
            self.strategy.clone(),
            pipeline,
            settings_rx,
            stats.clone(),
        )
        .with_metrics(self.metrics.clone());

        Ok(Arc::new(GameFinderService {
            registry,
            ready_checks,
            extractors: self.extractors,
            strategy: self.strategy,
            resolver: self.resolver,
            broadcaster,
            runner,
            settings,
            accepting: AtomicBool::new(true),
            running: AtomicBool::new(false),
            stats,
            metrics: self.metrics,
        }))
    }
}

impl GameFinderService {
    pub fn builder(
        strategy: Arc<dyn MatchingStrategy>,
        resolver: Arc<dyn Resolver>,
        host: Arc<dyn SessionHost>,
        notifier: Arc<dyn Notifier>,
        directory: Arc<dyn PeerDirectory>,
    ) -> GameFinderServiceBuilder {
        GameFinderServiceBuilder {
            strategy,
            resolver,
            host,
            notifier,
            directory,
            extractors: Vec::new(),
            settings: GameFinderSettings::default(),
            metrics: None,
        }
    }

    /// Search a game for the requester's group and wait for the outcome.
    ///
    /// Dropping the returned future or firing `cancel` both withdraw the
    /// group; the registry is cleaned up on every path.
    pub async fn find_game(
        &self,
        payload: &[u8],
        requester_session: &str,
        cancel: CancellationToken,
    ) -> Result<FindGameOutcome> {
        if !self.is_accepting_requests() {
            debug!("Rejected FindGame from {}: not accepting", requester_session);
            return Err(self.reject(ClientError::Disabled, None).await);
        }

        let Some(requester) = self
            .broadcaster
            .directory()
            .peer_for_session(requester_session)
            .await
        else {
            return Err(self
                .reject(
                    ClientError::Disconnected {
                        user_id: requester_session.to_string(),
                    },
                    None,
                )
                .await);
        };

        let mut draft = GroupDraft::default();
        for extractor in &self.extractors {
            match extractor.extract_data(payload, &requester, &mut draft).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    warn!("Data extraction failed for {}: {:#}", requester.user_id, e);
                    self.broadcaster
                        .send(
                            std::slice::from_ref(&requester),
                            Notification::Status(StatusUpdate::Failed { reason: None }),
                        )
                        .await
                        .ok();
                    return Err(e);
                }
            }
        }
        if draft.members.is_empty() {
            draft.members.push(requester.user_id.clone());
        }

        let mut players = Vec::with_capacity(draft.members.len());
        for user_id in &draft.members {
            let Some(peer) = self.broadcaster.directory().resolve_peer(user_id).await else {
                return Err(self
                    .reject(
                        ClientError::Disconnected {
                            user_id: user_id.clone(),
                        },
                        Some(&requester),
                    )
                    .await);
            };
            if self.registry.is_player_waiting(&peer.session_id) {
                return Err(self
                    .reject(
                        ClientError::AlreadyWaiting {
                            user_id: user_id.clone(),
                        },
                        Some(&requester),
                    )
                    .await);
            }
            players.push(Player::new(peer.session_id, peer.user_id));
        }

        let group = Arc::new(Group::new(players, draft.data));
        let (request, mut receiver) = match self.registry.enqueue(group.clone()) {
            Ok(enqueued) => enqueued,
            Err(e) => {
                if let Some(client_error) = e.downcast_ref::<ClientError>() {
                    self.reject(client_error.clone(), Some(&requester)).await;
                }
                return Err(e);
            }
        };
        let _registration = RegistrationGuard {
            registry: self.registry.clone(),
            ready_checks: self.ready_checks.clone(),
            group: group.clone(),
        };
        self.stats.record_request();

        // Closing may have raced the lookups above; its sweep missed this request
        if !self.is_accepting_requests() && request.cancel(CancelReason::NotAccepting) {
            debug!("{} enqueued while closing", group.id());
        }

        self.broadcaster
            .to_group(&group, Notification::Parameters(echo_payload(payload)))
            .await;
        self.broadcaster
            .to_group(&group, Notification::Status(StatusUpdate::SearchStart))
            .await;
        request.transition(RequestState::NotStarted, RequestState::Ready);
        info!(
            "{} searching a game for {} player(s)",
            group.id(),
            group.players().len()
        );

        let settlement = tokio::select! {
            settlement = &mut receiver => settlement,
            _ = cancel.cancelled() => {
                if request.cancel(CancelReason::Caller) {
                    debug!("{} cancelled by its caller", group.id());
                }
                (&mut receiver).await
            }
        }
        .map_err(|_| GameFinderError::InternalError {
            message: format!("Settlement of {} was dropped", group.id()),
        })?;

        let waited = seconds_since(request.enqueued_at());
        match settlement {
            Settlement::Resolved(context) => {
                self.stats.record_resolved();
                self.observe_request("resolved", waited);
                Ok(FindGameOutcome::Found(context))
            }
            Settlement::Cancelled(reason) => {
                info!("{} cancelled: {}", group.id(), reason);
                self.stats.record_cancelled();
                self.observe_request("cancelled", waited);
                self.broadcaster
                    .to_group(&group, Notification::Status(StatusUpdate::Cancelled { reason }))
                    .await;
                Ok(FindGameOutcome::Cancelled(reason))
            }
            Settlement::Failed(error) => {
                info!("{} failed: {}", group.id(), error);
                self.stats.record_failed();
                self.observe_request("failed", waited);
                self.broadcaster
                    .to_group(
                        &group,
                        Notification::Status(StatusUpdate::Failed {
                            reason: Some(error.reason().to_string()),
                        }),
                    )
                    .await;
                Err(error.into())
            }
        }
    }

    /// Player-initiated cancel; returns whether a pending search was cancelled
    pub fn cancel(&self, session_id: &str) -> bool {
        self.cancel_with(session_id, CancelReason::PlayerRequest)
    }

    /// Disconnect handler; cancels the session's search with a
    /// `disconnected` reason
    pub fn on_disconnected(&self, session_id: &str) -> bool {
        self.cancel_with(session_id, CancelReason::Disconnected)
    }

    fn cancel_with(&self, session_id: &str, reason: CancelReason) -> bool {
        let Some(request) = self.registry.lookup_by_player(session_id) else {
            return false;
        };
        let cancelled = request.cancel(reason);
        if cancelled {
            info!(
                "Cancelled {} for session {}: {}",
                request.group().id(),
                session_id,
                reason
            );
        }
        cancelled
    }

    /// Record a ready-check answer. Unknown sessions, players without a
    /// candidate game, games without a pending check and players outside the
    /// check are ignored.
    pub async fn resolve_ready(&self, session_id: &str, accept: bool) -> bool {
        let Some(peer) = self.broadcaster.directory().peer_for_session(session_id).await else {
            return false;
        };
        let Some(request) = self.registry.lookup_by_player(session_id) else {
            return false;
        };
        let Some(candidate) = request.candidate() else {
            return false;
        };
        let Some(check) = self.ready_checks.get(&candidate.id) else {
            return false;
        };
        if !check.contains_player(&peer.user_id) {
            return false;
        }
        check.resolve_player(&peer.user_id, accept)
    }

    /// Swap in new settings. The pass loop picks them up on its next
    /// iteration; the strategy, resolver and extractors are refreshed now.
    pub fn refresh_config(&self, settings: GameFinderSettings) -> Result<()> {
        validate_game_finder_settings(&settings)?;

        self.strategy.refresh_config(&settings.strategy);
        self.resolver.refresh_config(&settings.strategy);
        for extractor in &self.extractors {
            extractor.refresh_config(&settings.strategy);
        }

        info!(
            "Game finder settings refreshed: interval {:?}, ready check {} ({} ms)",
            settings.interval(),
            if settings.ready_check.enabled {
                "enabled"
            } else {
                "disabled"
            },
            settings.ready_check.timeout_ms
        );
        self.settings.send_replace(settings);
        Ok(())
    }

    /// Open or close the service to new requests. Closing it cancels every
    /// pending request.
    pub fn set_accepting_requests(&self, accepting: bool) {
        let previous = self.accepting.swap(accepting, Ordering::SeqCst);
        if previous != accepting {
            info!("Game finder accepting requests: {}", accepting);
        }
        if !accepting {
            self.cancel_all(CancelReason::NotAccepting);
        }
    }

    pub fn is_accepting_requests(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Run the pass loop until `shutdown` fires, then cancel whatever is
    /// still pending
    pub async fn run(&self, shutdown: CancellationToken) {
        self.running.store(true, Ordering::SeqCst);
        self.runner.run(shutdown).await;
        self.running.store(false, Ordering::SeqCst);
        self.cancel_all(CancelReason::Shutdown);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one pass immediately, outside the loop
    pub async fn run_pass(&self) -> Result<PassOutcome> {
        self.runner.run_pass().await
    }

    pub fn settings(&self) -> GameFinderSettings {
        self.settings.borrow().clone()
    }

    pub fn subscribe_settings(&self) -> watch::Receiver<GameFinderSettings> {
        self.settings.subscribe()
    }

    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    pub fn ready_checks(&self) -> &Arc<ReadyCheckCoordinator> {
        &self.ready_checks
    }

    pub fn stats(&self) -> GameFinderStatsSnapshot {
        let (waiting_groups, waiting_players) = self.registry.waiting_counts();
        GameFinderStatsSnapshot {
            waiting_groups,
            waiting_players,
            pending_requests: self.registry.len(),
            pending_ready_checks: self.ready_checks.len(),
            accepting_requests: self.is_accepting_requests(),
            running: self.is_running(),
            ..self.stats.snapshot()
        }
    }

    fn cancel_all(&self, reason: CancelReason) {
        let cancelled = self
            .registry
            .all()
            .into_iter()
            .filter(|request| request.cancel(reason))
            .count();
        if cancelled > 0 {
            info!("Cancelled {} pending request(s): {}", cancelled, reason);
        }
    }

    /// Notify the requester of a failure raised before enqueue
    async fn reject(&self, error: ClientError, requester: Option<&PeerHandle>) -> anyhow::Error {
        self.stats.record_failed();
        if let Some(metrics) = &self.metrics {
            metrics.record_request_outcome(error.reason());
        }
        if let Some(requester) = requester {
            if let Err(e) = self
                .broadcaster
                .send(
                    std::slice::from_ref(requester),
                    Notification::Status(StatusUpdate::Failed {
                        reason: Some(error.reason().to_string()),
                    }),
                )
                .await
            {
                warn!("Failed to notify {} of {}: {}", requester.session_id, error, e);
            }
        }
        error.into()
    }

    fn observe_request(&self, outcome: &str, waited_seconds: f64) {
        if let Some(metrics) = &self.metrics {
            metrics.record_request_outcome(outcome);
            metrics.record_wait_time(waited_seconds);
        }
    }
}

/// Parameters echoed back to the group; non-JSON payloads are sent as text
fn echo_payload(payload: &[u8]) -> serde_json::Value {
    if payload.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(payload).into_owned()))
}

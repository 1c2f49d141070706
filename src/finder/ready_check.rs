//! Ready checks: every player of a found game confirms before resolution

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::types::{
    CancelReason, Game, GameId, Group, GroupId, ReadyCheckPlayerStatus, ReadyCheckUpdate,
    ReadyStatus, UserId,
};

/// Callback receiving the current tally on every change; must not block
pub type StateChangedHook = Box<dyn Fn(ReadyCheckUpdate) + Send + Sync>;

/// Outcome of a ready check
#[derive(Debug, Clone)]
pub struct ReadyCheckResult {
    /// Every player of every group accepted
    pub success: bool,
    /// Groups whose members all accepted
    pub ready_groups: Vec<Arc<Group>>,
    /// Groups with at least one player that declined or never answered
    pub unready_groups: Vec<(Arc<Group>, CancelReason)>,
}

#[derive(Debug)]
struct PlayerEntry {
    user_id: UserId,
    group_id: GroupId,
    status: ReadyStatus,
}

#[derive(Debug, Default)]
struct CheckState {
    players: Vec<PlayerEntry>,
    removed_groups: HashSet<GroupId>,
    completed: bool,
}

impl CheckState {
    fn all_answered(&self) -> bool {
        self.players.iter().all(|p| p.status != ReadyStatus::Pending)
    }
}

/// Confirmation phase of one game
pub struct ReadyCheck {
    game: Arc<Game>,
    state: Mutex<CheckState>,
    changed: Notify,
    on_change: Option<StateChangedHook>,
}

impl std::fmt::Debug for ReadyCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadyCheck")
            .field("game_id", &self.game.id)
            .finish_non_exhaustive()
    }
}

fn lock(state: &Mutex<CheckState>) -> MutexGuard<'_, CheckState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ReadyCheck {
    pub fn new(game: Arc<Game>, on_change: Option<StateChangedHook>) -> Self {
        let players = game
            .all_groups()
            .flat_map(|group| {
                group.players().iter().map(move |player| PlayerEntry {
                    user_id: player.user_id.clone(),
                    group_id: group.id(),
                    status: ReadyStatus::Pending,
                })
            })
            .collect();

        Self {
            game,
            state: Mutex::new(CheckState {
                players,
                ..Default::default()
            }),
            changed: Notify::new(),
            on_change,
        }
    }

    pub fn game(&self) -> &Arc<Game> {
        &self.game
    }

    pub fn contains_player(&self, user_id: &str) -> bool {
        lock(&self.state).players.iter().any(|p| p.user_id == user_id)
    }

    /// True once the check produced its result
    pub fn is_completed(&self) -> bool {
        lock(&self.state).completed
    }

    /// Record a player's answer. Only the first answer of a still-pending
    /// player counts; returns whether it was recorded.
    pub fn resolve_player(&self, user_id: &str, accept: bool) -> bool {
        let update = {
            let mut state = lock(&self.state);
            if state.completed {
                return false;
            }
            let Some(entry) = state
                .players
                .iter_mut()
                .find(|p| p.user_id == user_id && p.status == ReadyStatus::Pending)
            else {
                return false;
            };
            entry.status = if accept {
                ReadyStatus::Accepted
            } else {
                ReadyStatus::Declined
            };
            debug!(
                "Ready check {}: {} {}",
                self.game.id,
                user_id,
                if accept { "accepted" } else { "declined" }
            );
            Self::tally(&self.game.id, &state)
        };

        self.publish(update);
        true
    }

    /// A group of the game left the registry. Its players count as declined;
    /// when every group is gone the check completes immediately.
    pub fn group_removed(&self, group_id: GroupId) {
        let update = {
            let mut state = lock(&self.state);
            if state.completed || !state.removed_groups.insert(group_id) {
                return;
            }
            for entry in state.players.iter_mut().filter(|p| p.group_id == group_id) {
                entry.status = ReadyStatus::Declined;
            }
            info!(
                "Group {} left ready check of game {}",
                group_id, self.game.id
            );
            Self::tally(&self.game.id, &state)
        };

        self.publish(update);
    }

    /// Wait until every player answered, every group vanished, or `timeout`
    /// elapsed, then produce the result
    pub async fn wait(&self, timeout: Duration) -> ReadyCheckResult {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            if self.can_complete() {
                break;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    debug!("Ready check of game {} timed out", self.game.id);
                    break;
                }
            }
        }
        self.complete()
    }

    /// Current tally
    pub fn update(&self) -> ReadyCheckUpdate {
        Self::tally(&self.game.id, &lock(&self.state))
    }

    fn can_complete(&self) -> bool {
        let state = lock(&self.state);
        let group_count = self.game.all_groups().count();
        state.all_answered() || state.removed_groups.len() >= group_count
    }

    fn complete(&self) -> ReadyCheckResult {
        let mut state = lock(&self.state);
        state.completed = true;

        let mut result = ReadyCheckResult {
            success: true,
            ready_groups: Vec::new(),
            unready_groups: Vec::new(),
        };

        for group in self.game.all_groups() {
            if state.removed_groups.contains(&group.id()) {
                result.success = false;
                continue;
            }
            let statuses: Vec<ReadyStatus> = state
                .players
                .iter()
                .filter(|p| p.group_id == group.id())
                .map(|p| p.status)
                .collect();

            if statuses.iter().all(|s| *s == ReadyStatus::Accepted) {
                result.ready_groups.push(group.clone());
            } else {
                let reason = if statuses.contains(&ReadyStatus::Declined) {
                    CancelReason::ReadyCheckDeclined
                } else {
                    CancelReason::ReadyCheckTimeout
                };
                result.unready_groups.push((group.clone(), reason));
                result.success = false;
            }
        }

        info!(
            "Ready check of game {} completed: success={}, ready={}, unready={}",
            self.game.id,
            result.success,
            result.ready_groups.len(),
            result.unready_groups.len()
        );
        result
    }

    fn tally(game_id: &GameId, state: &CheckState) -> ReadyCheckUpdate {
        let count = |status: ReadyStatus| state.players.iter().filter(|p| p.status == status).count();
        ReadyCheckUpdate {
            game_id: game_id.clone(),
            accepted: count(ReadyStatus::Accepted),
            declined: count(ReadyStatus::Declined),
            pending: count(ReadyStatus::Pending),
            players: state
                .players
                .iter()
                .map(|p| ReadyCheckPlayerStatus {
                    user_id: p.user_id.clone(),
                    status: p.status,
                })
                .collect(),
        }
    }

    fn publish(&self, update: ReadyCheckUpdate) {
        self.changed.notify_one();
        if let Some(hook) = &self.on_change {
            hook(update);
        }
    }
}

/// Table of ready checks in progress, keyed by game id
#[derive(Debug, Default)]
pub struct ReadyCheckCoordinator {
    checks: DashMap<GameId, Arc<ReadyCheck>>,
}

impl ReadyCheckCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a check for `game`. The check stays registered until the returned
    /// guard is dropped.
    pub fn create(
        self: &Arc<Self>,
        game: Arc<Game>,
        on_change: Option<StateChangedHook>,
    ) -> ReadyCheckGuard {
        let check = Arc::new(ReadyCheck::new(game, on_change));
        if self.checks.insert(check.game().id.clone(), check.clone()).is_some() {
            warn!("Ready check for game {} replaced an open one", check.game().id);
        } else {
            debug!("Opened ready check for game {}", check.game().id);
        }
        ReadyCheckGuard {
            coordinator: self.clone(),
            check,
        }
    }

    pub fn get(&self, game_id: &str) -> Option<Arc<ReadyCheck>> {
        self.checks.get(game_id).map(|c| c.value().clone())
    }

    /// Number of checks in progress
    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }
}

/// Keeps a ready check registered; unregisters it on drop, on every path
pub struct ReadyCheckGuard {
    coordinator: Arc<ReadyCheckCoordinator>,
    check: Arc<ReadyCheck>,
}

impl ReadyCheckGuard {
    pub fn check(&self) -> &Arc<ReadyCheck> {
        &self.check
    }
}

impl std::ops::Deref for ReadyCheckGuard {
    type Target = ReadyCheck;

    fn deref(&self) -> &Self::Target {
        &self.check
    }
}

impl Drop for ReadyCheckGuard {
    fn drop(&mut self) {
        let check = &self.check;
        self.coordinator
            .checks
            .remove_if(&check.game().id, |_, registered| Arc::ptr_eq(registered, check));
        debug!("Closed ready check for game {}", check.game().id);
    }
}

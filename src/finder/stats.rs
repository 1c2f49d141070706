//! Running totals of the game finder

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the service, pass runner and resolution tasks
#[derive(Debug, Default)]
pub struct GameFinderStats {
    requests_total: AtomicU64,
    requests_resolved: AtomicU64,
    requests_cancelled: AtomicU64,
    requests_failed: AtomicU64,
    passes_total: AtomicU64,
    pass_failures: AtomicU64,
    games_found: AtomicU64,
    groups_rejected: AtomicU64,
    ready_checks_passed: AtomicU64,
    ready_checks_failed: AtomicU64,
    player_resolution_failures: AtomicU64,
}

/// Point-in-time view of the statistics, including registry gauges
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameFinderStatsSnapshot {
    pub requests_total: u64,
    pub requests_resolved: u64,
    pub requests_cancelled: u64,
    pub requests_failed: u64,
    pub passes_total: u64,
    pub pass_failures: u64,
    pub games_found: u64,
    pub groups_rejected: u64,
    pub ready_checks_passed: u64,
    pub ready_checks_failed: u64,
    pub player_resolution_failures: u64,
    pub waiting_groups: usize,
    pub waiting_players: usize,
    pub pending_requests: usize,
    pub pending_ready_checks: usize,
    pub accepting_requests: bool,
    pub running: bool,
}

macro_rules! bump {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl GameFinderStats {
    pub fn new() -> Self {
        Self::default()
    }

    bump! {
        record_request => requests_total,
        record_resolved => requests_resolved,
        record_cancelled => requests_cancelled,
        record_failed => requests_failed,
        record_pass => passes_total,
        record_pass_failure => pass_failures,
        record_rejected_group => groups_rejected,
        record_ready_check_passed => ready_checks_passed,
        record_ready_check_failed => ready_checks_failed,
        record_player_resolution_failure => player_resolution_failures,
    }

    pub fn record_games_found(&self, count: u64) {
        self.games_found.fetch_add(count, Ordering::Relaxed);
    }

    /// Counter values; registry gauges are left at zero for the caller to fill
    pub fn snapshot(&self) -> GameFinderStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        GameFinderStatsSnapshot {
            requests_total: load(&self.requests_total),
            requests_resolved: load(&self.requests_resolved),
            requests_cancelled: load(&self.requests_cancelled),
            requests_failed: load(&self.requests_failed),
            passes_total: load(&self.passes_total),
            pass_failures: load(&self.pass_failures),
            games_found: load(&self.games_found),
            groups_rejected: load(&self.groups_rejected),
            ready_checks_passed: load(&self.ready_checks_passed),
            ready_checks_failed: load(&self.ready_checks_failed),
            player_resolution_failures: load(&self.player_resolution_failures),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = GameFinderStats::new();
        stats.record_request();
        stats.record_request();
        stats.record_cancelled();
        stats.record_games_found(3);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests_total, 2);
        assert_eq!(snapshot.requests_cancelled, 1);
        assert_eq!(snapshot.games_found, 3);
        assert_eq!(snapshot.waiting_groups, 0);
    }
}

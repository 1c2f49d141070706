//! Metrics collection using Prometheus
//!
//! Counters and histograms for the game finder, registered on a private
//! registry that the health server renders under `/metrics`.

use crate::finder::stats::GameFinderStatsSnapshot;
use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main metrics collector for the game finder service
#[derive(Clone)]
pub struct MetricsCollector {
    registry: Arc<Registry>,
    service_metrics: ServiceMetrics,
    finder_metrics: FinderMetrics,
    performance_metrics: PerformanceMetrics,
}

/// Service-level metrics
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Service uptime in seconds
    pub uptime_seconds: IntGauge,

    /// Total AMQP messages processed
    pub amqp_messages_total: IntCounterVec,

    /// AMQP message processing errors
    pub amqp_errors_total: IntCounterVec,

    /// Health check status (0=unhealthy, 1=degraded, 2=healthy)
    pub health_status: IntGauge,

    /// Component health status
    pub component_health: IntGaugeVec,
}

/// Request and pass metrics
#[derive(Clone)]
pub struct FinderMetrics {
    /// Settled FindGame requests by outcome
    pub requests_total: IntCounterVec,

    /// Groups currently in the registry
    pub waiting_groups: IntGauge,

    /// Players currently in the registry
    pub waiting_players: IntGauge,

    /// Ready checks in progress
    pub pending_ready_checks: IntGauge,

    pub games_found_total: IntCounter,

    pub groups_rejected_total: IntCounter,

    /// Completed ready checks by result
    pub ready_checks_total: IntCounterVec,

    pub passes_total: IntCounter,

    pub pass_failures_total: IntCounter,

    /// Players whose success payload could not be produced
    pub player_resolution_failures_total: IntCounter,

    /// Time between enqueue and settlement
    pub wait_time_seconds: Histogram,
}

/// Performance metrics
#[derive(Clone)]
pub struct PerformanceMetrics {
    /// Duration of one matching pass
    pub pass_duration: Histogram,

    /// AMQP operation durations
    pub amqp_operation_duration: HistogramVec,
}

impl MetricsCollector {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    /// Create a new metrics collector with custom registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        Ok(Self {
            service_metrics: ServiceMetrics::new(&registry)?,
            finder_metrics: FinderMetrics::new(&registry)?,
            performance_metrics: PerformanceMetrics::new(&registry)?,
            registry,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn service(&self) -> &ServiceMetrics {
        &self.service_metrics
    }

    pub fn finder(&self) -> &FinderMetrics {
        &self.finder_metrics
    }

    pub fn performance(&self) -> &PerformanceMetrics {
        &self.performance_metrics
    }

    /// Bring gauges and counters in line with a stats snapshot. Counters only
    /// move forward by the difference to the snapshot.
    pub fn update_from_stats(&self, stats: &GameFinderStatsSnapshot) {
        let finder = &self.finder_metrics;
        finder.waiting_groups.set(stats.waiting_groups as i64);
        finder.waiting_players.set(stats.waiting_players as i64);
        finder
            .pending_ready_checks
            .set(stats.pending_ready_checks as i64);

        catch_up(&finder.games_found_total, stats.games_found);
        catch_up(&finder.groups_rejected_total, stats.groups_rejected);
        catch_up(&finder.passes_total, stats.passes_total);
        catch_up(&finder.pass_failures_total, stats.pass_failures);
        catch_up(
            &finder.player_resolution_failures_total,
            stats.player_resolution_failures,
        );
        catch_up(
            &finder.ready_checks_total.with_label_values(&["passed"]),
            stats.ready_checks_passed,
        );
        catch_up(
            &finder.ready_checks_total.with_label_values(&["failed"]),
            stats.ready_checks_failed,
        );
    }

    /// Record how a FindGame request ended
    pub fn record_request_outcome(&self, outcome: &str) {
        self.finder_metrics
            .requests_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn record_wait_time(&self, seconds: f64) {
        self.finder_metrics.wait_time_seconds.observe(seconds);
    }

    pub fn record_pass(&self, duration: Duration) {
        self.performance_metrics
            .pass_duration
            .observe(duration.as_secs_f64());
    }

    /// Record AMQP operation
    pub fn record_amqp_operation(&self, operation: &str, success: bool, duration: Duration) {
        let status = if success { "success" } else { "error" };

        self.service_metrics
            .amqp_messages_total
            .with_label_values(&[operation, status])
            .inc();

        if !success {
            self.service_metrics
                .amqp_errors_total
                .with_label_values(&[operation])
                .inc();
        }

        self.performance_metrics
            .amqp_operation_duration
            .with_label_values(&[operation, status])
            .observe(duration.as_secs_f64());
    }

    pub fn update_health_status(&self, status: u8) {
        self.service_metrics.health_status.set(status as i64);
    }

    pub fn update_component_health(&self, component: &str, healthy: bool) {
        self.service_metrics
            .component_health
            .with_label_values(&[component])
            .set(i64::from(healthy));
    }

    pub fn set_uptime(&self, uptime: Duration) {
        self.service_metrics
            .uptime_seconds
            .set(uptime.as_secs() as i64);
    }

    /// Create a timer for measuring operation duration
    pub fn start_timer(&self) -> MetricsTimer {
        MetricsTimer::new()
    }
}

fn catch_up(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

/// Timer for measuring operation durations
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return the duration
    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl ServiceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let uptime_seconds =
            IntGauge::new("game_finder_uptime_seconds", "Service uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let amqp_messages_total = IntCounterVec::new(
            Opts::new(
                "game_finder_amqp_messages_total",
                "Total AMQP messages processed",
            ),
            &["operation", "status"],
        )?;
        registry.register(Box::new(amqp_messages_total.clone()))?;

        let amqp_errors_total = IntCounterVec::new(
            Opts::new("game_finder_amqp_errors_total", "Total AMQP errors"),
            &["operation"],
        )?;
        registry.register(Box::new(amqp_errors_total.clone()))?;

        let health_status = IntGauge::new(
            "game_finder_health_status",
            "Health status (0=unhealthy, 1=degraded, 2=healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let component_health = IntGaugeVec::new(
            Opts::new("game_finder_component_health", "Component health status"),
            &["component"],
        )?;
        registry.register(Box::new(component_health.clone()))?;

        Ok(Self {
            uptime_seconds,
            amqp_messages_total,
            amqp_errors_total,
            health_status,
            component_health,
        })
    }
}

impl FinderMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new(
                "game_finder_requests_total",
                "FindGame requests by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let waiting_groups =
            IntGauge::new("game_finder_waiting_groups", "Groups waiting for a game")?;
        registry.register(Box::new(waiting_groups.clone()))?;

        let waiting_players =
            IntGauge::new("game_finder_waiting_players", "Players waiting for a game")?;
        registry.register(Box::new(waiting_players.clone()))?;

        let pending_ready_checks = IntGauge::new(
            "game_finder_pending_ready_checks",
            "Ready checks in progress",
        )?;
        registry.register(Box::new(pending_ready_checks.clone()))?;

        let games_found_total =
            IntCounter::new("game_finder_games_found_total", "Games found by passes")?;
        registry.register(Box::new(games_found_total.clone()))?;

        let groups_rejected_total = IntCounter::new(
            "game_finder_groups_rejected_total",
            "Groups rejected by the matching strategy",
        )?;
        registry.register(Box::new(groups_rejected_total.clone()))?;

        let ready_checks_total = IntCounterVec::new(
            Opts::new("game_finder_ready_checks_total", "Completed ready checks"),
            &["result"],
        )?;
        registry.register(Box::new(ready_checks_total.clone()))?;

        let passes_total = IntCounter::new("game_finder_passes_total", "Matching passes run")?;
        registry.register(Box::new(passes_total.clone()))?;

        let pass_failures_total =
            IntCounter::new("game_finder_pass_failures_total", "Failed matching passes")?;
        registry.register(Box::new(pass_failures_total.clone()))?;

        let player_resolution_failures_total = IntCounter::new(
            "game_finder_player_resolution_failures_total",
            "Players of a found game that could not be handed off",
        )?;
        registry.register(Box::new(player_resolution_failures_total.clone()))?;

        let wait_time_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "game_finder_wait_time_seconds",
                "Time a request waited before settling",
            )
            .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        )?;
        registry.register(Box::new(wait_time_seconds.clone()))?;

        Ok(Self {
            requests_total,
            waiting_groups,
            waiting_players,
            pending_ready_checks,
            games_found_total,
            groups_rejected_total,
            ready_checks_total,
            passes_total,
            pass_failures_total,
            player_resolution_failures_total,
            wait_time_seconds,
        })
    }
}

impl PerformanceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let pass_duration = Histogram::with_opts(
            HistogramOpts::new(
                "game_finder_pass_duration_seconds",
                "Matching pass duration",
            )
            .buckets(vec![0.0001, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        registry.register(Box::new(pass_duration.clone()))?;

        let amqp_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "game_finder_amqp_operation_duration_seconds",
                "AMQP operation duration",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["operation", "status"],
        )?;
        registry.register(Box::new(amqp_operation_duration.clone()))?;

        Ok(Self {
            pass_duration,
            amqp_operation_duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_from_stats_moves_counters_by_delta() {
        let collector = MetricsCollector::new().expect("Failed to create metrics collector");
        let mut stats = GameFinderStatsSnapshot {
            games_found: 3,
            waiting_groups: 4,
            waiting_players: 6,
            ready_checks_failed: 1,
            ..Default::default()
        };

        collector.update_from_stats(&stats);
        collector.update_from_stats(&stats);
        assert_eq!(collector.finder().games_found_total.get(), 3);
        assert_eq!(collector.finder().waiting_players.get(), 6);

        stats.games_found = 5;
        stats.waiting_groups = 0;
        collector.update_from_stats(&stats);
        assert_eq!(collector.finder().games_found_total.get(), 5);
        assert_eq!(collector.finder().waiting_groups.get(), 0);
        assert_eq!(
            collector
                .finder()
                .ready_checks_total
                .with_label_values(&["failed"])
                .get(),
            1
        );
    }

    #[test]
    fn test_request_outcomes_and_pass_durations() {
        let collector = MetricsCollector::new().expect("Failed to create metrics collector");

        collector.record_request_outcome("resolved");
        collector.record_request_outcome("resolved");
        collector.record_request_outcome("cancelled");
        collector.record_wait_time(1.5);
        collector.record_pass(Duration::from_millis(3));

        let requests = &collector.finder().requests_total;
        assert_eq!(requests.with_label_values(&["resolved"]).get(), 2);
        assert_eq!(requests.with_label_values(&["cancelled"]).get(), 1);
        assert_eq!(collector.finder().wait_time_seconds.get_sample_count(), 1);
        assert_eq!(collector.performance().pass_duration.get_sample_count(), 1);
    }

    #[test]
    fn test_health_status_updates() {
        let collector = MetricsCollector::new().expect("Failed to create metrics collector");

        collector.update_health_status(2);
        collector.update_component_health("pass_loop", true);
        collector.update_component_health("amqp", false);

        assert_eq!(collector.service().health_status.get(), 2);
        assert_eq!(
            collector
                .service()
                .component_health
                .with_label_values(&["amqp"])
                .get(),
            0
        );
    }

    #[test]
    fn test_metrics_timer() {
        let collector = MetricsCollector::new().expect("Failed to create metrics collector");
        let timer = collector.start_timer();

        std::thread::sleep(Duration::from_millis(10));
        assert!(timer.elapsed() >= Duration::from_millis(10));
        assert!(timer.stop() >= Duration::from_millis(10));
    }
}

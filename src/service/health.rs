//! Health checks for the game finder service
//!
//! The service is healthy while the pass loop runs and the broker connection
//! is open, degraded while it refuses new requests, and unhealthy otherwise.

use crate::finder::GameFinderStatsSnapshot;
use crate::service::app::AppState;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Health check status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Gauge value exported as `game_finder_health_status`
    pub fn as_gauge(self) -> u8 {
        match self {
            HealthStatus::Healthy => 2,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 0,
        }
    }

    fn worst(self, other: HealthStatus) -> HealthStatus {
        if self.as_gauge() <= other.as_gauge() {
            self
        } else {
            other
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "✅ healthy"),
            HealthStatus::Degraded => write!(f, "⚠️  degraded"),
            HealthStatus::Unhealthy => write!(f, "❌ unhealthy"),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub checks: Vec<ComponentCheck>,
    pub stats: GameFinderStatsSnapshot,
    pub uptime_seconds: u64,
}

/// Individual component health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub name: String,
    pub status: HealthStatus,
    /// Why the component is not healthy
    pub message: Option<String>,
    pub duration_ms: u64,
}

impl ComponentCheck {
    fn new(name: &str, started: Instant, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

impl HealthCheck {
    /// Full check of every component
    pub async fn check(app_state: Arc<AppState>) -> Result<Self> {
        let checks = vec![
            Self::check_service_running(&app_state),
            Self::check_pass_loop(&app_state),
            Self::check_accepting(&app_state),
            Self::check_amqp(&app_state),
        ];
        let status = checks
            .iter()
            .fold(HealthStatus::Healthy, |status, check| status.worst(check.status));

        Ok(HealthCheck {
            status,
            service: app_state.config().service.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now(),
            checks,
            stats: app_state.finder().stats(),
            uptime_seconds: app_state.uptime().as_secs(),
        })
    }

    /// The process is up and the pass loop is alive
    pub async fn liveness_check(app_state: Arc<AppState>) -> Result<HealthStatus> {
        if app_state.is_running() && app_state.finder().is_running() {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Unhealthy)
        }
    }

    /// The service can take FindGame requests
    pub async fn readiness_check(app_state: Arc<AppState>) -> Result<HealthStatus> {
        let status = [
            Self::check_service_running(&app_state),
            Self::check_pass_loop(&app_state),
            Self::check_accepting(&app_state),
            Self::check_amqp(&app_state),
        ]
        .iter()
        .fold(HealthStatus::Healthy, |status, check| status.worst(check.status));
        Ok(status)
    }

    fn check_service_running(app_state: &AppState) -> ComponentCheck {
        let started = Instant::now();
        if app_state.is_running() {
            ComponentCheck::new("service_running", started, HealthStatus::Healthy, None)
        } else {
            ComponentCheck::new(
                "service_running",
                started,
                HealthStatus::Unhealthy,
                Some("Service is not running".to_string()),
            )
        }
    }

    fn check_pass_loop(app_state: &AppState) -> ComponentCheck {
        let started = Instant::now();
        if app_state.finder().is_running() {
            ComponentCheck::new("pass_loop", started, HealthStatus::Healthy, None)
        } else {
            ComponentCheck::new(
                "pass_loop",
                started,
                HealthStatus::Unhealthy,
                Some("Matching pass loop is stopped".to_string()),
            )
        }
    }

    fn check_accepting(app_state: &AppState) -> ComponentCheck {
        let started = Instant::now();
        if app_state.finder().is_accepting_requests() {
            ComponentCheck::new("accepting_requests", started, HealthStatus::Healthy, None)
        } else {
            ComponentCheck::new(
                "accepting_requests",
                started,
                HealthStatus::Degraded,
                Some("New requests are refused".to_string()),
            )
        }
    }

    fn check_amqp(app_state: &AppState) -> ComponentCheck {
        let started = Instant::now();
        match app_state.amqp_connection() {
            Some(connection) if connection.is_alive() => {
                ComponentCheck::new("amqp_connection", started, HealthStatus::Healthy, None)
            }
            Some(_) => ComponentCheck::new(
                "amqp_connection",
                started,
                HealthStatus::Unhealthy,
                Some("Broker connection is closed".to_string()),
            ),
            None => ComponentCheck::new(
                "amqp_connection",
                started,
                HealthStatus::Healthy,
                Some("Offline mode".to_string()),
            ),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize health check: {}", e))
    }
}

//! Health check endpoints and Prometheus metrics server

use crate::metrics::collector::MetricsCollector;
use crate::service::app::AppState;
use crate::service::health::{HealthCheck, HealthStatus};
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const SERVICE_NAME: &str = "game-finder";

/// Health server configuration
#[derive(Debug, Clone)]
pub struct HealthServerConfig {
    /// Port to bind the health server to
    pub port: u16,
    /// Host to bind to (typically "0.0.0.0" for all interfaces)
    pub host: String,
}

impl Default for HealthServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
        }
    }
}

/// Shared state for the health server
#[derive(Clone)]
pub struct HealthServerState {
    pub metrics_collector: Arc<MetricsCollector>,
    pub app_state: Option<Arc<AppState>>,
}

/// Health server that provides HTTP endpoints for monitoring
pub struct HealthServer {
    config: HealthServerConfig,
    state: HealthServerState,
    shutdown: CancellationToken,
}

impl HealthServer {
    /// Create a new health server
    pub fn new(config: HealthServerConfig, metrics_collector: Arc<MetricsCollector>) -> Self {
        Self {
            config,
            state: HealthServerState {
                metrics_collector,
                app_state: None,
            },
            shutdown: CancellationToken::new(),
        }
    }

    /// Set the application state for health checks
    pub fn with_app_state(mut self, app_state: Arc<AppState>) -> Self {
        self.state.app_state = Some(app_state);
        self
    }

    /// Start the health server
    pub async fn start(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .context("Invalid health server address")?;

        let app = self.create_router();
        let listener = TcpListener::bind(addr).await?;

        info!("Health server listening on http://{}", addr);

        let shutdown = self.shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("Health server shutdown signal received");
            })
            .await?;

        info!("Health server stopped");
        Ok(())
    }

    /// Create the Axum router with all health endpoints
    fn create_router(&self) -> Router {
        Router::new()
            .route("/", get(root_handler))
            .route("/health", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/alive", get(alive_handler))
            .route("/metrics", get(metrics_handler))
            .route("/stats", get(stats_handler))
            .with_state(self.state.clone())
    }

    /// Stop the health server; a server not yet listening stops as soon as
    /// it starts
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping health server...");
        self.shutdown.cancel();
        Ok(())
    }
}

fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Body returned by every endpoint when the server runs without an
/// application attached
fn not_initialized() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "status": "unhealthy",
            "service": SERVICE_NAME,
            "version": version(),
            "error": "Service not initialized"
        })),
    )
        .into_response()
}

fn availability(status: HealthStatus) -> StatusCode {
    match status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    }
}

async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "service": SERVICE_NAME,
        "version": version(),
        "description": "Groups players into games",
        "endpoints": ["/health", "/ready", "/alive", "/metrics", "/stats"]
    }))
}

/// Liveness plus the size of the waiting pool
async fn health_handler(State(state): State<HealthServerState>) -> Response {
    debug!("Health check requested");
    let Some(app_state) = &state.app_state else {
        return not_initialized();
    };

    let status = HealthCheck::liveness_check(app_state.clone())
        .await
        .unwrap_or(HealthStatus::Unhealthy);
    let stats = app_state.finder().stats();
    (
        availability(status),
        Json(json!({
            "status": status,
            "service": SERVICE_NAME,
            "version": version(),
            "waitingGroups": stats.waiting_groups,
            "waitingPlayers": stats.waiting_players,
            "acceptingRequests": stats.accepting_requests
        })),
    )
        .into_response()
}

/// Ready means FindGame requests are taken: a service that stopped accepting
/// requests reports 503 here even though it is alive
async fn ready_handler(State(state): State<HealthServerState>) -> Response {
    debug!("Readiness check requested");
    let Some(app_state) = &state.app_state else {
        return not_initialized();
    };

    match HealthCheck::readiness_check(app_state.clone()).await {
        Ok(HealthStatus::Healthy) => (StatusCode::OK, "Ready").into_response(),
        Ok(HealthStatus::Degraded) => {
            (StatusCode::SERVICE_UNAVAILABLE, "Not accepting requests").into_response()
        }
        Ok(HealthStatus::Unhealthy) => {
            (StatusCode::SERVICE_UNAVAILABLE, "Not ready").into_response()
        }
        Err(e) => {
            error!("Readiness check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "Not ready").into_response()
        }
    }
}

async fn alive_handler(State(state): State<HealthServerState>) -> Response {
    let Some(app_state) = &state.app_state else {
        return not_initialized();
    };
    match HealthCheck::liveness_check(app_state.clone()).await {
        Ok(HealthStatus::Healthy) => (StatusCode::OK, "Alive").into_response(),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "Pass loop stopped").into_response(),
    }
}

/// Prometheus metrics endpoint handler
async fn metrics_handler(State(state): State<HealthServerState>) -> Response {
    debug!("Metrics endpoint requested");

    let metric_families = state.metrics_collector.registry().gather();
    let encoder = TextEncoder::new();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics_output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            metrics_output,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode metrics".to_string(),
            )
                .into_response()
        }
    }
}

/// Component checks, counters and the active settings
async fn stats_handler(State(state): State<HealthServerState>) -> Response {
    debug!("Stats endpoint requested");
    let Some(app_state) = &state.app_state else {
        return not_initialized();
    };

    match HealthCheck::check(app_state.clone()).await {
        Ok(health) => Json(json!({
            "service": {
                "name": health.service,
                "version": health.version,
                "status": health.status,
                "uptimeSeconds": health.uptime_seconds
            },
            "finder": health.stats,
            "settings": app_state.finder().settings(),
            "components": health.checks,
            "timestamp": chrono::Utc::now()
        }))
        .into_response(),
        Err(e) => {
            error!("Failed to collect stats: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to collect service stats" })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::service::AppOptions;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn bare_router() -> Router {
        let collector = Arc::new(MetricsCollector::new().unwrap());
        HealthServer::new(HealthServerConfig::default(), collector).create_router()
    }

    async fn offline_router() -> (Arc<AppState>, Router) {
        let mut config = AppConfig::default();
        config.service.health_port = 0;
        let state = AppState::new(
            config,
            AppOptions {
                offline: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let router = HealthServer::new(HealthServerConfig::default(), state.metrics())
            .with_app_state(state.clone())
            .create_router();
        (state, router)
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_root_lists_endpoints() {
        let (status, body) = get(&bare_router(), "/").await;
        assert_eq!(status, StatusCode::OK);
        let info: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(info["service"], SERVICE_NAME);
        assert_eq!(info["endpoints"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let collector = Arc::new(MetricsCollector::new().unwrap());
        collector.record_request_outcome("resolved");
        let app = HealthServer::new(HealthServerConfig::default(), collector).create_router();

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get(header::CONTENT_TYPE).unwrap();
        assert!(content_type.to_str().unwrap().contains("text/plain"));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("game_finder_requests_total"));
    }

    #[tokio::test]
    async fn test_every_check_unavailable_without_app_state() {
        let app = bare_router();
        for uri in ["/health", "/ready", "/alive", "/stats"] {
            let (status, _) = get(&app, uri).await;
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{}", uri);
        }
        let (status, _) = get(&app, "/nonexistent").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stopped_service_reports_unhealthy() {
        let (_state, app) = offline_router().await;

        let (status, body) = get(&app, "/stats").await;
        assert_eq!(status, StatusCode::OK);
        let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["finder"]["waiting_groups"], 0);
        assert_eq!(stats["service"]["status"], "unhealthy");
        assert_eq!(stats["settings"]["interval_seconds"], 1.0);

        // Not started: the pass loop is not running
        let (status, _) = get(&app, "/alive").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, body) = get(&app, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["acceptingRequests"], true);
    }

    #[tokio::test]
    async fn test_closed_service_is_alive_but_not_ready() {
        let (state, app) = offline_router().await;
        let finder = state.finder();
        state.start().await.unwrap();
        for _ in 0..200 {
            if finder.is_running() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        finder.set_accepting_requests(false);

        let (status, body) = get(&app, "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, b"Not accepting requests");
        let (status, _) = get(&app, "/alive").await;
        assert_eq!(status, StatusCode::OK);

        state.shutdown().await.unwrap();
    }
}

//! Prometheus metrics and the HTTP health endpoints

pub mod collector;
pub mod health;

pub use collector::{FinderMetrics, MetricsCollector, PerformanceMetrics, ServiceMetrics};
pub use health::{HealthServer, HealthServerConfig};

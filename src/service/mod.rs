//! Service layer: application state, command routing and health checks

pub mod app;
pub mod health;

pub use app::{AppOptions, AppState, GameFinderCommandHandler, ServiceError};
pub use health::{HealthCheck, HealthStatus};

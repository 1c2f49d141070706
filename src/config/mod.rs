//! Configuration management for the game finder service
//!
//! This module handles configuration loading from TOML files and environment
//! variables, validation, default values and hot reloading of the game finder
//! settings.

pub mod app;
pub mod watcher;

// Re-export commonly used types
pub use app::{
    validate_config, validate_game_finder_settings, AmqpSettings, AppConfig, GameFinderSettings,
    ReadyCheckSettings, ServiceSettings, StrategyKind, StrategySettings,
};
pub use watcher::ConfigWatcher;

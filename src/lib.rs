//! Game finder - matchmaking microservice
//!
//! Groups of players ask to find a game; periodic passes hand the waiting
//! groups to a pluggable matching strategy, optionally run a ready check over
//! the proposed games, and resolve accepted games into hosted sessions.
//! Commands arrive over AMQP and notifications are published per session.

pub mod amqp;
pub mod config;
pub mod error;
pub mod finder;
pub mod metrics;
pub mod service;
pub mod session;
pub mod strategy;
pub mod types;
pub mod utils;

pub use error::{ClientError, GameFinderError, Result};
pub use types::*;

pub use finder::{FindGameOutcome, GameFinderService};
pub use strategy::MatchingStrategy;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

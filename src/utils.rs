//! Utility functions for the game finder service

use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::types::GameId;

/// Generate a new unique game ID
pub fn generate_game_id() -> GameId {
    Uuid::new_v4().to_string()
}

/// Generate a correlation id for outbound messages
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Get the current UTC timestamp
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Convert a fractional number of seconds into a duration, clamping
/// non-finite and negative values to zero
pub fn seconds_to_duration(seconds: f64) -> Duration {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::from_secs_f64(seconds)
    } else {
        Duration::ZERO
    }
}

/// Seconds elapsed since `since`
pub fn seconds_since(since: DateTime<Utc>) -> f64 {
    let elapsed = current_timestamp().signed_duration_since(since);
    elapsed.num_milliseconds().max(0) as f64 / 1000.0
}

//! AMQP message definitions and serialization

use serde::{Deserialize, Serialize};

use crate::error::{GameFinderError, Result};
use crate::types::{Notification, Priority, Reliability, SessionId, UserId};

/// Default queue carrying client commands
pub const COMMAND_QUEUE: &str = "gamefinder.commands";
/// Default topic exchange for player notifications
pub const NOTIFICATIONS_EXCHANGE: &str = "gamefinder.notifications";

/// Commands forwarded by the session layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum GameFinderCommand {
    /// A client session authenticated as `user_id`
    SessionConnected {
        session_id: SessionId,
        user_id: UserId,
    },
    /// A client session went away
    SessionDisconnected { session_id: SessionId },
    /// Start searching; `payload` is handed to the data extractors
    FindGame {
        session_id: SessionId,
        #[serde(default)]
        payload: serde_json::Value,
    },
    /// Stop the search of the session's group
    CancelGame { session_id: SessionId },
    /// Answer to a ready check
    ReadyResponse { session_id: SessionId, accept: bool },
}

impl GameFinderCommand {
    pub fn session_id(&self) -> &str {
        match self {
            GameFinderCommand::SessionConnected { session_id, .. }
            | GameFinderCommand::SessionDisconnected { session_id }
            | GameFinderCommand::FindGame { session_id, .. }
            | GameFinderCommand::CancelGame { session_id }
            | GameFinderCommand::ReadyResponse { session_id, .. } => session_id,
        }
    }

    /// Short name used in logs and metrics labels
    pub fn name(&self) -> &'static str {
        match self {
            GameFinderCommand::SessionConnected { .. } => "session_connected",
            GameFinderCommand::SessionDisconnected { .. } => "session_disconnected",
            GameFinderCommand::FindGame { .. } => "find_game",
            GameFinderCommand::CancelGame { .. } => "cancel_game",
            GameFinderCommand::ReadyResponse { .. } => "ready_response",
        }
    }
}

/// Notification addressed to one session, as published on the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundNotification {
    pub session_id: SessionId,
    pub route: String,
    pub priority: Priority,
    pub reliability: Reliability,
    pub notification: Notification,
}

/// Message envelope with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub payload: T,
    pub correlation_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub routing_key: String,
}

impl<T> MessageEnvelope<T>
where
    T: Serialize + serde::de::DeserializeOwned,
{
    /// Create a new message envelope
    pub fn new(payload: T, routing_key: String) -> Self {
        Self {
            payload,
            correlation_id: crate::utils::generate_correlation_id(),
            timestamp: crate::utils::current_timestamp(),
            routing_key,
        }
    }

    /// Serialize the envelope to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            GameFinderError::InternalError {
                message: format!("Failed to serialize message: {}", e),
            }
            .into()
        })
    }

    /// Deserialize envelope from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            GameFinderError::InvalidCommand {
                reason: format!("Failed to deserialize message: {}", e),
            }
            .into()
        })
    }
}

/// Message serialization and validation utilities
pub struct MessageUtils;

impl MessageUtils {
    /// Deserialize and validate a command
    pub fn deserialize_command(bytes: &[u8]) -> Result<GameFinderCommand> {
        let command: GameFinderCommand =
            serde_json::from_slice(bytes).map_err(|e| GameFinderError::InvalidCommand {
                reason: format!("Failed to deserialize command: {}", e),
            })?;

        Self::validate_command(&command)?;
        Ok(command)
    }

    /// Validate a command
    pub fn validate_command(command: &GameFinderCommand) -> Result<()> {
        if command.session_id().is_empty() {
            return Err(GameFinderError::InvalidCommand {
                reason: "Session ID cannot be empty".to_string(),
            }
            .into());
        }

        if let GameFinderCommand::SessionConnected { user_id, .. } = command {
            if user_id.is_empty() {
                return Err(GameFinderError::InvalidCommand {
                    reason: "User ID cannot be empty".to_string(),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Routing key of a notification for one session: `<route>.<session_id>`
    pub fn routing_key(route: &str, session_id: &str) -> String {
        format!("{}.{}", route, session_id)
    }

    /// Raw FindGame payload handed to the extractors; `null` means no payload
    pub fn payload_bytes(payload: &serde_json::Value) -> Result<Vec<u8>> {
        if payload.is_null() {
            return Ok(Vec::new());
        }
        serde_json::to_vec(payload).map_err(|e| {
            GameFinderError::InternalError {
                message: format!("Failed to serialize payload: {}", e),
            }
            .into()
        })
    }
}

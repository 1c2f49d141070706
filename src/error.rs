//! Error types for the game finder service
//!
//! Fallible operations return `anyhow::Result`. Caller-facing failures are
//! carried as [`ClientError`] inside the anyhow error so that the service can
//! recover them with `downcast_ref` and forward their public reason.

/// Result type alias for convenience
pub type Result<T> = anyhow::Result<T>;

/// Caller-facing errors, returned to the FindGame caller and
/// broadcast to the group as a failure notification
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("'{user_id}' has disconnected.")]
    Disconnected { user_id: String },

    #[error("'{user_id}' is already waiting for a game.")]
    AlreadyWaiting { user_id: String },

    #[error("The game finder is not accepting requests.")]
    Disabled,

    #[error("Request rejected: {reason}")]
    Rejected { reason: String },
}

impl ClientError {
    /// Machine-readable reason sent to clients
    pub fn reason(&self) -> &str {
        match self {
            ClientError::Disconnected { .. } => "disconnected",
            ClientError::AlreadyWaiting { .. } => "alreadyWaiting",
            ClientError::Disabled => "disabled",
            ClientError::Rejected { reason } => reason,
        }
    }
}

/// Internal error types for specific game finder scenarios
#[derive(Debug, thiserror::Error)]
pub enum GameFinderError {
    #[error("Matching strategy failed: {reason}")]
    StrategyFailed { reason: String },

    #[error("Game resolution failed for game {game_id}: {reason}")]
    ResolutionFailed { game_id: String, reason: String },

    #[error("Invalid command: {reason}")]
    InvalidCommand { reason: String },

    #[error("AMQP connection failed: {message}")]
    AmqpConnectionFailed { message: String },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Internal service error: {message}")]
    InternalError { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_reasons() {
        let disconnected = ClientError::Disconnected {
            user_id: "alice".to_string(),
        };
        assert_eq!(disconnected.reason(), "disconnected");
        assert_eq!(disconnected.to_string(), "'alice' has disconnected.");

        let waiting = ClientError::AlreadyWaiting {
            user_id: "bob".to_string(),
        };
        assert_eq!(waiting.reason(), "alreadyWaiting");

        assert_eq!(ClientError::Disabled.reason(), "disabled");

        let rejected = ClientError::Rejected {
            reason: "groupTooLarge".to_string(),
        };
        assert_eq!(rejected.reason(), "groupTooLarge");
    }

    #[test]
    fn test_client_error_survives_anyhow() {
        let err: anyhow::Error = ClientError::Disabled.into();
        let recovered = err.downcast_ref::<ClientError>();
        assert_eq!(recovered, Some(&ClientError::Disabled));
    }
}

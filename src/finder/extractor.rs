//! Data extractors turning a raw FindGame payload into a group

use async_trait::async_trait;
use tracing::debug;

use crate::config::StrategySettings;
use crate::error::{GameFinderError, Result};
use crate::types::{GameFinderParameters, GroupData, PeerHandle, UserId};

/// Group being assembled from a FindGame payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupDraft {
    /// User ids searching together; the requester alone when left empty
    pub members: Vec<UserId>,
    pub data: GroupData,
}

impl GroupDraft {
    /// Add a member unless already present
    pub fn add_member(&mut self, user_id: impl Into<UserId>) {
        let user_id = user_id.into();
        if !self.members.contains(&user_id) {
            self.members.push(user_id);
        }
    }
}

/// Turns a payload into group members and matchmaking data.
///
/// Extractors run in order; the first returning `Ok(true)` claims the payload.
/// An error aborts the FindGame call before anything is registered.
#[async_trait]
pub trait DataExtractor: Send + Sync {
    async fn extract_data(
        &self,
        payload: &[u8],
        requester: &PeerHandle,
        group: &mut GroupDraft,
    ) -> Result<bool>;

    /// Apply reloaded settings
    fn refresh_config(&self, _settings: &StrategySettings) {}
}

/// Claims JSON [`GameFinderParameters`] payloads
#[derive(Debug, Default)]
pub struct ParametersExtractor;

impl ParametersExtractor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DataExtractor for ParametersExtractor {
    async fn extract_data(
        &self,
        payload: &[u8],
        requester: &PeerHandle,
        group: &mut GroupDraft,
    ) -> Result<bool> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Ok(false);
        }

        let parameters: GameFinderParameters =
            serde_json::from_slice(payload).map_err(|e| GameFinderError::InvalidCommand {
                reason: format!("Invalid game finder parameters: {}", e),
            })?;

        group.add_member(requester.user_id.clone());
        for member in &parameters.members {
            group.add_member(member.clone());
        }
        debug!(
            "Extracted parameters for {} ({} member(s))",
            requester.user_id,
            group.members.len()
        );
        group.data = GroupData::Parameters(parameters);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requester() -> PeerHandle {
        PeerHandle {
            session_id: "s1".to_string(),
            user_id: "alice".to_string(),
        }
    }

    #[tokio::test]
    async fn test_claims_parameters() {
        let mut draft = GroupDraft::default();
        let claimed = ParametersExtractor::new()
            .extract_data(
                br#"{"gameId":"g-1","members":["bob","alice"],"rating":{"rating":1600.0,"uncertainty":90.0}}"#,
                &requester(),
                &mut draft,
            )
            .await
            .unwrap();

        assert!(claimed);
        assert_eq!(draft.members, vec!["alice".to_string(), "bob".to_string()]);
        let parameters = draft.data.parameters().unwrap();
        assert_eq!(parameters.game_id.as_deref(), Some("g-1"));
        assert_eq!(parameters.rating.as_ref().map(|r| r.rating), Some(1600.0));
    }

    #[tokio::test]
    async fn test_empty_payload_not_claimed() {
        let mut draft = GroupDraft::default();
        let claimed = ParametersExtractor::new()
            .extract_data(b"  ", &requester(), &mut draft)
            .await
            .unwrap();

        assert!(!claimed);
        assert_eq!(draft, GroupDraft::default());
    }

    #[tokio::test]
    async fn test_malformed_payload_errors() {
        let mut draft = GroupDraft::default();
        let result = ParametersExtractor::new()
            .extract_data(b"{not json", &requester(), &mut draft)
            .await;
        assert!(result.is_err());
    }
}

//! Common types used throughout the game finder service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skillratings::weng_lin::WengLinRating;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identifier of a connected client session
pub type SessionId = String;

/// Application user identifier
pub type UserId = String;

/// Identifier of a proposed game
pub type GameId = String;

/// Route carrying search status updates
pub const UPDATE_NOTIFICATION_ROUTE: &str = "gamefinder.update";
/// Route carrying ready-check tallies
pub const UPDATE_READYCHECK_ROUTE: &str = "gamefinder.ready.update";
/// Route echoing the FindGame parameters to every group member
pub const UPDATE_PARAMETERS_ROUTE: &str = "gamefinder.parameters.update";

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a group; two groups with the same players are still
/// different groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub u64);

impl GroupId {
    /// Allocate a fresh, process-unique group id
    pub fn next() -> Self {
        GroupId(NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group-{}", self.0)
    }
}

/// Rating information for a player or group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRating {
    pub rating: f64,
    pub uncertainty: f64,
}

impl Default for PlayerRating {
    fn default() -> Self {
        Self {
            rating: 1500.0,
            uncertainty: 200.0,
        }
    }
}

impl From<WengLinRating> for PlayerRating {
    fn from(rating: WengLinRating) -> Self {
        Self {
            rating: rating.rating,
            uncertainty: rating.uncertainty,
        }
    }
}

impl From<PlayerRating> for WengLinRating {
    fn from(rating: PlayerRating) -> Self {
        Self {
            rating: rating.rating,
            uncertainty: rating.uncertainty,
        }
    }
}

/// A player waiting as part of a group
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Player {
    pub session_id: SessionId,
    pub user_id: UserId,
}

impl Player {
    pub fn new(session_id: impl Into<SessionId>, user_id: impl Into<UserId>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// Parameters a client sends along with a FindGame request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameFinderParameters {
    /// Requested game id; groups asking for the same id end up together
    #[serde(default)]
    pub game_id: Option<String>,
    /// Group rating used by rating-aware strategies
    #[serde(default)]
    pub rating: Option<PlayerRating>,
    /// Preferred region
    #[serde(default)]
    pub region: Option<String>,
    /// Additional members (user ids) searching together with the requester
    #[serde(default)]
    pub members: Vec<UserId>,
}

/// Matchmaking data attached to a group by a data extractor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GroupData {
    #[default]
    None,
    Parameters(GameFinderParameters),
}

impl GroupData {
    /// Parameters, if the extractor attached any
    pub fn parameters(&self) -> Option<&GameFinderParameters> {
        match self {
            GroupData::Parameters(parameters) => Some(parameters),
            GroupData::None => None,
        }
    }
}

/// A unit of matchmaking demand: one or more players searching together.
///
/// Equality and hashing use the group id only.
#[derive(Debug, Clone, Serialize)]
pub struct Group {
    id: GroupId,
    players: Vec<Player>,
    data: GroupData,
    created_at: DateTime<Utc>,
}

impl Group {
    pub fn new(players: Vec<Player>, data: GroupData) -> Self {
        Self {
            id: GroupId::next(),
            players,
            data,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn players(&self) -> &[Player] {
        &self.players
    }

    pub fn data(&self) -> &GroupData {
        &self.data
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn contains_user(&self, user_id: &str) -> bool {
        self.players.iter().any(|p| p.user_id == user_id)
    }
}

impl PartialEq for Group {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Group {}

impl Hash for Group {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// A team inside a proposed game
#[derive(Debug, Clone, Default)]
pub struct Team {
    pub groups: Vec<Arc<Group>>,
}

impl Team {
    pub fn new(groups: Vec<Arc<Group>>) -> Self {
        Self { groups }
    }

    pub fn player_count(&self) -> usize {
        self.groups.iter().map(|g| g.players().len()).sum()
    }
}

const REQUESTED_GAME_ID: &str = "requestedGameId";

/// A proposed pairing of groups into teams
#[derive(Debug, Clone)]
pub struct Game {
    pub id: GameId,
    pub teams: Vec<Team>,
    pub custom_data: Option<serde_json::Value>,
}

impl Game {
    pub fn new(teams: Vec<Team>) -> Self {
        Self::with_id(crate::utils::generate_game_id(), teams)
    }

    pub fn with_id(id: impl Into<GameId>, teams: Vec<Team>) -> Self {
        Self {
            id: id.into(),
            teams,
            custom_data: None,
        }
    }

    /// Game built for a client-requested game id. The game itself still gets
    /// a unique id; the requested one travels in `custom_data`.
    pub fn requested(requested_id: &str, teams: Vec<Team>) -> Self {
        let mut data = serde_json::Map::new();
        data.insert(REQUESTED_GAME_ID.to_string(), requested_id.into());
        let mut game = Self::new(teams);
        game.custom_data = Some(serde_json::Value::Object(data));
        game
    }

    /// Game id the players asked for, if any
    pub fn requested_id(&self) -> Option<&str> {
        self.custom_data.as_ref()?.get(REQUESTED_GAME_ID)?.as_str()
    }

    pub fn all_groups(&self) -> impl Iterator<Item = &Arc<Group>> {
        self.teams.iter().flat_map(|t| t.groups.iter())
    }

    pub fn all_players(&self) -> impl Iterator<Item = &Player> {
        self.all_groups().flat_map(|g| g.players().iter())
    }

    pub fn contains_group(&self, group_id: GroupId) -> bool {
        self.all_groups().any(|g| g.id() == group_id)
    }
}

/// Resolved game handed back to every FindGame caller of the game
#[derive(Debug, Clone)]
pub struct GameContext {
    pub game: Arc<Game>,
    /// Session the players were handed off to, if the resolver created one
    pub session_id: Option<String>,
}

/// Lifecycle state of a pending request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RequestState {
    NotStarted = 0,
    Ready = 1,
    Searching = 2,
    Found = 3,
    Validated = 4,
    Rejected = 5,
}

impl RequestState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => RequestState::Ready,
            2 => RequestState::Searching,
            3 => RequestState::Found,
            4 => RequestState::Validated,
            5 => RequestState::Rejected,
            _ => RequestState::NotStarted,
        }
    }
}

/// Why a pending request was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CancelReason {
    /// The caller's cancellation token fired
    Caller,
    /// A player explicitly cancelled the search
    PlayerRequest,
    /// A member's session disconnected
    Disconnected,
    /// A member did not answer the ready check in time
    ReadyCheckTimeout,
    /// A member declined the ready check
    ReadyCheckDeclined,
    /// The service stopped accepting requests
    NotAccepting,
    /// The service is shutting down
    Shutdown,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::Caller => "cancelled",
            CancelReason::PlayerRequest => "playerCancelled",
            CancelReason::Disconnected => "disconnected",
            CancelReason::ReadyCheckTimeout => "readyCheckTimeout",
            CancelReason::ReadyCheckDeclined => "readyCheckDeclined",
            CancelReason::NotAccepting => "notAccepting",
            CancelReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to a live, connected peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerHandle {
    pub session_id: SessionId,
    pub user_id: UserId,
}

/// Answer of a single player to a ready check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadyStatus {
    Pending,
    Accepted,
    Declined,
}

/// Per-player entry of a ready-check tally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyCheckPlayerStatus {
    pub user_id: UserId,
    pub status: ReadyStatus,
}

/// Current tally of a ready check, pushed to its players on every change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyCheckUpdate {
    pub game_id: GameId,
    pub accepted: usize,
    pub declined: usize,
    pub pending: usize,
    pub players: Vec<ReadyCheckPlayerStatus>,
}

/// Search status pushed on [`UPDATE_NOTIFICATION_ROUTE`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum StatusUpdate {
    SearchStart,
    WaitingPlayersReady,
    Success { payload: serde_json::Value },
    Failed { reason: Option<String> },
    Cancelled { reason: CancelReason },
}

/// Notification payloads sent to players
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Notification {
    Status(StatusUpdate),
    ReadyCheck(ReadyCheckUpdate),
    Parameters(serde_json::Value),
}

impl Notification {
    /// Route the notification is delivered on
    pub fn route(&self) -> &'static str {
        match self {
            Notification::Status(_) => UPDATE_NOTIFICATION_ROUTE,
            Notification::ReadyCheck(_) => UPDATE_READYCHECK_ROUTE,
            Notification::Parameters(_) => UPDATE_PARAMETERS_ROUTE,
        }
    }
}

/// Delivery priority requested from the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// Delivery guarantee requested from the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reliability {
    Unreliable,
    Reliable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_identity() {
        let players = vec![Player::new("s1", "alice")];
        let a = Group::new(players.clone(), GroupData::None);
        let b = Group::new(players, GroupData::None);

        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert!(a.id() < b.id());
    }

    #[test]
    fn test_game_group_queries() {
        let g1 = Arc::new(Group::new(vec![Player::new("s1", "alice")], GroupData::None));
        let g2 = Arc::new(Group::new(
            vec![Player::new("s2", "bob"), Player::new("s3", "carol")],
            GroupData::None,
        ));
        let game = Game::new(vec![Team::new(vec![g1.clone()]), Team::new(vec![g2.clone()])]);

        assert_eq!(game.all_groups().count(), 2);
        assert_eq!(game.all_players().count(), 3);
        assert!(game.contains_group(g2.id()));
        assert_eq!(game.teams[1].player_count(), 2);
    }

    #[test]
    fn test_request_state_round_trip() {
        for state in [
            RequestState::NotStarted,
            RequestState::Ready,
            RequestState::Searching,
            RequestState::Found,
            RequestState::Validated,
            RequestState::Rejected,
        ] {
            assert_eq!(RequestState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_notification_routes() {
        assert_eq!(
            Notification::Status(StatusUpdate::SearchStart).route(),
            UPDATE_NOTIFICATION_ROUTE
        );
        assert_eq!(
            Notification::Parameters(serde_json::Value::Null).route(),
            UPDATE_PARAMETERS_ROUTE
        );
    }

    #[test]
    fn test_status_update_wire_shape() {
        let update = StatusUpdate::Cancelled {
            reason: CancelReason::ReadyCheckTimeout,
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["status"], "cancelled");
        assert_eq!(json["reason"], "readyCheckTimeout");
    }

    #[test]
    fn test_group_data_parameters() {
        let data: GroupData =
            serde_json::from_str(r#"{"type":"parameters","gameId":"g-1"}"#).unwrap();
        assert_eq!(
            data.parameters().and_then(|p| p.game_id.as_deref()),
            Some("g-1")
        );
    }
}

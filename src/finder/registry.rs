//! Concurrent store of waiting groups and the player index

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{ClientError, Result};
use crate::finder::request::{PendingRequest, SettlementReceiver};
use crate::types::{Group, GroupId, RequestState, SessionId};

/// Waiting groups keyed by group id, plus a session id to group id index.
///
/// A group is always inserted before its players are indexed and removed after
/// they are unindexed, so a player that can be looked up always resolves to a
/// present group.
#[derive(Debug, Default)]
pub struct RequestRegistry {
    groups: DashMap<GroupId, Arc<PendingRequest>>,
    players: DashMap<SessionId, GroupId>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a group. Fails with [`ClientError::AlreadyWaiting`] naming the
    /// first player already indexed to another group; nothing stays registered
    /// in that case.
    pub fn enqueue(&self, group: Arc<Group>) -> Result<(Arc<PendingRequest>, SettlementReceiver)> {
        let group_id = group.id();
        let (request, receiver) = PendingRequest::new(group.clone());
        self.groups.insert(group_id, request.clone());

        let mut claimed: Vec<&SessionId> = Vec::with_capacity(group.players().len());
        let mut conflict = None;
        for player in group.players() {
            // The entry guard holds a shard lock; it must be released before
            // rolling back.
            match self.players.entry(player.session_id.clone()) {
                Entry::Vacant(entry) => {
                    entry.insert(group_id);
                    claimed.push(&player.session_id);
                }
                Entry::Occupied(_) => {
                    conflict = Some(player);
                    break;
                }
            }
        }

        if let Some(player) = conflict {
            for session_id in claimed {
                self.players
                    .remove_if(session_id, |_, owner| *owner == group_id);
            }
            self.groups.remove(&group_id);
            debug!(
                "Rejected enqueue of {}: {} is already waiting",
                group_id, player.user_id
            );
            return Err(ClientError::AlreadyWaiting {
                user_id: player.user_id.clone(),
            }
            .into());
        }

        info!(
            "Enqueued {} with {} player(s)",
            group_id,
            group.players().len()
        );
        Ok((request, receiver))
    }

    /// Remove a group and unindex its players. Safe to call repeatedly;
    /// returns the removed request on the first call only.
    pub fn dequeue(&self, group: &Group) -> Option<Arc<PendingRequest>> {
        let group_id = group.id();
        for player in group.players() {
            self.players
                .remove_if(&player.session_id, |_, owner| *owner == group_id);
        }
        let removed = self.groups.remove(&group_id).map(|(_, request)| request);
        if removed.is_some() {
            debug!("Dequeued {}", group_id);
        }
        removed
    }

    /// Pending request of the group a session is waiting in
    pub fn lookup_by_player(&self, session_id: &str) -> Option<Arc<PendingRequest>> {
        let group_id = *self.players.get(session_id)?;
        self.get(group_id)
    }

    /// Group a session is waiting in
    pub fn lookup_group_by_player(&self, session_id: &str) -> Option<Arc<Group>> {
        self.lookup_by_player(session_id)
            .map(|request| request.group().clone())
    }

    pub fn get(&self, group_id: GroupId) -> Option<Arc<PendingRequest>> {
        self.groups.get(&group_id).map(|entry| entry.value().clone())
    }

    pub fn is_player_waiting(&self, session_id: &str) -> bool {
        self.players.contains_key(session_id)
    }

    /// Requests currently in the `Ready` state. Shards are read one at a time,
    /// so concurrent enqueues are never blocked for the whole snapshot.
    pub fn snapshot_ready(&self) -> Vec<Arc<PendingRequest>> {
        self.groups
            .iter()
            .filter(|entry| entry.value().state() == RequestState::Ready)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Snapshot the ready requests and claim each one for a pass by moving it
    /// to `Searching`. Requests that changed state in between are skipped.
    pub fn claim_ready(&self) -> Vec<Arc<PendingRequest>> {
        self.snapshot_ready()
            .into_iter()
            .filter(|request| request.transition(RequestState::Ready, RequestState::Searching))
            .collect()
    }

    /// Every pending request, regardless of state
    pub fn all(&self) -> Vec<Arc<PendingRequest>> {
        self.groups.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Number of registered groups
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Number of indexed players
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Number of groups and players in the `Ready` state
    pub fn waiting_counts(&self) -> (usize, usize) {
        self.groups
            .iter()
            .filter(|entry| entry.value().state() == RequestState::Ready)
            .fold((0, 0), |(groups, players), entry| {
                (groups + 1, players + entry.value().group().players().len())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GroupData, Player};
    use proptest::prelude::*;

    fn group(sessions: &[&str]) -> Arc<Group> {
        let players = sessions
            .iter()
            .map(|s| Player::new(*s, format!("user-{}", s)))
            .collect();
        Arc::new(Group::new(players, GroupData::None))
    }

    #[test]
    fn test_enqueue_indexes_players() {
        let registry = RequestRegistry::new();
        let g = group(&["s1", "s2"]);

        let (request, _rx) = registry.enqueue(g.clone()).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.player_count(), 2);
        assert_eq!(request.state(), RequestState::NotStarted);
        assert_eq!(registry.lookup_group_by_player("s2").unwrap().id(), g.id());
        assert!(registry.lookup_group_by_player("s3").is_none());
    }

    #[test]
    fn test_enqueue_conflict_rolls_back() {
        let registry = RequestRegistry::new();
        let first = group(&["s2"]);
        registry.enqueue(first.clone()).unwrap();

        let second = group(&["s1", "s2", "s3"]);
        let err = registry.enqueue(second).unwrap_err();

        assert_eq!(
            err.downcast_ref::<ClientError>(),
            Some(&ClientError::AlreadyWaiting {
                user_id: "user-s2".to_string()
            })
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.player_count(), 1);
        assert!(!registry.is_player_waiting("s1"));
        assert_eq!(registry.lookup_group_by_player("s2").unwrap().id(), first.id());
    }

    #[test]
    fn test_dequeue_is_idempotent() {
        let registry = RequestRegistry::new();
        let g = group(&["s1"]);
        registry.enqueue(g.clone()).unwrap();

        assert!(registry.dequeue(&g).is_some());
        assert!(registry.dequeue(&g).is_none());
        assert!(registry.is_empty());
        assert_eq!(registry.player_count(), 0);
    }

    #[test]
    fn test_dequeue_keeps_foreign_index_entries() {
        let registry = RequestRegistry::new();
        let stale = group(&["s1"]);
        registry.enqueue(stale.clone()).unwrap();
        registry.dequeue(&stale);

        let fresh = group(&["s1"]);
        registry.enqueue(fresh.clone()).unwrap();
        registry.dequeue(&stale);

        assert_eq!(registry.lookup_group_by_player("s1").unwrap().id(), fresh.id());
    }

    #[test]
    fn test_claim_ready_is_exclusive() {
        let registry = RequestRegistry::new();
        let (ready, _rx1) = registry.enqueue(group(&["s1"])).unwrap();
        let (_not_started, _rx2) = registry.enqueue(group(&["s2"])).unwrap();
        ready.set_state(RequestState::Ready);

        assert_eq!(registry.waiting_counts(), (1, 1));
        let claimed = registry.claim_ready();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].state(), RequestState::Searching);
        assert!(registry.claim_ready().is_empty());
    }

    proptest! {
        #[test]
        fn prop_player_never_in_two_groups(
            ops in prop::collection::vec((prop::collection::vec(0u8..8, 1..4), any::<bool>()), 1..40)
        ) {
            let registry = RequestRegistry::new();
            let mut live: Vec<Arc<Group>> = Vec::new();

            for (members, remove_first) in ops {
                if remove_first && !live.is_empty() {
                    let g = live.remove(0);
                    registry.dequeue(&g);
                }

                let mut sessions: Vec<String> = members.iter().map(|m| format!("s{}", m)).collect();
                sessions.sort();
                sessions.dedup();
                let refs: Vec<&str> = sessions.iter().map(String::as_str).collect();
                let g = group(&refs);
                if registry.enqueue(g.clone()).is_ok() {
                    live.push(g);
                }

                let mut seen = std::collections::HashSet::new();
                for g in &live {
                    for p in g.players() {
                        prop_assert!(seen.insert(p.session_id.clone()));
                        let indexed = registry.lookup_group_by_player(&p.session_id);
                        prop_assert_eq!(indexed.map(|x| x.id()), Some(g.id()));
                    }
                }
                prop_assert_eq!(registry.len(), live.len());
                prop_assert_eq!(registry.player_count(), seen.len());
            }
        }
    }
}

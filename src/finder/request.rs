//! Pending requests and their one-shot settlement

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::ClientError;
use crate::types::{CancelReason, Game, GameContext, Group, RequestState};

/// Final outcome of a pending request
#[derive(Debug, Clone)]
pub enum Settlement {
    /// A game was found and resolved
    Resolved(GameContext),
    /// The request failed with a caller-facing error
    Failed(ClientError),
    /// The request was cancelled
    Cancelled(CancelReason),
}

impl Settlement {
    /// Request state recorded once this settlement wins
    fn final_state(&self) -> RequestState {
        match self {
            Settlement::Resolved(_) => RequestState::Validated,
            Settlement::Failed(_) | Settlement::Cancelled(_) => RequestState::Rejected,
        }
    }
}

/// Receiving half handed to the FindGame caller
pub type SettlementReceiver = oneshot::Receiver<Settlement>;

/// Waiting request of a single group.
///
/// Settlement is first-writer-wins: the sender is taken out of its slot by the
/// first settle call, later calls find the slot empty and do nothing.
#[derive(Debug)]
pub struct PendingRequest {
    group: Arc<Group>,
    state: AtomicU8,
    completion: Mutex<Option<oneshot::Sender<Settlement>>>,
    candidate: Mutex<Option<Arc<Game>>>,
    enqueued_at: DateTime<Utc>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // The guarded slots hold plain values; a panic elsewhere cannot leave them
    // half-written.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PendingRequest {
    /// Create a request in the `NotStarted` state together with the receiver
    /// that yields its settlement
    pub fn new(group: Arc<Group>) -> (Arc<Self>, SettlementReceiver) {
        let (tx, rx) = oneshot::channel();
        let request = Arc::new(Self {
            group,
            state: AtomicU8::new(RequestState::NotStarted as u8),
            completion: Mutex::new(Some(tx)),
            candidate: Mutex::new(None),
            enqueued_at: Utc::now(),
        });
        (request, rx)
    }

    pub fn group(&self) -> &Arc<Group> {
        &self.group
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub fn state(&self) -> RequestState {
        RequestState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: RequestState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Atomically move from `from` to `to`; returns false if the request was
    /// not in `from`
    pub fn transition(&self, from: RequestState, to: RequestState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Settle the request. Returns true if this call won; settling an already
    /// settled request is a no-op.
    pub fn settle(&self, settlement: Settlement) -> bool {
        let sender = lock(&self.completion).take();
        match sender {
            Some(sender) => {
                self.set_state(settlement.final_state());
                debug!(
                    "Settled request of {}: {:?}",
                    self.group.id(),
                    self.state()
                );
                // The caller may have stopped listening; the request is settled
                // either way.
                let _ = sender.send(settlement);
                true
            }
            None => false,
        }
    }

    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.settle(Settlement::Cancelled(reason))
    }

    pub fn fail(&self, error: ClientError) -> bool {
        self.settle(Settlement::Failed(error))
    }

    pub fn is_settled(&self) -> bool {
        lock(&self.completion).is_none()
    }

    pub fn set_candidate(&self, game: Arc<Game>) {
        *lock(&self.candidate) = Some(game);
    }

    pub fn candidate(&self) -> Option<Arc<Game>> {
        lock(&self.candidate).clone()
    }

    pub fn clear_candidate(&self) {
        lock(&self.candidate).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GroupData, Player, Team};

    fn request() -> (Arc<PendingRequest>, SettlementReceiver) {
        let group = Arc::new(Group::new(vec![Player::new("s1", "alice")], GroupData::None));
        PendingRequest::new(group)
    }

    #[tokio::test]
    async fn test_first_settlement_wins() {
        let (request, rx) = request();

        assert!(request.cancel(CancelReason::Disconnected));
        assert!(!request.cancel(CancelReason::PlayerRequest));
        assert!(!request.fail(ClientError::Disabled));
        assert!(request.is_settled());
        assert_eq!(request.state(), RequestState::Rejected);

        match rx.await.unwrap() {
            Settlement::Cancelled(reason) => assert_eq!(reason, CancelReason::Disconnected),
            other => panic!("unexpected settlement {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resolved_settlement_validates() {
        let (request, rx) = request();
        let game = Arc::new(Game::new(vec![Team::new(vec![request.group().clone()])]));
        let context = GameContext {
            game: game.clone(),
            session_id: None,
        };

        assert!(request.settle(Settlement::Resolved(context)));
        assert_eq!(request.state(), RequestState::Validated);

        match rx.await.unwrap() {
            Settlement::Resolved(ctx) => assert_eq!(ctx.game.id, game.id),
            other => panic!("unexpected settlement {:?}", other),
        }
    }

    #[test]
    fn test_settle_after_receiver_dropped() {
        let (request, rx) = request();
        drop(rx);
        assert!(request.cancel(CancelReason::Shutdown));
        assert!(!request.cancel(CancelReason::Shutdown));
    }

    #[test]
    fn test_state_transition_is_exclusive() {
        let (request, _rx) = request();
        assert!(!request.transition(RequestState::Ready, RequestState::Searching));
        assert!(request.transition(RequestState::NotStarted, RequestState::Ready));
        assert!(request.transition(RequestState::Ready, RequestState::Searching));
        assert!(!request.transition(RequestState::Ready, RequestState::Searching));
        assert_eq!(request.state(), RequestState::Searching);
    }

    #[test]
    fn test_candidate_slot() {
        let (request, _rx) = request();
        assert!(request.candidate().is_none());

        let game = Arc::new(Game::new(vec![Team::new(vec![request.group().clone()])]));
        request.set_candidate(game.clone());
        assert_eq!(request.candidate().map(|g| g.id.clone()), Some(game.id.clone()));

        request.clear_candidate();
        assert!(request.candidate().is_none());
    }
}

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

/// Independent reasons to keep the wallet offline. Each one votes separately, so that
/// one signal recovering cannot re-enable connectivity another signal still forbids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    AppBackgrounded,
    UserRequested,
    NetworkLost,
    Other,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorState {
    pub wallet_available: bool,
    pub internet_available: bool,
    pub disconnect_votes: u32,
}

impl CoordinatorState {
    pub fn can_connect(&self) -> bool {
        self.wallet_available && self.internet_available && self.disconnect_votes == 0
    }
}

#[derive(Debug, Default)]
struct Votes {
    per_reason: HashMap<DisconnectReason, u32>,
}

impl Votes {
    fn total(&self) -> u32 {
        self.per_reason.values().sum()
    }
}

/// Policy gate in front of every outbound connection attempt.
///
/// `subscribe` yields whether connecting is currently allowed; the value only changes
/// when the outcome of [`CoordinatorState::can_connect`] changes.
#[derive(Debug)]
pub struct NetworkSessionCoordinator {
    state: watch::Sender<CoordinatorState>,
    can_connect: watch::Sender<bool>,
    votes: std::sync::Mutex<Votes>,
}

impl Default for NetworkSessionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkSessionCoordinator {
    pub fn new() -> Self {
        let (state, _) = watch::channel(CoordinatorState::default());
        let (can_connect, _) = watch::channel(false);
        Self {
            state,
            can_connect,
            votes: std::sync::Mutex::new(Votes::default()),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    pub fn can_connect(&self) -> bool {
        *self.can_connect.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.can_connect.subscribe()
    }

    pub fn set_wallet_available(&self, available: bool) {
        self.update(|_, state| state.wallet_available = available);
    }

    pub fn set_internet_available(&self, available: bool) {
        self.update(|_, state| state.internet_available = available);
    }

    pub fn add_disconnect_vote(&self, reason: DisconnectReason) {
        let state = self.update(|votes, state| {
            *votes.per_reason.entry(reason).or_default() += 1;
            state.disconnect_votes = votes.total();
        });
        debug!(
            "Disconnect vote added for {:?}, {} in total",
            reason, state.disconnect_votes
        );
    }

    /// Retract one vote for `reason`. Retracting a vote that was never cast is a no-op.
    pub fn remove_disconnect_vote(&self, reason: DisconnectReason) {
        let state = self.update(|votes, state| {
            if let Some(count) = votes.per_reason.get_mut(&reason) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    votes.per_reason.remove(&reason);
                }
            }
            state.disconnect_votes = votes.total();
        });
        debug!(
            "Disconnect vote removed for {:?}, {} remaining",
            reason, state.disconnect_votes
        );
    }

    fn lock_votes(&self) -> std::sync::MutexGuard<'_, Votes> {
        // The vote table holds plain counters, a poisoned lock still has usable data.
        self.votes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `f` and publish the result. The vote lock is held until both values are
    /// published, so concurrent updates are published in the order they are applied.
    fn update(&self, f: impl FnOnce(&mut Votes, &mut CoordinatorState)) -> CoordinatorState {
        let mut votes = self.lock_votes();
        let mut next = self.state();
        f(&mut votes, &mut next);
        self.state.send_replace(next);
        let allowed = next.can_connect();
        let changed = self.can_connect.send_if_modified(|current| {
            let changed = *current != allowed;
            *current = allowed;
            changed
        });
        drop(votes);
        if changed {
            info!("Connectivity is now {}", if allowed { "allowed" } else { "suspended" });
        }
        next
    }
}

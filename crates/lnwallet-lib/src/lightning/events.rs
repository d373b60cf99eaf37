use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use super::{
    channel::ChannelState,
    payment::{PartOutcome, PaymentStatus},
    readiness::ReadinessState,
    trampoline::RoutingMode,
    transport::ConnectionState,
    types::{Hash256, Pubkey},
};

pub const DEFAULT_EVENT_BUS_CAPACITY: usize = 1024;

/// How an HTLC we offered was resolved by the remote party.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HtlcResolution {
    Fulfilled { preimage: Hash256 },
    Failed { reason: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WalletEvent {
    PeerConnectionChanged {
        peer: Pubkey,
        state: ConnectionState,
    },
    ChannelStateChanged {
        channel_id: Hash256,
        peer: Pubkey,
        state: ChannelState,
    },
    // The temporary channel id was replaced by the id derived from the funding outpoint.
    ChannelIdChanged {
        old_channel_id: Hash256,
        new_channel_id: Hash256,
    },
    HtlcResolved {
        channel_id: Hash256,
        htlc_id: u64,
        payment_hash: Hash256,
        resolution: HtlcResolution,
    },
    PaymentPartCompleted {
        payment_hash: Hash256,
        part_id: u64,
        outcome: PartOutcome,
    },
    PaymentCompleted {
        payment_hash: Hash256,
        status: PaymentStatus,
    },
    RoutingModeChanged {
        old: RoutingMode,
        new: RoutingMode,
    },
    ReadinessChanged(ReadinessState),
}

/// Fan-out of [`WalletEvent`]s to any number of observers.
///
/// Each subscriber gets its own receiver; dropping the receiver unsubscribes. A slow
/// subscriber lags and skips events instead of blocking the emitting component.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<WalletEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUS_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: WalletEvent) {
        trace!("Emitting wallet event {:?}", event);
        // An error only means nobody is listening right now.
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

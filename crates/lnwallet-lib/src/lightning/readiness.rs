use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::events::{EventBus, WalletEvent};

/// Snapshot of which parts of the wallet core are up. It is derived from other
/// components and never persisted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessState {
    pub wallet_loaded: bool,
    pub transport_connected: bool,
    pub peer_connected: bool,
    pub channels_reestablished: bool,
    pub gossip_synced: bool,
    pub onchain_watcher_running: bool,
}

impl ReadinessState {
    pub fn can_receive(&self) -> bool {
        self.wallet_loaded
            && self.transport_connected
            && self.peer_connected
            && self.channels_reestablished
    }

    pub fn can_send(&self) -> bool {
        self.can_receive() && self.gossip_synced
    }

    pub fn can_manage_channels(&self) -> bool {
        self.wallet_loaded && self.peer_connected && self.onchain_watcher_running
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadinessSignal {
    WalletLoaded(bool),
    TransportConnected(bool),
    PeerConnected(bool),
    ChannelsReestablished(bool),
    GossipSynced(bool),
    OnchainWatcherRunning(bool),
}

/// Folds readiness signals into a [`ReadinessState`], publishing every change on a
/// watch channel and on the event bus.
#[derive(Debug)]
pub struct ReadinessTracker {
    state: watch::Sender<ReadinessState>,
    events: EventBus,
}

impl ReadinessTracker {
    pub fn new(events: EventBus) -> Self {
        let (state, _) = watch::channel(ReadinessState::default());
        Self { state, events }
    }

    pub fn current(&self) -> ReadinessState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReadinessState> {
        self.state.subscribe()
    }

    pub fn signal(&self, signal: ReadinessSignal) {
        let changed = self.state.send_if_modified(|state| {
            let old = *state;
            match signal {
                ReadinessSignal::WalletLoaded(v) => state.wallet_loaded = v,
                ReadinessSignal::TransportConnected(v) => state.transport_connected = v,
                ReadinessSignal::PeerConnected(v) => state.peer_connected = v,
                ReadinessSignal::ChannelsReestablished(v) => state.channels_reestablished = v,
                ReadinessSignal::GossipSynced(v) => state.gossip_synced = v,
                ReadinessSignal::OnchainWatcherRunning(v) => state.onchain_watcher_running = v,
            }
            old != *state
        });
        if changed {
            self.events
                .emit(WalletEvent::ReadinessChanged(self.current()));
        }
    }
}

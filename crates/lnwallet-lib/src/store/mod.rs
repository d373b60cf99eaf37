//! Persistence contract of the wallet core.
//!
//! The core only relies on the traits below; the storage engine behind them is up to
//! the embedding application. [`MemoryStore`] implements all of them and can export its
//! whole content as JSON.

mod memory;

pub use memory::MemoryStore;

use thiserror::Error;

use crate::lightning::{
    channel::ChannelActorState,
    graph::{ChannelInfo, NodeInfo},
    network::PeerRecord,
    payment::PaymentRecord,
    types::{Hash256, Pubkey, ShortChannelId},
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Failed to write {0}")]
    WriteFailed(String),
    #[error("Failed to read {0}")]
    ReadFailed(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub trait ChannelStore {
    fn save_channel(&self, state: &ChannelActorState) -> Result<(), StoreError>;
    fn find_channel_by_id(&self, id: &Hash256) -> Result<Option<ChannelActorState>, StoreError>;
    fn find_all_channels(&self) -> Result<Vec<ChannelActorState>, StoreError>;
    fn delete_channel(&self, id: &Hash256) -> Result<(), StoreError>;

    fn find_channels_by_peer(&self, peer: &Pubkey) -> Result<Vec<ChannelActorState>, StoreError> {
        Ok(self
            .find_all_channels()?
            .into_iter()
            .filter(|channel| channel.remote_pubkey == *peer)
            .collect())
    }
}

pub trait PeerStore {
    fn save_peer(&self, peer: &PeerRecord) -> Result<(), StoreError>;
    fn find_peer(&self, pubkey: &Pubkey) -> Result<Option<PeerRecord>, StoreError>;
    fn find_all_peers(&self) -> Result<Vec<PeerRecord>, StoreError>;
    fn delete_peer(&self, pubkey: &Pubkey) -> Result<(), StoreError>;
}

pub trait PaymentStore {
    fn save_payment(&self, payment: &PaymentRecord) -> Result<(), StoreError>;
    fn find_payment(&self, payment_hash: &Hash256) -> Result<Option<PaymentRecord>, StoreError>;
    fn find_all_payments(&self) -> Result<Vec<PaymentRecord>, StoreError>;
}

/// Seeds from which the keys of each channel are derived, keyed by the temporary
/// channel id which never changes over the life of a channel.
pub trait ChannelSeedStore {
    fn save_channel_seed(&self, temporary_id: &Hash256, seed: [u8; 32]) -> Result<(), StoreError>;
    fn find_channel_seed(&self, temporary_id: &Hash256) -> Option<[u8; 32]>;
}

pub trait GraphStore {
    fn save_node(&self, node: &NodeInfo) -> Result<(), StoreError>;
    fn delete_node(&self, node_id: &Pubkey) -> Result<(), StoreError>;
    fn find_all_nodes(&self) -> Result<Vec<NodeInfo>, StoreError>;
    fn save_graph_channel(&self, channel: &ChannelInfo) -> Result<(), StoreError>;
    fn delete_graph_channel(&self, short_channel_id: &ShortChannelId) -> Result<(), StoreError>;
    fn find_all_graph_channels(&self) -> Result<Vec<ChannelInfo>, StoreError>;
}

/// Whole-state backup and reset.
pub trait StateExport {
    /// A JSON object with one array per entity collection.
    fn export_data(&self) -> Result<serde_json::Value, StoreError>;
    /// Replace the whole content with a previous export.
    fn import_data(&self, data: &serde_json::Value) -> Result<(), StoreError>;
    fn clear_all(&self) -> Result<(), StoreError>;
}

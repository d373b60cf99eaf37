pub mod config;
pub use config::LightningConfig;
pub mod network;

pub use network::{NetworkService, NetworkServiceParams, PeerRecord};
pub mod graph;
pub mod trampoline;

pub mod channel;
pub mod coordinator;
pub mod events;
pub mod onchain;
pub mod payment;
pub mod readiness;
pub mod serde_utils;
pub mod transport;
pub mod types;
pub mod wire;

#[cfg(test)]
pub mod tests;

use types::Hash256;

/// Genesis block hash of bitcoin mainnet, in internal byte order.
const MAINNET_CHAIN_HASH: [u8; 32] = [
    0x6f, 0xe2, 0x8c, 0x0a, 0xb6, 0xf1, 0xb3, 0x72, 0xc1, 0xa6, 0xa2, 0x46, 0xae, 0x63, 0xf7, 0x4f,
    0x93, 0x1e, 0x83, 0x65, 0xe1, 0x5a, 0x08, 0x9c, 0x68, 0xd6, 0x19, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// The chain every channel and gossip message must refer to.
pub fn get_chain_hash() -> Hash256 {
    MAINNET_CHAIN_HASH.into()
}

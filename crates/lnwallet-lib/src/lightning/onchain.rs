//! The on-chain side of the wallet as seen by the channel state machine.
//!
//! Building, signing and broadcasting bitcoin transactions is owned by the embedding
//! application. Channels only ask for a funding output and hand over transactions to
//! publish, identified by their txid.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use thiserror::Error;

use super::{
    serde_utils::SliceHex,
    types::{Hash256, Pubkey},
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OnChainError {
    #[error("Insufficient on-chain funds: need {needed} sat")]
    InsufficientFunds { needed: u64 },
    #[error("Failed to broadcast transaction: {0}")]
    BroadcastFailed(String),
    #[error("On-chain wallet unavailable: {0}")]
    Unavailable(String),
}

/// The 2-of-2 funding output to create.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FundingRequest {
    pub temporary_channel_id: Hash256,
    pub amount_sat: u64,
    pub local_funding_pubkey: Pubkey,
    pub remote_funding_pubkey: Pubkey,
    pub feerate_per_kw: u32,
}

/// Outpoint of a funding transaction built but not yet broadcast.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingOutpoint {
    pub txid: Hash256,
    pub output_index: u16,
}

/// A commitment transaction to publish unilaterally.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentBroadcast {
    pub channel_id: Hash256,
    pub funding: FundingOutpoint,
    pub commitment_number: u64,
    pub to_local_sat: u64,
    pub to_remote_sat: u64,
    pub to_self_delay: u16,
}

/// A mutual close transaction agreed by both sides.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosingBroadcast {
    pub channel_id: Hash256,
    pub funding: FundingOutpoint,
    pub fee_sat: u64,
    #[serde_as(as = "SliceHex")]
    pub local_script: Vec<u8>,
    #[serde_as(as = "SliceHex")]
    pub remote_script: Vec<u8>,
    pub to_local_sat: u64,
    pub to_remote_sat: u64,
}

/// A transaction the channel decided to publish. It is persisted with the channel
/// before the wallet sees it and cleared once the wallet accepted it, so a crash or a
/// failed broadcast in between is retried from the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingBroadcast {
    Funding(FundingOutpoint),
    Commitment(CommitmentBroadcast),
    Closing(ClosingBroadcast),
}

#[async_trait]
pub trait OnChainWallet: Send + Sync {
    async fn create_funding_transaction(
        &self,
        request: FundingRequest,
    ) -> Result<FundingOutpoint, OnChainError>;

    async fn broadcast_funding(&self, funding: FundingOutpoint) -> Result<(), OnChainError>;

    /// Returns the txid of the broadcast commitment transaction.
    async fn broadcast_commitment(
        &self,
        commitment: CommitmentBroadcast,
    ) -> Result<Hash256, OnChainError>;

    /// Returns the txid of the broadcast closing transaction.
    async fn broadcast_closing(&self, closing: ClosingBroadcast) -> Result<Hash256, OnChainError>;
}

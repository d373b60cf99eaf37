//! Channel State Machine.
//!
//! Every channel is driven by its own [`ChannelActor`]. The actor mailbox serializes
//! peer messages, local commands and chain events for one channel, while channels of
//! the same or other peers run concurrently.
//!
//! Handlers never touch the live state. They work on a copy and record the messages
//! and events they want to emit; the copy is persisted first and only then replaces
//! the live state and the recorded effects are flushed. A failed handler therefore
//! leaves no trace, neither in the store nor on the wire.
//!
//! Transactions follow the same rule: a handler only records a [`PendingBroadcast`],
//! which is persisted with the new state and handed to the wallet after the commit.
//! The resulting txid is persisted in a second step; until then the stored intent is
//! retried whenever the channel is restored.

use std::{
    collections::{BTreeMap, HashMap},
    fmt::{self, Debug, Display},
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use bitflags::bitflags;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use secp256k1::{Message, SecretKey, SECP256K1};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use sha2::{Digest, Sha256};
use strum::AsRefStr;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use super::{
    config::{MAX_ACCEPTED_HTLCS, DEFAULT_MIN_TO_SELF_DELAY},
    events::{EventBus, HtlcResolution, WalletEvent},
    get_chain_hash,
    onchain::{
        ClosingBroadcast, CommitmentBroadcast, FundingOutpoint, FundingRequest, OnChainError,
        OnChainWallet, PendingBroadcast,
    },
    serde_utils::SliceHex,
    transport::TransportError,
    types::{
        channel_id_from_funding, sha256, Hash256, Privkey, Pubkey, ShortChannelId, Signature64,
    },
    wire::{
        encode,
        tlv::{ChannelReadyTlv, TlvStream},
        AcceptChannel, ChannelBasepoints, ChannelReady, ChannelReestablish, ClosingSigned,
        CommitmentSigned, ErrorMessage, FundingCreated, FundingSigned, LightningMessage,
        OnionPacket, OpenChannel, RevokeAndAck, Shutdown, Stfu, UpdateAddHtlc, UpdateFailHtlc,
        UpdateFailMalformedHtlc, UpdateFee, UpdateFulfillHtlc, Warning,
    },
};
use crate::{
    invoice::{InvoiceStatus, InvoiceStore, PreimageStore},
    now_timestamp_as_millis_u64,
    store::{ChannelSeedStore, ChannelStore, StoreError},
};

pub const INITIAL_COMMITMENT_NUMBER: u64 = 0;

/// Commitment numbers are 48 bits wide (BOLT 3).
pub const MAX_COMMITMENT_INDEX: u64 = (1 << 48) - 1;

/// Weight used to turn a feerate into the fee we offer for a mutual close.
const CLOSING_TX_WEIGHT: u64 = 724;

const PERM: u16 = 0x4000;
/// BOLT 4 `incorrect_or_unknown_payment_details`.
pub const INCORRECT_OR_UNKNOWN_PAYMENT_DETAILS: u16 = PERM | 15;

pub type ProcessingChannelResult = Result<(), ProcessingChannelError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingChannelError {
    #[error("Invalid channel parameters: {0}")]
    InvalidChannelParameters(String),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Channel not found: {0}")]
    ChannelNotFound(Hash256),
    #[error("Channel is closed")]
    ChannelClosed,
    #[error("Persistence failure: {0}")]
    PersistenceFailure(#[from] StoreError),
    #[error("Channel can not be reestablished")]
    ChannelNotReestablishable,
    #[error("No funding transaction known for this channel")]
    NoFundingTransaction,
    #[error("Channel state is out of sync with the peer: {0}")]
    StateDesync(String),
    #[error("Unable to handle HTLC command in waiting HTLC ACK state")]
    WaitingTlcAck,
    #[error("Insufficient funds: requested {requested} msat, available {available} msat")]
    InsufficientFunds { requested: u64, available: u64 },
    #[error("An HTLC with payment hash {0} is already pending on this channel")]
    DuplicatePaymentHash(Hash256),
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Per commitment secret #{0} does not match its point")]
    InvalidRevocationSecret(u64),
    #[error("On-chain error: {0}")]
    OnChain(#[from] OnChainError),
    #[error("Failed to spawn actor: {0}")]
    SpawnErr(String),
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl ProcessingChannelError {
    /// The peer broke the protocol in a way that leaves the channel unusable.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ProcessingChannelError::InvalidSignature
                | ProcessingChannelError::InvalidRevocationSecret(_)
        )
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct NegotiatingFlags: u32 {
        const OUR_INIT_SENT = 1;
        const THEIR_INIT_SENT = 1 << 1;
        const INIT_SENT = NegotiatingFlags::OUR_INIT_SENT.bits() | NegotiatingFlags::THEIR_INIT_SENT.bits();
    }

    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct FundingFlags: u32 {
        /// We sent `funding_created` and wait for the signature of our first commitment.
        const AWAITING_FUNDING_SIGNED = 1;
        /// Both first commitments are signed, the funding transaction is not confirmed yet.
        const AWAITING_CONFIRMATION = 1 << 1;
    }

    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ChannelReadyFlags: u32 {
        const OUR_CHANNEL_READY = 1;
        const THEIR_CHANNEL_READY = 1 << 1;
        const CHANNEL_READY = ChannelReadyFlags::OUR_CHANNEL_READY.bits() | ChannelReadyFlags::THEIR_CHANNEL_READY.bits();
    }

    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct QuiescenceFlags: u32 {
        const OUR_STFU_SENT = 1;
        const THEIR_STFU_SENT = 1 << 1;
        const QUIESCENT = QuiescenceFlags::OUR_STFU_SENT.bits() | QuiescenceFlags::THEIR_STFU_SENT.bits();
    }

    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ClosingFlags: u32 {
        /// Indicates that we have sent a `shutdown` message.
        const OUR_SHUTDOWN_SENT = 1;
        /// Indicates that they have sent a `shutdown` message.
        const THEIR_SHUTDOWN_SENT = 1 << 1;
        const SHUTDOWN_SENT = ClosingFlags::OUR_SHUTDOWN_SENT.bits() | ClosingFlags::THEIR_SHUTDOWN_SENT.bits();
        /// We have proposed a closing fee and wait for the answer.
        const CLOSING_SIGNED_SENT = 1 << 2;
    }

    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct CloseFlags: u32 {
        /// Indicates that channel is closed cooperatively.
        const COOPERATIVE = 1;
        /// Indicates that channel is closed uncooperatively, initiated by local forcibly.
        const UNCOOPERATIVE_LOCAL = 1 << 1;
        /// Indicates that channel is abandoned.
        const ABANDONED = 1 << 2;
        /// Channel is closed because of aborted funding.
        const FUNDING_ABORTED = 1 << 3;
        /// Indicates that channel is closed uncooperatively, initiated by remote forcibly.
        const UNCOOPERATIVE_REMOTE = 1 << 4;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelState {
    /// Exchanging `open_channel`/`accept_channel`.
    Negotiating(NegotiatingFlags),
    /// Exchanging signatures of the first commitments and waiting for the funding
    /// transaction to confirm.
    FundingSigned(FundingFlags),
    /// The funding transaction is confirmed, exchanging `channel_ready`.
    ChannelReady(ChannelReadyFlags),
    /// The channel is operational.
    Normal,
    /// The peer is disconnected; the channel waits for `channel_reestablish`.
    Offline,
    /// No updates are allowed until quiescence is exited.
    Quiescent(QuiescenceFlags),
    /// `shutdown` exchanged or being exchanged, negotiating the closing fee.
    ClosingNegotiation(ClosingFlags),
    /// Our latest commitment transaction is broadcast.
    ForceClosing,
    Closed(CloseFlags),
    /// Unrecoverable failure, the channel needs manual resolution.
    Error,
}

impl ChannelState {
    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelState::Closed(_) | ChannelState::ForceClosing)
    }

    pub fn is_funded(&self) -> bool {
        !matches!(
            self,
            ChannelState::Negotiating(_)
                | ChannelState::FundingSigned(FundingFlags::AWAITING_FUNDING_SIGNED)
        )
    }
}

impl Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Protocol minimums enforced on channels we open and accept.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLimits {
    pub min_funding_amount_sat: u64,
    pub max_funding_amount_sat: u64,
    pub min_to_self_delay: u16,
    pub max_to_self_delay: u16,
    pub dust_limit_sat: u64,
}

/// Check the parameters of a channel opening, either ours before anything is sent or
/// the ones proposed by a peer.
pub fn validate_open_params(
    limits: &ChannelLimits,
    funding_satoshis: u64,
    push_msat: u64,
    channel_reserve_satoshis: u64,
    to_self_delay: u16,
) -> ProcessingChannelResult {
    if funding_satoshis < limits.min_funding_amount_sat {
        return Err(ProcessingChannelError::InvalidChannelParameters(format!(
            "funding amount {} sat is below the minimum of {} sat",
            funding_satoshis, limits.min_funding_amount_sat
        )));
    }
    if funding_satoshis > limits.max_funding_amount_sat {
        return Err(ProcessingChannelError::InvalidChannelParameters(format!(
            "funding amount {} sat is above the maximum of {} sat",
            funding_satoshis, limits.max_funding_amount_sat
        )));
    }
    if to_self_delay < limits.min_to_self_delay {
        return Err(ProcessingChannelError::InvalidChannelParameters(format!(
            "to_self_delay {} is below the minimum of {} blocks",
            to_self_delay, limits.min_to_self_delay
        )));
    }
    if to_self_delay > limits.max_to_self_delay {
        return Err(ProcessingChannelError::InvalidChannelParameters(format!(
            "to_self_delay {} is above the maximum of {} blocks",
            to_self_delay, limits.max_to_self_delay
        )));
    }
    if channel_reserve_satoshis < limits.dust_limit_sat {
        return Err(ProcessingChannelError::InvalidChannelParameters(format!(
            "channel reserve {} sat is below the dust limit of {} sat",
            channel_reserve_satoshis, limits.dust_limit_sat
        )));
    }
    funder_balance_msat(funding_satoshis, push_msat)?;
    Ok(())
}

/// What the funder keeps of the channel capacity after pushing `push_msat` to the other side.
fn funder_balance_msat(funding_satoshis: u64, push_msat: u64) -> Result<u64, ProcessingChannelError> {
    let capacity_msat = funding_satoshis.checked_mul(1000).ok_or_else(|| {
        ProcessingChannelError::InvalidChannelParameters(format!(
            "funding amount {} sat overflows",
            funding_satoshis
        ))
    })?;
    capacity_msat.checked_sub(push_msat).ok_or_else(|| {
        ProcessingChannelError::InvalidChannelParameters(format!(
            "push amount {} msat exceeds the funding amount {} sat",
            push_msat, funding_satoshis
        ))
    })
}

/// The reserve we ask the other side to keep: 1% of the funding, at least the dust limit.
pub fn default_channel_reserve(funding_satoshis: u64, dust_limit_sat: u64) -> u64 {
    (funding_satoshis / 100).max(dust_limit_sat)
}

/// BOLT 3 `generate_from_seed`.
pub fn generate_from_seed(seed: &[u8; 32], index: u64) -> [u8; 32] {
    let mut p = *seed;
    for bit in (0..48).rev() {
        if index & (1 << bit) != 0 {
            p[bit / 8] ^= 1 << (bit & 7);
            p = Sha256::digest(p).into();
        }
    }
    p
}

/// Secret of our commitment number `commitment_number`. Secrets are generated from the
/// top of the index space down so that the receiver can store them compactly.
pub fn get_commitment_secret(commitment_seed: &[u8; 32], commitment_number: u64) -> [u8; 32] {
    generate_from_seed(commitment_seed, MAX_COMMITMENT_INDEX - commitment_number)
}

pub fn commitment_point_from_secret(secret: &[u8; 32]) -> Option<Pubkey> {
    SecretKey::from_slice(secret)
        .ok()
        .map(|key| Privkey::from(key).pubkey())
}

pub fn get_commitment_point(commitment_seed: &[u8; 32], commitment_number: u64) -> Pubkey {
    commitment_point_from_secret(&get_commitment_secret(commitment_seed, commitment_number))
        .expect("sha256 output is a valid secret key")
}

/// Digest signed by the funding keys for the commitment of `holder` numbered `commitment_number`.
pub fn commitment_digest(channel_id: &Hash256, holder: &Pubkey, commitment_number: u64) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(b"commitment");
    hasher.update(channel_id.as_ref());
    hasher.update(holder.serialize());
    hasher.update(commitment_number.to_be_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    digest.into()
}

/// Digest signed by the funding keys for a mutual close paying `fee_satoshis`.
pub fn closing_digest(channel_id: &Hash256, fee_satoshis: u64) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(b"closing");
    hasher.update(channel_id.as_ref());
    hasher.update(fee_satoshis.to_be_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    digest.into()
}

pub fn verify_signature(
    pubkey: &Pubkey,
    digest: &Hash256,
    signature: &Signature64,
) -> ProcessingChannelResult {
    let signature = signature
        .to_ecdsa()
        .map_err(|_| ProcessingChannelError::InvalidSignature)?;
    SECP256K1
        .verify_ecdsa(
            &Message::from_digest(*digest.as_bytes()),
            &signature,
            &pubkey.to_public_key(),
        )
        .map_err(|_| ProcessingChannelError::InvalidSignature)
}

/// A P2WPKH script paying to `pubkey`, used as our default closing destination.
pub fn p2wpkh_script(pubkey: &Pubkey) -> Vec<u8> {
    bitcoin::PublicKey::from_slice(&pubkey.serialize())
        .ok()
        .and_then(|key| key.wpubkey_hash())
        .map(|hash| bitcoin::ScriptBuf::new_v0_p2wpkh(&hash).to_bytes())
        .unwrap_or_default()
}

/// Keeps the private keys of a channel in memory.
///
/// All keys are derived from a per-channel seed, so that the signer can be rebuilt from
/// the [`ChannelSeedStore`].
#[serde_as]
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct InMemorySigner {
    /// Our key in the 2-of-2 funding output; it also signs commitments.
    pub funding_key: Privkey,
    pub revocation_base_key: Privkey,
    pub payment_key: Privkey,
    pub delayed_payment_base_key: Privkey,
    pub htlc_base_key: Privkey,
    /// Seed to derive per-commitment secrets.
    #[serde_as(as = "SliceHex")]
    pub commitment_seed: [u8; 32],
}

impl Debug for InMemorySigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemorySigner")
            .field("funding_pubkey", &self.funding_key.pubkey())
            .finish()
    }
}

impl InMemorySigner {
    pub fn generate_from_seed(seed: &[u8; 32]) -> Self {
        let key_derive = |info: &[u8]| {
            let mut counter = 0u32;
            loop {
                let mut hasher = Sha256::new();
                hasher.update(seed);
                hasher.update(info);
                hasher.update(counter.to_be_bytes());
                let candidate: [u8; 32] = hasher.finalize().into();
                if let Ok(key) = Privkey::from_slice(&candidate) {
                    return key;
                }
                counter += 1;
            }
        };

        let mut hasher = Sha256::new();
        hasher.update(seed);
        hasher.update(b"commitment seed");
        let commitment_seed: [u8; 32] = hasher.finalize().into();

        Self {
            funding_key: key_derive(b"funding key"),
            revocation_base_key: key_derive(b"revocation base key"),
            payment_key: key_derive(b"payment key"),
            delayed_payment_base_key: key_derive(b"delayed payment base key"),
            htlc_base_key: key_derive(b"htlc base key"),
            commitment_seed,
        }
    }

    pub fn basepoints(&self) -> ChannelBasepoints {
        ChannelBasepoints {
            funding_pubkey: self.funding_key.pubkey(),
            revocation_basepoint: self.revocation_base_key.pubkey(),
            payment_basepoint: self.payment_key.pubkey(),
            delayed_payment_basepoint: self.delayed_payment_base_key.pubkey(),
            htlc_basepoint: self.htlc_base_key.pubkey(),
            first_per_commitment_point: self.get_commitment_point(INITIAL_COMMITMENT_NUMBER),
        }
    }

    pub fn get_commitment_point(&self, commitment_number: u64) -> Pubkey {
        get_commitment_point(&self.commitment_seed, commitment_number)
    }

    pub fn get_commitment_secret(&self, commitment_number: u64) -> [u8; 32] {
        get_commitment_secret(&self.commitment_seed, commitment_number)
    }

    pub fn sign(&self, digest: &Hash256) -> Signature64 {
        SECP256K1
            .sign_ecdsa(&Message::from_digest(*digest.as_bytes()), &self.funding_key.0)
            .into()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CommitmentNumbers {
    /// Number of our latest commitment, i.e. of `commitment_signed` messages received.
    pub local: u64,
    /// Number of the latest remote commitment we signed.
    pub remote: u64,
}

impl CommitmentNumbers {
    pub fn get_local(&self) -> u64 {
        self.local
    }

    pub fn get_remote(&self) -> u64 {
        self.remote
    }

    pub fn increment_local(&mut self) {
        self.local += 1;
    }

    pub fn increment_remote(&mut self) {
        self.remote += 1;
    }
}

/// The id of an HTLC, it can be either offered or received.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, PartialOrd, Ord, Hash)]
pub enum TLCId {
    /// Offered HTLC id
    Offered(u64),
    /// Received HTLC id
    Received(u64),
}

impl From<TLCId> for u64 {
    fn from(id: TLCId) -> u64 {
        match id {
            TLCId::Offered(id) => id,
            TLCId::Received(id) => id,
        }
    }
}

impl TLCId {
    pub fn is_offered(&self) -> bool {
        matches!(self, TLCId::Offered(_))
    }

    pub fn is_received(&self) -> bool {
        !self.is_offered()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub enum OutboundTlcStatus {
    // Offered HTLC created and sent to remote party
    LocalAnnounced,
    // Received ACK from remote party for this offered HTLC
    Committed,
    // Remote party removed this HTLC
    RemoteRemoved,
    // We received the removal while waiting for the ack of a previous commitment,
    // another ack is needed to confirm it.
    RemoveWaitPrevAck,
    // We have sent commitment signed to peer and waiting ACK for confirming this removal
    RemoveWaitAck,
    // We have received the ACK for the removal, it's safe to drop this HTLC
    RemoveAckConfirmed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub enum InboundTlcStatus {
    // Received HTLC from remote party, but not committed yet
    RemoteAnnounced,
    // We received the HTLC while waiting for the ack of a previous commitment,
    // another ack is needed to confirm the addition.
    AnnounceWaitPrevAck,
    // We have sent commitment signed to peer and waiting ACK for confirming this addition
    AnnounceWaitAck,
    // We have received ACK from peer and committed this HTLC
    Committed,
    // We have removed this HTLC, but haven't received ACK from peer
    LocalRemoved,
    // We have received the ACK for the removal, it's safe to drop this HTLC
    RemoveAckConfirmed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub enum TlcStatus {
    Outbound(OutboundTlcStatus),
    Inbound(InboundTlcStatus),
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub enum RemoveTlcReason {
    Fulfill {
        preimage: Hash256,
    },
    Fail {
        #[serde_as(as = "SliceHex")]
        reason: Vec<u8>,
    },
    FailMalformed {
        sha256_of_onion: Hash256,
        failure_code: u16,
    },
}

impl RemoveTlcReason {
    /// Unencrypted failure reason: the failure code followed by code specific data.
    pub fn failure(code: u16, data: &[u8]) -> Self {
        let mut reason = code.to_be_bytes().to_vec();
        reason.extend_from_slice(data);
        RemoveTlcReason::Fail { reason }
    }

    fn describe_failure(&self) -> Option<String> {
        match self {
            RemoveTlcReason::Fulfill { .. } => None,
            RemoveTlcReason::Fail { reason } if reason.len() >= 2 => Some(format!(
                "failure code 0x{:04x}",
                u16::from_be_bytes([reason[0], reason[1]])
            )),
            RemoveTlcReason::Fail { reason } => {
                Some(format!("undecodable failure reason {}", hex::encode(reason)))
            }
            RemoveTlcReason::FailMalformed { failure_code, .. } => {
                Some(format!("malformed htlc, failure code 0x{:04x}", failure_code))
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct TlcInfo {
    pub tlc_id: TLCId,
    pub status: TlcStatus,
    pub amount_msat: u64,
    pub payment_hash: Hash256,
    pub cltv_expiry: u32,
    pub created_at: CommitmentNumbers,
    pub removed_reason: Option<RemoveTlcReason>,
    pub removed_confirmed_at: Option<u64>,
}

impl TlcInfo {
    pub fn id(&self) -> u64 {
        self.tlc_id.into()
    }

    pub fn is_offered(&self) -> bool {
        self.tlc_id.is_offered()
    }

    pub fn is_received(&self) -> bool {
        !self.is_offered()
    }

    pub fn outbound_status(&self) -> Option<OutboundTlcStatus> {
        match self.status {
            TlcStatus::Outbound(status) => Some(status),
            TlcStatus::Inbound(_) => None,
        }
    }

    pub fn inbound_status(&self) -> Option<InboundTlcStatus> {
        match self.status {
            TlcStatus::Inbound(status) => Some(status),
            TlcStatus::Outbound(_) => None,
        }
    }

    fn is_committed(&self) -> bool {
        matches!(
            self.status,
            TlcStatus::Outbound(OutboundTlcStatus::Committed)
                | TlcStatus::Inbound(InboundTlcStatus::Committed)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct PendingTlcs {
    pub tlcs: Vec<TlcInfo>,
    pub next_tlc_id: u64,
}

impl PendingTlcs {
    pub fn get_next_id(&self) -> u64 {
        self.next_tlc_id
    }

    pub fn increment_next_id(&mut self) {
        self.next_tlc_id += 1;
    }

    pub fn add_tlc(&mut self, tlc: TlcInfo) {
        self.tlcs.push(tlc);
    }

    pub fn get_committed_tlcs(&self) -> Vec<TlcInfo> {
        self.tlcs
            .iter()
            .filter(|tlc| tlc.is_committed())
            .cloned()
            .collect()
    }

    pub fn total_amount_msat(&self) -> u64 {
        self.tlcs.iter().map(|tlc| tlc.amount_msat).sum()
    }
}

/// HTLCs of both directions and where each of them is in the two-phase commit of
/// `commitment_signed`/`revoke_and_ack`.
#[derive(Default, Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct TlcState {
    pub offered_tlcs: PendingTlcs,
    pub received_tlcs: PendingTlcs,
    /// We sent `commitment_signed` and have not received the `revoke_and_ack` yet.
    pub waiting_ack: bool,
}

impl TlcState {
    pub fn get_mut(&mut self, tlc_id: &TLCId) -> Option<&mut TlcInfo> {
        let tlcs = if tlc_id.is_offered() {
            &mut self.offered_tlcs.tlcs
        } else {
            &mut self.received_tlcs.tlcs
        };
        tlcs.iter_mut().find(|tlc| tlc.tlc_id == *tlc_id)
    }

    pub fn get(&self, tlc_id: &TLCId) -> Option<&TlcInfo> {
        let tlcs = if tlc_id.is_offered() {
            &self.offered_tlcs.tlcs
        } else {
            &self.received_tlcs.tlcs
        };
        tlcs.iter().find(|tlc| tlc.tlc_id == *tlc_id)
    }

    pub fn get_next_offering(&self) -> u64 {
        self.offered_tlcs.get_next_id()
    }

    pub fn get_next_received(&self) -> u64 {
        self.received_tlcs.get_next_id()
    }

    pub fn set_waiting_ack(&mut self, waiting_ack: bool) {
        self.waiting_ack = waiting_ack;
    }

    pub fn all_tlcs(&self) -> impl Iterator<Item = &TlcInfo> + '_ {
        self.offered_tlcs
            .tlcs
            .iter()
            .chain(self.received_tlcs.tlcs.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.offered_tlcs.tlcs.is_empty() && self.received_tlcs.tlcs.is_empty()
    }

    pub fn add_offered_tlc(&mut self, tlc: TlcInfo) {
        self.offered_tlcs.add_tlc(tlc);
        self.offered_tlcs.increment_next_id();
    }

    pub fn add_received_tlc(&mut self, tlc: TlcInfo) {
        self.received_tlcs.add_tlc(tlc);
        self.received_tlcs.increment_next_id();
    }

    /// Mark a committed received HTLC as removed by us.
    pub fn set_received_tlc_removed(
        &mut self,
        tlc_id: u64,
        reason: RemoveTlcReason,
    ) -> Result<Hash256, ProcessingChannelError> {
        let tlc = self
            .get_mut(&TLCId::Received(tlc_id))
            .ok_or_else(|| ProcessingChannelError::InvalidParameter(format!("unknown htlc {}", tlc_id)))?;
        if tlc.inbound_status() != Some(InboundTlcStatus::Committed) {
            return Err(ProcessingChannelError::InvalidState(format!(
                "htlc {} can not be removed in status {:?}",
                tlc_id, tlc.status
            )));
        }
        tlc.removed_reason = Some(reason);
        tlc.status = TlcStatus::Inbound(InboundTlcStatus::LocalRemoved);
        Ok(tlc.payment_hash)
    }

    /// Mark a committed offered HTLC as removed by the remote party.
    pub fn set_offered_tlc_removed(
        &mut self,
        tlc_id: u64,
        reason: RemoveTlcReason,
    ) -> Result<&TlcInfo, ProcessingChannelError> {
        let tlc = self
            .get_mut(&TLCId::Offered(tlc_id))
            .ok_or_else(|| ProcessingChannelError::InvalidParameter(format!("unknown htlc {}", tlc_id)))?;
        if tlc.outbound_status() != Some(OutboundTlcStatus::Committed) {
            return Err(ProcessingChannelError::InvalidState(format!(
                "htlc {} can not be removed in status {:?}",
                tlc_id, tlc.status
            )));
        }
        tlc.removed_reason = Some(reason);
        tlc.status = TlcStatus::Outbound(OutboundTlcStatus::RemoteRemoved);
        Ok(tlc)
    }

    /// Called when a `commitment_signed` is received. Returns whether we need to sign
    /// a new remote commitment in return.
    pub fn update_for_commitment_signed(&mut self) -> bool {
        for tlc in self.offered_tlcs.tlcs.iter_mut() {
            if tlc.outbound_status() == Some(OutboundTlcStatus::RemoteRemoved) {
                let status = if self.waiting_ack {
                    OutboundTlcStatus::RemoveWaitPrevAck
                } else {
                    OutboundTlcStatus::RemoveWaitAck
                };
                tlc.status = TlcStatus::Outbound(status);
            }
        }
        for tlc in self.received_tlcs.tlcs.iter_mut() {
            if tlc.inbound_status() == Some(InboundTlcStatus::RemoteAnnounced) {
                let status = if self.waiting_ack {
                    InboundTlcStatus::AnnounceWaitPrevAck
                } else {
                    InboundTlcStatus::AnnounceWaitAck
                };
                tlc.status = TlcStatus::Inbound(status)
            }
        }
        self.need_another_commitment_signed()
    }

    /// Called when a `revoke_and_ack` is received.
    pub fn update_for_revoke_and_ack(&mut self, commitment_numbers: CommitmentNumbers) {
        for tlc in self.offered_tlcs.tlcs.iter_mut() {
            match tlc.outbound_status() {
                Some(OutboundTlcStatus::LocalAnnounced) => {
                    tlc.status = TlcStatus::Outbound(OutboundTlcStatus::Committed);
                }
                Some(OutboundTlcStatus::RemoveWaitPrevAck) => {
                    tlc.status = TlcStatus::Outbound(OutboundTlcStatus::RemoveWaitAck);
                }
                Some(OutboundTlcStatus::RemoveWaitAck) => {
                    tlc.status = TlcStatus::Outbound(OutboundTlcStatus::RemoveAckConfirmed);
                    tlc.removed_confirmed_at = Some(commitment_numbers.get_local());
                }
                _ => {}
            }
        }

        for tlc in self.received_tlcs.tlcs.iter_mut() {
            match tlc.inbound_status() {
                Some(InboundTlcStatus::AnnounceWaitPrevAck) => {
                    tlc.status = TlcStatus::Inbound(InboundTlcStatus::AnnounceWaitAck);
                }
                Some(InboundTlcStatus::AnnounceWaitAck) => {
                    tlc.status = TlcStatus::Inbound(InboundTlcStatus::Committed);
                }
                Some(InboundTlcStatus::LocalRemoved) => {
                    tlc.status = TlcStatus::Inbound(InboundTlcStatus::RemoveAckConfirmed);
                    tlc.removed_confirmed_at = Some(commitment_numbers.get_remote());
                }
                _ => {}
            }
        }
    }

    pub fn need_another_commitment_signed(&self) -> bool {
        self.offered_tlcs.tlcs.iter().any(|tlc| {
            matches!(
                tlc.outbound_status(),
                Some(
                    OutboundTlcStatus::LocalAnnounced
                        | OutboundTlcStatus::RemoteRemoved
                        | OutboundTlcStatus::RemoveWaitPrevAck
                        | OutboundTlcStatus::RemoveWaitAck
                )
            )
        }) || self.received_tlcs.tlcs.iter().any(|tlc| {
            matches!(
                tlc.inbound_status(),
                Some(
                    InboundTlcStatus::RemoteAnnounced
                        | InboundTlcStatus::AnnounceWaitPrevAck
                        | InboundTlcStatus::AnnounceWaitAck
                )
            )
        })
    }

    /// Drop the HTLCs whose removal is irrevocably committed on both sides.
    pub fn take_settled(&mut self, inbound: bool) -> Vec<TlcInfo> {
        let (tlcs, confirmed) = if inbound {
            (
                &mut self.received_tlcs.tlcs,
                TlcStatus::Inbound(InboundTlcStatus::RemoveAckConfirmed),
            )
        } else {
            (
                &mut self.offered_tlcs.tlcs,
                TlcStatus::Outbound(OutboundTlcStatus::RemoveAckConfirmed),
            )
        };
        let (settled, pending): (Vec<_>, Vec<_>) = std::mem::take(tlcs)
            .into_iter()
            .partition(|tlc| tlc.status == confirmed);
        *tlcs = pending;
        settled
    }

    /// Forget updates the remote party sent but never signed; it retransmits them after
    /// reconnecting.
    pub fn drop_unsigned_remote_updates(&mut self) {
        let dropped_ids: Vec<u64> = self
            .received_tlcs
            .tlcs
            .iter()
            .filter(|tlc| tlc.inbound_status() == Some(InboundTlcStatus::RemoteAnnounced))
            .map(|tlc| tlc.id())
            .collect();
        if let Some(first) = dropped_ids.iter().min() {
            self.received_tlcs.next_tlc_id = *first;
        }
        self.received_tlcs
            .tlcs
            .retain(|tlc| tlc.inbound_status() != Some(InboundTlcStatus::RemoteAnnounced));
        for tlc in self.offered_tlcs.tlcs.iter_mut() {
            if tlc.outbound_status() == Some(OutboundTlcStatus::RemoteRemoved) {
                tlc.status = TlcStatus::Outbound(OutboundTlcStatus::Committed);
                tlc.removed_reason = None;
            }
        }
    }
}

/// Parameters one side imposes on the commitment transactions of the other side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelParameters {
    pub dust_limit_sat: u64,
    pub max_htlc_value_in_flight_msat: u64,
    /// Amount the other side must keep on its side of the channel.
    pub channel_reserve_sat: u64,
    pub htlc_minimum_msat: u64,
    pub to_self_delay: u16,
    pub max_accepted_htlcs: u16,
    pub basepoints: ChannelBasepoints,
}

impl ChannelParameters {
    fn local(
        signer: &InMemorySigner,
        funding_satoshis: u64,
        to_self_delay: u16,
        limits: &ChannelLimits,
    ) -> Self {
        Self {
            dust_limit_sat: limits.dust_limit_sat,
            max_htlc_value_in_flight_msat: funding_satoshis.saturating_mul(1000),
            channel_reserve_sat: default_channel_reserve(funding_satoshis, limits.dust_limit_sat),
            htlc_minimum_msat: 1,
            to_self_delay,
            max_accepted_htlcs: MAX_ACCEPTED_HTLCS,
            basepoints: signer.basepoints(),
        }
    }
}

impl From<&OpenChannel> for ChannelParameters {
    fn from(open: &OpenChannel) -> Self {
        Self {
            dust_limit_sat: open.dust_limit_satoshis,
            max_htlc_value_in_flight_msat: open.max_htlc_value_in_flight_msat,
            channel_reserve_sat: open.channel_reserve_satoshis,
            htlc_minimum_msat: open.htlc_minimum_msat,
            to_self_delay: open.to_self_delay,
            max_accepted_htlcs: open.max_accepted_htlcs,
            basepoints: open.basepoints,
        }
    }
}

impl From<&AcceptChannel> for ChannelParameters {
    fn from(accept: &AcceptChannel) -> Self {
        Self {
            dust_limit_sat: accept.dust_limit_satoshis,
            max_htlc_value_in_flight_msat: accept.max_htlc_value_in_flight_msat,
            channel_reserve_sat: accept.channel_reserve_satoshis,
            htlc_minimum_msat: accept.htlc_minimum_msat,
            to_self_delay: accept.to_self_delay,
            max_accepted_htlcs: accept.max_accepted_htlcs,
            basepoints: accept.basepoints,
        }
    }
}

/// What to do after comparing the peer's `channel_reestablish` with our own state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReestablishAction {
    /// Both sides agree, nothing is missing.
    Resume,
    /// The peer missed our last `commitment_signed` and/or `revoke_and_ack`.
    Retransmit {
        commitment_signed: bool,
        revoke_and_ack: bool,
    },
    /// The peer's view can not be reconciled with ours.
    Desync(String),
}

/// The persisted state of one channel. The channel actor rebuilds itself from this
/// after a restart.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelActorState {
    pub id: Hash256,
    pub temporary_id: Hash256,
    pub state: ChannelState,
    pub local_pubkey: Pubkey,
    pub remote_pubkey: Pubkey,
    pub is_funder: bool,

    pub funding_satoshis: u64,
    pub push_msat: u64,
    pub funding_txid: Option<Hash256>,
    pub funding_output_index: u16,
    pub short_channel_id: Option<ShortChannelId>,

    /// Settled balances, in-flight HTLCs excluded.
    pub to_local_msat: u64,
    pub to_remote_msat: u64,

    pub feerate_per_kw: u32,
    /// A fee update sent or received but not yet irrevocably committed.
    pub pending_feerate: Option<u32>,

    pub local_params: ChannelParameters,
    pub remote_params: Option<ChannelParameters>,
    pub signer: InMemorySigner,

    pub commitment_numbers: CommitmentNumbers,
    /// Number of the remote commitment whose revocation secret we expect next.
    pub remote_revocation_number: u64,
    pub remote_commitment_points: BTreeMap<u64, Pubkey>,
    pub last_remote_secret: Option<Hash256>,

    pub tlc_state: TlcState,

    /// Encoded updates sent since our last `commitment_signed`.
    #[serde_as(as = "Vec<SliceHex>")]
    pub pending_updates: Vec<Vec<u8>>,
    /// Our last `commitment_signed` together with the updates it covers.
    #[serde_as(as = "Option<Vec<SliceHex>>")]
    pub last_commitment_signed: Option<Vec<Vec<u8>>>,
    #[serde_as(as = "Option<SliceHex>")]
    pub last_revoke_and_ack: Option<Vec<u8>>,
    /// Whether our last `commitment_signed` was sent after our last `revoke_and_ack`.
    pub cs_sent_after_raa: bool,
    pub reestablish_sent: bool,

    #[serde_as(as = "Option<SliceHex>")]
    pub local_shutdown_script: Option<Vec<u8>>,
    #[serde_as(as = "Option<SliceHex>")]
    pub remote_shutdown_script: Option<Vec<u8>>,
    /// Closing fee asked for by the local shutdown command, if any.
    pub closing_fee_satoshis: Option<u64>,
    pub last_closing_fee_sent: Option<u64>,
    pub force_close_txid: Option<Hash256>,
    pub closing_txid: Option<Hash256>,
    /// A transaction decided on but not yet accepted by the wallet.
    #[serde(default)]
    pub pending_broadcast: Option<PendingBroadcast>,

    pub created_at: u64,
    pub updated_at: u64,
}

impl ChannelActorState {
    #[allow(clippy::too_many_arguments)]
    pub fn new_outbound_channel(
        temporary_channel_id: Hash256,
        local_pubkey: Pubkey,
        remote_pubkey: Pubkey,
        seed: &[u8; 32],
        funding_satoshis: u64,
        push_msat: u64,
        feerate_per_kw: u32,
        to_self_delay: u16,
        limits: &ChannelLimits,
    ) -> Result<Self, ProcessingChannelError> {
        let to_local_msat = funder_balance_msat(funding_satoshis, push_msat)?;
        let signer = InMemorySigner::generate_from_seed(seed);
        let local_params = ChannelParameters::local(&signer, funding_satoshis, to_self_delay, limits);
        let now = now_timestamp_as_millis_u64();
        Ok(Self {
            id: temporary_channel_id,
            temporary_id: temporary_channel_id,
            state: ChannelState::Negotiating(NegotiatingFlags::OUR_INIT_SENT),
            local_pubkey,
            remote_pubkey,
            is_funder: true,
            funding_satoshis,
            push_msat,
            funding_txid: None,
            funding_output_index: 0,
            short_channel_id: None,
            to_local_msat,
            to_remote_msat: push_msat,
            feerate_per_kw,
            pending_feerate: None,
            local_params,
            remote_params: None,
            signer,
            commitment_numbers: CommitmentNumbers::default(),
            remote_revocation_number: INITIAL_COMMITMENT_NUMBER,
            remote_commitment_points: BTreeMap::new(),
            last_remote_secret: None,
            tlc_state: TlcState::default(),
            pending_updates: vec![],
            last_commitment_signed: None,
            last_revoke_and_ack: None,
            cs_sent_after_raa: false,
            reestablish_sent: false,
            local_shutdown_script: None,
            remote_shutdown_script: None,
            closing_fee_satoshis: None,
            last_closing_fee_sent: None,
            force_close_txid: None,
            closing_txid: None,
            pending_broadcast: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn new_inbound_channel(
        open_channel: &OpenChannel,
        local_pubkey: Pubkey,
        remote_pubkey: Pubkey,
        seed: &[u8; 32],
        to_self_delay: u16,
        limits: &ChannelLimits,
    ) -> Result<Self, ProcessingChannelError> {
        let mut state = Self::new_outbound_channel(
            open_channel.temporary_channel_id,
            local_pubkey,
            remote_pubkey,
            seed,
            open_channel.funding_satoshis,
            open_channel.push_msat,
            open_channel.feerate_per_kw,
            to_self_delay,
            limits,
        )?;
        state.state = ChannelState::Negotiating(NegotiatingFlags::INIT_SENT);
        state.is_funder = false;
        state.to_remote_msat = state.to_local_msat;
        state.to_local_msat = open_channel.push_msat;
        state.remote_params = Some(open_channel.into());
        state.remote_commitment_points.insert(
            INITIAL_COMMITMENT_NUMBER,
            open_channel.basepoints.first_per_commitment_point,
        );
        Ok(state)
    }

    pub fn get_id(&self) -> Hash256 {
        self.id
    }

    pub fn get_local_pubkey(&self) -> Pubkey {
        self.local_pubkey
    }

    pub fn get_remote_pubkey(&self) -> Pubkey {
        self.remote_pubkey
    }

    fn remote_params(&self) -> Result<&ChannelParameters, ProcessingChannelError> {
        self.remote_params.as_ref().ok_or_else(|| {
            ProcessingChannelError::InvalidState("remote channel parameters are unknown".to_string())
        })
    }

    pub fn get_remote_funding_pubkey(&self) -> Result<Pubkey, ProcessingChannelError> {
        Ok(self.remote_params()?.basepoints.funding_pubkey)
    }

    pub fn funding_outpoint(&self) -> Option<FundingOutpoint> {
        self.funding_txid.map(|txid| FundingOutpoint {
            txid,
            output_index: self.funding_output_index,
        })
    }

    pub fn pending_offered_msat(&self) -> u64 {
        self.tlc_state.offered_tlcs.total_amount_msat()
    }

    pub fn pending_received_msat(&self) -> u64 {
        self.tlc_state.received_tlcs.total_amount_msat()
    }

    /// What we can still offer in new HTLCs.
    pub fn get_available_to_send_msat(&self) -> u64 {
        let reserve_msat = self
            .remote_params
            .as_ref()
            .map(|params| params.channel_reserve_sat * 1000)
            .unwrap_or_default();
        self.to_local_msat
            .saturating_sub(self.pending_offered_msat())
            .saturating_sub(reserve_msat)
    }

    /// What the remote party can still offer us in new HTLCs.
    pub fn get_available_to_receive_msat(&self) -> u64 {
        self.to_remote_msat
            .saturating_sub(self.pending_received_msat())
            .saturating_sub(self.local_params.channel_reserve_sat * 1000)
    }

    pub fn has_pending_htlcs(&self) -> bool {
        !self.tlc_state.is_empty()
    }

    fn has_pending_work(&self) -> bool {
        self.has_pending_htlcs()
            || self.tlc_state.waiting_ack
            || !self.pending_updates.is_empty()
            || self.pending_feerate.is_some()
    }

    /// Record a message to be retransmitted together with our next `commitment_signed`.
    fn record_update(&mut self, message: &LightningMessage) {
        self.pending_updates.push(encode(message));
    }

    fn has_offered_tlc_with_hash(&self, payment_hash: &Hash256) -> bool {
        self.tlc_state
            .offered_tlcs
            .tlcs
            .iter()
            .any(|tlc| tlc.payment_hash == *payment_hash && tlc.removed_reason.is_none())
    }

    /// The `channel_reestablish` describing our state.
    pub fn create_reestablish_message(&self) -> ChannelReestablish {
        let your_last_per_commitment_secret = if self.remote_revocation_number > 0 {
            self.last_remote_secret.unwrap_or_default()
        } else {
            Hash256::default()
        };
        ChannelReestablish {
            channel_id: self.id,
            next_commitment_number: self.commitment_numbers.get_local() + 1,
            next_revocation_number: self.remote_revocation_number,
            your_last_per_commitment_secret,
            my_current_per_commitment_point: self
                .signer
                .get_commitment_point(self.commitment_numbers.get_local()),
            tlvs: TlvStream::new(),
        }
    }

    /// Compare the peer's claim of what it received from us with what we sent.
    pub fn check_reestablish(&self, reestablish: &ChannelReestablish) -> ReestablishAction {
        let remote_number = self.commitment_numbers.get_remote();
        let local_number = self.commitment_numbers.get_local();

        let commitment_signed = if reestablish.next_commitment_number == remote_number + 1 {
            false
        } else if reestablish.next_commitment_number == remote_number
            && self.last_commitment_signed.is_some()
        {
            true
        } else {
            return ReestablishAction::Desync(format!(
                "peer expects commitment number {}, our latest signed remote commitment is {}",
                reestablish.next_commitment_number, remote_number
            ));
        };

        let revoke_and_ack = if reestablish.next_revocation_number == local_number {
            false
        } else if reestablish.next_revocation_number + 1 == local_number
            && self.last_revoke_and_ack.is_some()
        {
            true
        } else {
            return ReestablishAction::Desync(format!(
                "peer expects revocation number {}, our local commitment number is {}",
                reestablish.next_revocation_number, local_number
            ));
        };

        if reestablish.next_revocation_number > 0 {
            let expected: Hash256 = self
                .signer
                .get_commitment_secret(reestablish.next_revocation_number - 1)
                .into();
            if reestablish.your_last_per_commitment_secret != expected {
                return ReestablishAction::Desync(
                    "peer's last per commitment secret does not match ours".to_string(),
                );
            }
        }

        if commitment_signed || revoke_and_ack {
            ReestablishAction::Retransmit {
                commitment_signed,
                revoke_and_ack,
            }
        } else {
            ReestablishAction::Resume
        }
    }
}

/// Where to find the actor of a channel and which peer it belongs to.
#[derive(Clone, Debug)]
pub struct ChannelEntry {
    pub peer: Pubkey,
    pub actor: ActorRef<ChannelActorMessage>,
}

/// Lookup table from channel id to channel actor. Channels refer to their peer by id
/// and the network service resolves both through this table.
#[derive(Clone, Debug, Default)]
pub struct ChannelRegistry {
    inner: Arc<RwLock<HashMap<Hash256, ChannelEntry>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Hash256, ChannelEntry>> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Hash256, ChannelEntry>> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, channel_id: Hash256, entry: ChannelEntry) {
        self.write().insert(channel_id, entry);
    }

    pub fn remove(&self, channel_id: &Hash256) -> Option<ChannelEntry> {
        self.write().remove(channel_id)
    }

    pub fn rekey(&self, old_id: &Hash256, new_id: Hash256) {
        let mut channels = self.write();
        if let Some(entry) = channels.remove(old_id) {
            channels.insert(new_id, entry);
        }
    }

    pub fn get(&self, channel_id: &Hash256) -> Option<ChannelEntry> {
        self.read().get(channel_id).cloned()
    }

    pub fn channels_of(&self, peer: &Pubkey) -> Vec<(Hash256, ActorRef<ChannelActorMessage>)> {
        self.read()
            .iter()
            .filter(|(_, entry)| entry.peer == *peer)
            .map(|(id, entry)| (*id, entry.actor.clone()))
            .collect()
    }

    pub fn all(&self) -> Vec<(Hash256, ChannelEntry)> {
        self.read()
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// Outgoing side of the peer connections, as seen by a channel.
#[async_trait]
pub trait PeerMessageSink: Send + Sync {
    async fn send_message(
        &self,
        peer: &Pubkey,
        message: LightningMessage,
    ) -> Result<(), TransportError>;

    async fn disconnect(&self, peer: &Pubkey);
}

#[derive(Debug)]
pub enum ChannelActorMessage {
    /// Command are the messages that are sent to the channel actor to perform some action.
    /// It is normally generated from a user request.
    Command(ChannelCommand),
    /// Events from the chain or the connection to the peer.
    Event(ChannelEvent),
    /// Channel-scoped messages received from the peer.
    PeerMessage(LightningMessage),
}

#[derive(Debug, Clone)]
pub struct AddHtlcCommand {
    pub amount_msat: u64,
    pub payment_hash: Hash256,
    pub cltv_expiry: u32,
    pub onion_packet: Option<OnionPacket>,
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownCommand {
    /// Where our funds go; a P2WPKH script of our payment basepoint by default.
    pub close_script: Option<Vec<u8>>,
    pub fee_satoshis: Option<u64>,
}

pub type ChannelCommandReply<T> = RpcReplyPort<Result<T, ProcessingChannelError>>;

#[derive(Debug, AsRefStr)]
pub enum ChannelCommand {
    /// Offer an HTLC, replies with its id.
    AddHtlc(AddHtlcCommand, ChannelCommandReply<u64>),
    FulfillHtlc(u64, Hash256, ChannelCommandReply<()>),
    FailHtlc(u64, Vec<u8>, ChannelCommandReply<()>),
    FailMalformedHtlc(u64, Hash256, u16, ChannelCommandReply<()>),
    /// Sign the remote commitment if there is anything to sign.
    CommitmentSigned(),
    EnterQuiescence(ChannelCommandReply<()>),
    ExitQuiescence(ChannelCommandReply<()>),
    Shutdown(ShutdownCommand, ChannelCommandReply<()>),
    /// Replies with the txid of the broadcast commitment.
    ForceClose(ChannelCommandReply<Hash256>),
    Reestablish(ChannelCommandReply<()>),
    UpdateFee(u32, ChannelCommandReply<()>),
    GetState(RpcReplyPort<ChannelActorState>),
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    FundingConfirmed(ShortChannelId),
    /// The closing or commitment transaction with this txid is confirmed.
    ClosingConfirmed(Hash256),
    PeerDisconnected,
}

#[derive(Debug, Clone)]
pub struct OpenChannelParameter {
    pub temporary_channel_id: Hash256,
    pub funding_satoshis: u64,
    pub push_msat: u64,
    pub feerate_per_kw: u32,
    pub to_self_delay: u16,
    pub limits: ChannelLimits,
    pub seed: [u8; 32],
}

#[derive(Debug, Clone)]
pub struct AcceptChannelParameter {
    pub open_channel: OpenChannel,
    pub to_self_delay: u16,
    pub limits: ChannelLimits,
    pub seed: [u8; 32],
}

#[derive(Debug, Clone)]
pub enum ChannelInitializationOperation {
    /// To open a new channel to another peer.
    OpenChannel(OpenChannelParameter),
    /// To accept a new channel from another peer.
    AcceptChannel(AcceptChannelParameter),
    /// Reload the channel with this id from the store.
    Restore(Hash256),
}

/// Messages, events and disconnection requested by a handler, flushed once the new
/// state is persisted.
#[derive(Debug, Default)]
struct Effects {
    messages: Vec<LightningMessage>,
    events: Vec<WalletEvent>,
    disconnect: bool,
}

/// A copy of the channel state being modified by a handler.
struct Draft {
    state: ChannelActorState,
    effects: Effects,
}

impl Draft {
    fn new(state: &ChannelActorState) -> Self {
        Self {
            state: state.clone(),
            effects: Effects::default(),
        }
    }

    fn send(&mut self, message: LightningMessage) {
        self.effects.messages.push(message);
    }

    fn emit(&mut self, event: WalletEvent) {
        self.effects.events.push(event);
    }
}

fn check_state_for_local_update(state: &ChannelActorState) -> ProcessingChannelResult {
    match state.state {
        ChannelState::Normal => {}
        s if s.is_closed() => return Err(ProcessingChannelError::ChannelClosed),
        s => {
            return Err(ProcessingChannelError::InvalidState(format!(
                "can not update channel in state {}",
                s
            )))
        }
    }
    if state.tlc_state.waiting_ack {
        return Err(ProcessingChannelError::WaitingTlcAck);
    }
    Ok(())
}

fn check_state_for_peer_update(state: &ChannelActorState) -> ProcessingChannelResult {
    match state.state {
        ChannelState::Normal | ChannelState::ClosingNegotiation(_) => Ok(()),
        ChannelState::Quiescent(_) => Err(ProcessingChannelError::InvalidState(
            "channel update received while quiescent".to_string(),
        )),
        s if s.is_closed() => Err(ProcessingChannelError::ChannelClosed),
        s => Err(ProcessingChannelError::InvalidState(format!(
            "unexpected channel update in state {}",
            s
        ))),
    }
}

/// Sign the next remote commitment, covering every update sent so far.
fn send_commitment_signed(draft: &mut Draft) -> ProcessingChannelResult {
    let state = &mut draft.state;
    if state.tlc_state.waiting_ack {
        return Err(ProcessingChannelError::WaitingTlcAck);
    }
    state.commitment_numbers.increment_remote();
    let digest = commitment_digest(
        &state.id,
        &state.remote_pubkey,
        state.commitment_numbers.get_remote(),
    );
    let message = LightningMessage::CommitmentSigned(CommitmentSigned {
        channel_id: state.id,
        signature: state.signer.sign(&digest),
        htlc_signatures: vec![],
        tlvs: TlvStream::new(),
    });
    let mut retransmission = std::mem::take(&mut state.pending_updates);
    retransmission.push(encode(&message));
    state.last_commitment_signed = Some(retransmission);
    state.cs_sent_after_raa = true;
    state.tlc_state.set_waiting_ack(true);
    debug!(
        "Sending commitment_signed #{} for channel {}",
        state.commitment_numbers.get_remote(),
        state.id
    );
    draft.send(message);
    Ok(())
}

/// Remove a committed received HTLC and queue the matching update message.
fn queue_remove_received_htlc(
    draft: &mut Draft,
    tlc_id: u64,
    reason: RemoveTlcReason,
) -> ProcessingChannelResult {
    if let RemoveTlcReason::Fulfill { preimage } = &reason {
        let tlc = draft
            .state
            .tlc_state
            .get(&TLCId::Received(tlc_id))
            .ok_or_else(|| {
                ProcessingChannelError::InvalidParameter(format!("unknown htlc {}", tlc_id))
            })?;
        if sha256(preimage.as_ref()) != tlc.payment_hash {
            return Err(ProcessingChannelError::InvalidParameter(format!(
                "preimage does not match the payment hash of htlc {}",
                tlc_id
            )));
        }
    }
    let channel_id = draft.state.id;
    draft
        .state
        .tlc_state
        .set_received_tlc_removed(tlc_id, reason.clone())?;
    let message = match reason {
        RemoveTlcReason::Fulfill { preimage } => {
            LightningMessage::UpdateFulfillHtlc(UpdateFulfillHtlc {
                channel_id,
                id: tlc_id,
                payment_preimage: preimage,
                tlvs: TlvStream::new(),
            })
        }
        RemoveTlcReason::Fail { reason } => LightningMessage::UpdateFailHtlc(UpdateFailHtlc {
            channel_id,
            id: tlc_id,
            reason,
            tlvs: TlvStream::new(),
        }),
        RemoveTlcReason::FailMalformed {
            sha256_of_onion,
            failure_code,
        } => LightningMessage::UpdateFailMalformedHtlc(UpdateFailMalformedHtlc {
            channel_id,
            id: tlc_id,
            sha256_of_onion,
            failure_code,
            tlvs: TlvStream::new(),
        }),
    };
    draft.state.record_update(&message);
    draft.send(message);
    Ok(())
}

fn closing_signed_message(state: &ChannelActorState, fee_satoshis: u64) -> LightningMessage {
    LightningMessage::ClosingSigned(ClosingSigned {
        channel_id: state.id,
        fee_satoshis,
        signature: state.signer.sign(&closing_digest(&state.id, fee_satoshis)),
        tlvs: TlvStream::new(),
    })
}

fn default_closing_fee(state: &ChannelActorState) -> u64 {
    state.feerate_per_kw as u64 * CLOSING_TX_WEIGHT / 1000
}

fn channel_ready_message(state: &ChannelActorState) -> LightningMessage {
    LightningMessage::ChannelReady(ChannelReady {
        channel_id: state.id,
        second_per_commitment_point: state
            .signer
            .get_commitment_point(INITIAL_COMMITMENT_NUMBER + 1),
        tlvs: TlvStream::new(),
    })
}

pub struct ChannelActor<S> {
    local_pubkey: Pubkey,
    remote_pubkey: Pubkey,
    store: S,
    wallet: Arc<dyn OnChainWallet>,
    sink: Arc<dyn PeerMessageSink>,
    events: EventBus,
    registry: ChannelRegistry,
}

impl<S> ChannelActor<S>
where
    S: ChannelStore + ChannelSeedStore + InvoiceStore + PreimageStore + Send + Sync + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_pubkey: Pubkey,
        remote_pubkey: Pubkey,
        store: S,
        wallet: Arc<dyn OnChainWallet>,
        sink: Arc<dyn PeerMessageSink>,
        events: EventBus,
        registry: ChannelRegistry,
    ) -> Self {
        Self {
            local_pubkey,
            remote_pubkey,
            store,
            wallet,
            sink,
            events,
            registry,
        }
    }

    pub fn get_local_pubkey(&self) -> Pubkey {
        self.local_pubkey
    }

    pub fn get_remote_pubkey(&self) -> Pubkey {
        self.remote_pubkey
    }

    /// Persist the draft, make it the live state and flush its effects.
    async fn commit(
        &self,
        state: &mut ChannelActorState,
        draft: Draft,
    ) -> ProcessingChannelResult {
        let Draft {
            state: mut new_state,
            effects,
        } = draft;
        new_state.updated_at = now_timestamp_as_millis_u64();
        self.store.save_channel(&new_state)?;

        let old_id = state.id;
        let old_state = state.state;
        *state = new_state;

        if old_id != state.id {
            self.registry.rekey(&old_id, state.id);
            if let Err(err) = self.store.delete_channel(&old_id) {
                warn!("Failed to delete channel record {}: {}", old_id, err);
            }
            self.events.emit(WalletEvent::ChannelIdChanged {
                old_channel_id: old_id,
                new_channel_id: state.id,
            });
        }
        self.publish_transition(state, old_state);
        let broadcast = self.broadcast_pending(state).await;
        self.flush(effects).await;
        broadcast
    }

    fn publish_transition(&self, state: &ChannelActorState, old_state: ChannelState) {
        if old_state != state.state {
            info!(
                "Channel {} transitions from {} to {}",
                state.id, old_state, state.state
            );
            self.events.emit(WalletEvent::ChannelStateChanged {
                channel_id: state.id,
                peer: self.remote_pubkey,
                state: state.state,
            });
        }
    }

    /// Hand the persisted pending transaction, if any, to the wallet and record the
    /// outcome. On failure the intent stays in place for the next attempt.
    async fn broadcast_pending(&self, state: &mut ChannelActorState) -> ProcessingChannelResult {
        let Some(pending) = state.pending_broadcast.clone() else {
            return Ok(());
        };
        let mut updated = state.clone();
        updated.pending_broadcast = None;
        match pending {
            PendingBroadcast::Funding(funding) => {
                self.wallet.broadcast_funding(funding).await?;
                info!("Funding transaction of channel {} broadcast", state.id);
            }
            PendingBroadcast::Commitment(commitment) => {
                let txid = self.wallet.broadcast_commitment(commitment).await?;
                warn!("Force closed channel {} with commitment {}", state.id, txid);
                updated.force_close_txid = Some(txid);
            }
            PendingBroadcast::Closing(closing) => {
                let fee_sat = closing.fee_sat;
                let txid = self.wallet.broadcast_closing(closing).await?;
                info!(
                    "Channel {} closed cooperatively with fee {} sat, txid {}",
                    state.id, fee_sat, txid
                );
                updated.closing_txid = Some(txid);
                updated.state = ChannelState::Closed(CloseFlags::COOPERATIVE);
            }
        }
        updated.updated_at = now_timestamp_as_millis_u64();
        if let Err(err) = self.store.save_channel(&updated) {
            error!(
                "Failed to persist the broadcast of channel {}, it is retried on restore: {}",
                state.id, err
            );
        }
        let old_state = state.state;
        *state = updated;
        self.publish_transition(state, old_state);
        Ok(())
    }

    async fn flush(&self, effects: Effects) {
        for message in effects.messages {
            trace!("Sending {:?} to {}", message, self.remote_pubkey);
            if let Err(err) = self.sink.send_message(&self.remote_pubkey, message).await {
                warn!("Failed to send message to peer {}: {}", self.remote_pubkey, err);
            }
        }
        for event in effects.events {
            self.events.emit(event);
        }
        if effects.disconnect {
            self.sink.disconnect(&self.remote_pubkey).await;
        }
    }

    async fn finish<T>(
        &self,
        state: &mut ChannelActorState,
        draft: Draft,
        result: Result<T, ProcessingChannelError>,
    ) -> Result<T, ProcessingChannelError> {
        let value = result?;
        self.commit(state, draft).await?;
        Ok(value)
    }

    async fn handle_peer_message(
        &self,
        draft: &mut Draft,
        message: LightningMessage,
    ) -> ProcessingChannelResult {
        if draft.state.state.is_closed()
            && !matches!(
                message,
                LightningMessage::Error(_)
                    | LightningMessage::Warning(_)
                    | LightningMessage::ChannelReestablish(_)
                    | LightningMessage::ClosingSigned(_)
            )
        {
            return Err(ProcessingChannelError::ChannelClosed);
        }
        match message {
            LightningMessage::AcceptChannel(accept_channel) => {
                self.handle_accept_channel(draft, accept_channel).await
            }
            LightningMessage::FundingCreated(funding_created) => {
                self.handle_funding_created(draft, funding_created)
            }
            LightningMessage::FundingSigned(funding_signed) => {
                self.handle_funding_signed(draft, funding_signed)
            }
            LightningMessage::ChannelReady(channel_ready) => {
                self.handle_channel_ready(draft, channel_ready)
            }
            LightningMessage::UpdateAddHtlc(add) => self.handle_update_add_htlc(draft, add),
            LightningMessage::UpdateFulfillHtlc(fulfill) => {
                check_state_for_peer_update(&draft.state)?;
                let tlc = draft
                    .state
                    .tlc_state
                    .get(&TLCId::Offered(fulfill.id))
                    .ok_or_else(|| {
                        ProcessingChannelError::InvalidParameter(format!(
                            "unknown htlc {}",
                            fulfill.id
                        ))
                    })?;
                if sha256(fulfill.payment_preimage.as_ref()) != tlc.payment_hash {
                    return Err(ProcessingChannelError::InvalidParameter(format!(
                        "preimage does not match the payment hash of htlc {}",
                        fulfill.id
                    )));
                }
                let payment_hash = draft
                    .state
                    .tlc_state
                    .set_offered_tlc_removed(
                        fulfill.id,
                        RemoveTlcReason::Fulfill {
                            preimage: fulfill.payment_preimage,
                        },
                    )?
                    .payment_hash;
                // The preimage is known from now on, whatever happens to the commitments.
                draft.emit(WalletEvent::HtlcResolved {
                    channel_id: draft.state.id,
                    htlc_id: fulfill.id,
                    payment_hash,
                    resolution: HtlcResolution::Fulfilled {
                        preimage: fulfill.payment_preimage,
                    },
                });
                Ok(())
            }
            LightningMessage::UpdateFailHtlc(fail) => {
                check_state_for_peer_update(&draft.state)?;
                draft.state.tlc_state.set_offered_tlc_removed(
                    fail.id,
                    RemoveTlcReason::Fail {
                        reason: fail.reason,
                    },
                )?;
                Ok(())
            }
            LightningMessage::UpdateFailMalformedHtlc(fail) => {
                check_state_for_peer_update(&draft.state)?;
                if fail.failure_code & 0x8000 == 0 {
                    return Err(ProcessingChannelError::InvalidParameter(
                        "update_fail_malformed_htlc without the BADONION bit".to_string(),
                    ));
                }
                draft.state.tlc_state.set_offered_tlc_removed(
                    fail.id,
                    RemoveTlcReason::FailMalformed {
                        sha256_of_onion: fail.sha256_of_onion,
                        failure_code: fail.failure_code,
                    },
                )?;
                Ok(())
            }
            LightningMessage::CommitmentSigned(commitment_signed) => {
                self.handle_commitment_signed(draft, commitment_signed)
            }
            LightningMessage::RevokeAndAck(revoke_and_ack) => {
                self.handle_revoke_and_ack(draft, revoke_and_ack)
            }
            LightningMessage::UpdateFee(update_fee) => {
                check_state_for_peer_update(&draft.state)?;
                if draft.state.is_funder {
                    return Err(ProcessingChannelError::InvalidParameter(
                        "update_fee received from the non-funder".to_string(),
                    ));
                }
                debug!(
                    "Peer proposes feerate {} for channel {}",
                    update_fee.feerate_per_kw, draft.state.id
                );
                draft.state.pending_feerate = Some(update_fee.feerate_per_kw);
                Ok(())
            }
            LightningMessage::Stfu(stfu) => self.handle_stfu(draft, stfu),
            LightningMessage::Shutdown(shutdown) => self.handle_shutdown(draft, shutdown),
            LightningMessage::ClosingSigned(closing_signed) => {
                self.handle_closing_signed(draft, closing_signed)
            }
            LightningMessage::ChannelReestablish(reestablish) => {
                self.handle_channel_reestablish(draft, reestablish)
            }
            LightningMessage::Error(error) => self.handle_error_message(draft, error),
            LightningMessage::Warning(warning) => {
                warn!(
                    "Peer {} warns about channel {}: {}",
                    self.remote_pubkey,
                    warning.channel_id,
                    String::from_utf8_lossy(&warning.data)
                );
                Ok(())
            }
            other => Err(ProcessingChannelError::InvalidParameter(format!(
                "unexpected message type {} for a channel",
                other.msg_type()
            ))),
        }
    }

    async fn handle_accept_channel(
        &self,
        draft: &mut Draft,
        accept_channel: AcceptChannel,
    ) -> ProcessingChannelResult {
        if draft.state.state != ChannelState::Negotiating(NegotiatingFlags::OUR_INIT_SENT) {
            return Err(ProcessingChannelError::InvalidState(format!(
                "unexpected accept_channel in state {}",
                draft.state.state
            )));
        }
        if accept_channel.to_self_delay < DEFAULT_MIN_TO_SELF_DELAY {
            return Err(ProcessingChannelError::InvalidChannelParameters(format!(
                "to_self_delay {} is below the minimum of {} blocks",
                accept_channel.to_self_delay, DEFAULT_MIN_TO_SELF_DELAY
            )));
        }
        if accept_channel.channel_reserve_satoshis < accept_channel.dust_limit_satoshis {
            return Err(ProcessingChannelError::InvalidChannelParameters(format!(
                "channel reserve {} sat is below the dust limit of {} sat",
                accept_channel.channel_reserve_satoshis, accept_channel.dust_limit_satoshis
            )));
        }

        let state = &mut draft.state;
        state.state = ChannelState::Negotiating(NegotiatingFlags::INIT_SENT);
        state.remote_params = Some((&accept_channel).into());
        state.remote_commitment_points.insert(
            INITIAL_COMMITMENT_NUMBER,
            accept_channel.basepoints.first_per_commitment_point,
        );

        let request = FundingRequest {
            temporary_channel_id: state.temporary_id,
            amount_sat: state.funding_satoshis,
            local_funding_pubkey: state.signer.funding_key.pubkey(),
            remote_funding_pubkey: accept_channel.basepoints.funding_pubkey,
            feerate_per_kw: state.feerate_per_kw,
        };
        let funding = match self.wallet.create_funding_transaction(request).await {
            Ok(funding) => funding,
            Err(err) => {
                error!(
                    "Failed to create the funding transaction of channel {}: {}",
                    draft.state.id, err
                );
                draft.state.state = ChannelState::Closed(CloseFlags::FUNDING_ABORTED);
                let message = ErrorMessage::new(draft.state.id, "funding failed");
                draft.send(LightningMessage::Error(message));
                return Ok(());
            }
        };

        let state = &mut draft.state;
        let channel_id = channel_id_from_funding(&funding.txid, funding.output_index);
        state.funding_txid = Some(funding.txid);
        state.funding_output_index = funding.output_index;
        state.id = channel_id;
        let signature = state.signer.sign(&commitment_digest(
            &channel_id,
            &state.remote_pubkey,
            INITIAL_COMMITMENT_NUMBER,
        ));
        state.state = ChannelState::FundingSigned(FundingFlags::AWAITING_FUNDING_SIGNED);
        let message = LightningMessage::FundingCreated(FundingCreated {
            temporary_channel_id: state.temporary_id,
            funding_txid: funding.txid,
            funding_output_index: funding.output_index,
            signature,
            tlvs: TlvStream::new(),
        });
        draft.send(message);
        Ok(())
    }

    fn handle_funding_created(
        &self,
        draft: &mut Draft,
        funding_created: FundingCreated,
    ) -> ProcessingChannelResult {
        let state = &mut draft.state;
        if state.is_funder || state.state != ChannelState::Negotiating(NegotiatingFlags::INIT_SENT)
        {
            return Err(ProcessingChannelError::InvalidState(format!(
                "unexpected funding_created in state {}",
                state.state
            )));
        }
        let channel_id = channel_id_from_funding(
            &funding_created.funding_txid,
            funding_created.funding_output_index,
        );
        verify_signature(
            &state.get_remote_funding_pubkey()?,
            &commitment_digest(&channel_id, &state.local_pubkey, INITIAL_COMMITMENT_NUMBER),
            &funding_created.signature,
        )?;
        state.funding_txid = Some(funding_created.funding_txid);
        state.funding_output_index = funding_created.funding_output_index;
        state.id = channel_id;
        state.state = ChannelState::FundingSigned(FundingFlags::AWAITING_CONFIRMATION);
        let signature = state.signer.sign(&commitment_digest(
            &channel_id,
            &state.remote_pubkey,
            INITIAL_COMMITMENT_NUMBER,
        ));
        draft.send(LightningMessage::FundingSigned(FundingSigned {
            channel_id,
            signature,
            tlvs: TlvStream::new(),
        }));
        Ok(())
    }

    fn handle_funding_signed(
        &self,
        draft: &mut Draft,
        funding_signed: FundingSigned,
    ) -> ProcessingChannelResult {
        let state = &mut draft.state;
        if state.state != ChannelState::FundingSigned(FundingFlags::AWAITING_FUNDING_SIGNED) {
            return Err(ProcessingChannelError::InvalidState(format!(
                "unexpected funding_signed in state {}",
                state.state
            )));
        }
        verify_signature(
            &state.get_remote_funding_pubkey()?,
            &commitment_digest(&state.id, &state.local_pubkey, INITIAL_COMMITMENT_NUMBER),
            &funding_signed.signature,
        )?;
        let funding = state
            .funding_outpoint()
            .ok_or(ProcessingChannelError::NoFundingTransaction)?;
        state.pending_broadcast = Some(PendingBroadcast::Funding(funding));
        state.state = ChannelState::FundingSigned(FundingFlags::AWAITING_CONFIRMATION);
        Ok(())
    }

    fn handle_channel_ready(
        &self,
        draft: &mut Draft,
        channel_ready: ChannelReady,
    ) -> ProcessingChannelResult {
        let state = &mut draft.state;
        let flags = match state.state {
            ChannelState::FundingSigned(FundingFlags::AWAITING_CONFIRMATION) => {
                ChannelReadyFlags::empty()
            }
            ChannelState::ChannelReady(flags) => flags,
            ChannelState::Normal | ChannelState::Offline => {
                debug!("Ignoring retransmitted channel_ready for {}", state.id);
                return Ok(());
            }
            s => {
                return Err(ProcessingChannelError::InvalidState(format!(
                    "unexpected channel_ready in state {}",
                    s
                )))
            }
        };
        state.remote_commitment_points.insert(
            INITIAL_COMMITMENT_NUMBER + 1,
            channel_ready.second_per_commitment_point,
        );
        if let Some(alias) =
            channel_ready
                .tlvs
                .find(|record| match record {
                    ChannelReadyTlv::ShortChannelIdAlias(alias) => Some(*alias),
                    _ => None,
                })
        {
            trace!("Peer uses alias {} for channel {}", alias, state.id);
        }
        let flags = flags | ChannelReadyFlags::THEIR_CHANNEL_READY;
        state.state = if flags.contains(ChannelReadyFlags::CHANNEL_READY) {
            ChannelState::Normal
        } else {
            ChannelState::ChannelReady(flags)
        };
        Ok(())
    }

    fn handle_add_htlc_command(
        &self,
        draft: &mut Draft,
        command: AddHtlcCommand,
    ) -> Result<u64, ProcessingChannelError> {
        let state = &mut draft.state;
        check_state_for_local_update(state)?;
        if state.has_offered_tlc_with_hash(&command.payment_hash) {
            return Err(ProcessingChannelError::DuplicatePaymentHash(
                command.payment_hash,
            ));
        }
        let remote_params = state.remote_params()?;
        if command.amount_msat < remote_params.htlc_minimum_msat {
            return Err(ProcessingChannelError::InvalidParameter(format!(
                "htlc amount {} msat is below the peer's minimum of {} msat",
                command.amount_msat, remote_params.htlc_minimum_msat
            )));
        }
        if state.tlc_state.offered_tlcs.tlcs.len() >= remote_params.max_accepted_htlcs as usize {
            return Err(ProcessingChannelError::InvalidParameter(format!(
                "the peer accepts at most {} pending htlcs",
                remote_params.max_accepted_htlcs
            )));
        }
        if state.pending_offered_msat() + command.amount_msat
            > remote_params.max_htlc_value_in_flight_msat
        {
            return Err(ProcessingChannelError::InvalidParameter(format!(
                "htlc amount {} msat exceeds the peer's in-flight limit of {} msat",
                command.amount_msat, remote_params.max_htlc_value_in_flight_msat
            )));
        }
        let available = state.get_available_to_send_msat();
        if command.amount_msat > available {
            return Err(ProcessingChannelError::InsufficientFunds {
                requested: command.amount_msat,
                available,
            });
        }

        let tlc_id = state.tlc_state.get_next_offering();
        state.tlc_state.add_offered_tlc(TlcInfo {
            tlc_id: TLCId::Offered(tlc_id),
            status: TlcStatus::Outbound(OutboundTlcStatus::LocalAnnounced),
            amount_msat: command.amount_msat,
            payment_hash: command.payment_hash,
            cltv_expiry: command.cltv_expiry,
            created_at: state.commitment_numbers,
            removed_reason: None,
            removed_confirmed_at: None,
        });
        let message = LightningMessage::UpdateAddHtlc(UpdateAddHtlc {
            channel_id: state.id,
            id: tlc_id,
            amount_msat: command.amount_msat,
            payment_hash: command.payment_hash,
            cltv_expiry: command.cltv_expiry,
            onion_routing_packet: command.onion_packet.unwrap_or_else(OnionPacket::blank),
            tlvs: TlvStream::new(),
        });
        state.record_update(&message);
        draft.send(message);
        send_commitment_signed(draft)?;
        Ok(tlc_id)
    }

    fn handle_update_add_htlc(
        &self,
        draft: &mut Draft,
        add: UpdateAddHtlc,
    ) -> ProcessingChannelResult {
        let state = &mut draft.state;
        check_state_for_peer_update(state)?;
        if !matches!(state.state, ChannelState::Normal) {
            return Err(ProcessingChannelError::InvalidState(format!(
                "unexpected update_add_htlc in state {}",
                state.state
            )));
        }
        if add.id != state.tlc_state.get_next_received() {
            return Err(ProcessingChannelError::InvalidParameter(format!(
                "expected htlc id {}, got {}",
                state.tlc_state.get_next_received(),
                add.id
            )));
        }
        if add.amount_msat < state.local_params.htlc_minimum_msat {
            return Err(ProcessingChannelError::InvalidParameter(format!(
                "htlc amount {} msat is below our minimum of {} msat",
                add.amount_msat, state.local_params.htlc_minimum_msat
            )));
        }
        if state.tlc_state.received_tlcs.tlcs.len() >= state.local_params.max_accepted_htlcs as usize
        {
            return Err(ProcessingChannelError::InvalidParameter(format!(
                "we accept at most {} pending htlcs",
                state.local_params.max_accepted_htlcs
            )));
        }
        let available = state.get_available_to_receive_msat();
        if add.amount_msat > available {
            return Err(ProcessingChannelError::InsufficientFunds {
                requested: add.amount_msat,
                available,
            });
        }
        state.tlc_state.add_received_tlc(TlcInfo {
            tlc_id: TLCId::Received(add.id),
            status: TlcStatus::Inbound(InboundTlcStatus::RemoteAnnounced),
            amount_msat: add.amount_msat,
            payment_hash: add.payment_hash,
            cltv_expiry: add.cltv_expiry,
            created_at: state.commitment_numbers,
            removed_reason: None,
            removed_confirmed_at: None,
        });
        Ok(())
    }

    fn handle_remove_htlc_command(
        &self,
        draft: &mut Draft,
        tlc_id: u64,
        reason: RemoveTlcReason,
    ) -> ProcessingChannelResult {
        check_state_for_local_update(&draft.state)?;
        queue_remove_received_htlc(draft, tlc_id, reason)?;
        send_commitment_signed(draft)
    }

    fn handle_commitment_signed(
        &self,
        draft: &mut Draft,
        commitment_signed: CommitmentSigned,
    ) -> ProcessingChannelResult {
        let state = &mut draft.state;
        check_state_for_peer_update(state)?;
        let next_local = state.commitment_numbers.get_local() + 1;
        verify_signature(
            &state.get_remote_funding_pubkey()?,
            &commitment_digest(&state.id, &state.local_pubkey, next_local),
            &commitment_signed.signature,
        )?;

        let mut need_another = state.tlc_state.update_for_commitment_signed();
        state.commitment_numbers.increment_local();

        for tlc in state.tlc_state.take_settled(true) {
            if let Some(RemoveTlcReason::Fulfill { .. }) = tlc.removed_reason {
                state.to_remote_msat = state.to_remote_msat.saturating_sub(tlc.amount_msat);
                state.to_local_msat += tlc.amount_msat;
            }
        }
        if !state.is_funder {
            if let Some(feerate) = state.pending_feerate.take() {
                state.feerate_per_kw = feerate;
                need_another = true;
            }
        }

        let local_number = state.commitment_numbers.get_local();
        let message = LightningMessage::RevokeAndAck(RevokeAndAck {
            channel_id: state.id,
            per_commitment_secret: state.signer.get_commitment_secret(local_number - 1).into(),
            next_per_commitment_point: state.signer.get_commitment_point(local_number + 1),
            tlvs: TlvStream::new(),
        });
        state.last_revoke_and_ack = Some(encode(&message));
        state.cs_sent_after_raa = false;
        draft.send(message);

        if need_another && !draft.state.tlc_state.waiting_ack {
            send_commitment_signed(draft)?;
        }
        Ok(())
    }

    fn handle_revoke_and_ack(
        &self,
        draft: &mut Draft,
        revoke_and_ack: RevokeAndAck,
    ) -> ProcessingChannelResult {
        let state = &mut draft.state;
        check_state_for_peer_update(state)?;
        if !state.tlc_state.waiting_ack {
            return Err(ProcessingChannelError::InvalidState(
                "unexpected revoke_and_ack".to_string(),
            ));
        }
        let revocation_number = state.remote_revocation_number;
        let expected_point = state
            .remote_commitment_points
            .get(&revocation_number)
            .copied()
            .ok_or_else(|| {
                ProcessingChannelError::InvalidState(format!(
                    "unknown remote commitment point #{}",
                    revocation_number
                ))
            })?;
        if commitment_point_from_secret(revoke_and_ack.per_commitment_secret.as_bytes())
            != Some(expected_point)
        {
            return Err(ProcessingChannelError::InvalidRevocationSecret(
                revocation_number,
            ));
        }
        state.last_remote_secret = Some(revoke_and_ack.per_commitment_secret);
        state
            .remote_commitment_points
            .insert(revocation_number + 2, revoke_and_ack.next_per_commitment_point);
        state
            .remote_commitment_points
            .retain(|number, _| *number > revocation_number);
        state.remote_revocation_number += 1;

        let announced: Vec<u64> = state
            .tlc_state
            .received_tlcs
            .tlcs
            .iter()
            .filter(|tlc| tlc.inbound_status() == Some(InboundTlcStatus::AnnounceWaitAck))
            .map(|tlc| tlc.id())
            .collect();
        state
            .tlc_state
            .update_for_revoke_and_ack(state.commitment_numbers);
        state.tlc_state.set_waiting_ack(false);
        state.last_commitment_signed = None;

        let channel_id = state.id;
        let mut failed = vec![];
        for tlc in state.tlc_state.take_settled(false) {
            match &tlc.removed_reason {
                Some(RemoveTlcReason::Fulfill { .. }) => {
                    state.to_local_msat = state.to_local_msat.saturating_sub(tlc.amount_msat);
                    state.to_remote_msat += tlc.amount_msat;
                }
                Some(reason) => failed.push((tlc.id(), tlc.payment_hash, reason.clone())),
                None => {}
            }
        }
        if state.is_funder {
            if let Some(feerate) = state.pending_feerate.take() {
                state.feerate_per_kw = feerate;
            }
        }
        for (htlc_id, payment_hash, reason) in failed {
            draft.emit(WalletEvent::HtlcResolved {
                channel_id,
                htlc_id,
                payment_hash,
                resolution: HtlcResolution::Failed {
                    reason: reason.describe_failure().unwrap_or_default(),
                },
            });
        }

        for tlc_id in announced {
            self.resolve_received_htlc(draft, tlc_id)?;
        }
        if draft.state.tlc_state.need_another_commitment_signed() {
            send_commitment_signed(draft)?;
        }
        Ok(())
    }

    /// Settle an irrevocably committed HTLC paying us.
    fn resolve_received_htlc(&self, draft: &mut Draft, tlc_id: u64) -> ProcessingChannelResult {
        let Some(tlc) = draft.state.tlc_state.get(&TLCId::Received(tlc_id)).cloned() else {
            return Ok(());
        };
        if tlc.inbound_status() != Some(InboundTlcStatus::Committed) {
            return Ok(());
        }
        let invoice_status = self.store.get_invoice_status(&tlc.payment_hash);
        let preimage = match invoice_status {
            Some(InvoiceStatus::Cancelled) | Some(InvoiceStatus::Expired) => None,
            _ => self.store.get_preimage(&tlc.payment_hash),
        };
        match preimage {
            Some(preimage) => {
                info!(
                    "Fulfilling htlc {} of channel {} for payment {}",
                    tlc_id, draft.state.id, tlc.payment_hash
                );
                queue_remove_received_htlc(draft, tlc_id, RemoveTlcReason::Fulfill { preimage })?;
                if invoice_status.is_some() {
                    if let Err(err) = self
                        .store
                        .update_invoice_status(&tlc.payment_hash, InvoiceStatus::Paid)
                    {
                        warn!("Failed to mark invoice {} paid: {}", tlc.payment_hash, err);
                    }
                }
            }
            None => {
                debug!(
                    "Failing htlc {} of channel {}: unknown payment {}",
                    tlc_id, draft.state.id, tlc.payment_hash
                );
                let mut data = tlc.amount_msat.to_be_bytes().to_vec();
                data.extend_from_slice(&0u32.to_be_bytes());
                queue_remove_received_htlc(
                    draft,
                    tlc_id,
                    RemoveTlcReason::failure(INCORRECT_OR_UNKNOWN_PAYMENT_DETAILS, &data),
                )?;
            }
        }
        Ok(())
    }

    fn handle_update_fee_command(&self, draft: &mut Draft, feerate_per_kw: u32) -> ProcessingChannelResult {
        check_state_for_local_update(&draft.state)?;
        if !draft.state.is_funder {
            return Err(ProcessingChannelError::InvalidParameter(
                "only the funder can update the fee".to_string(),
            ));
        }
        if feerate_per_kw == 0 {
            return Err(ProcessingChannelError::InvalidParameter(
                "feerate must be positive".to_string(),
            ));
        }
        draft.state.pending_feerate = Some(feerate_per_kw);
        let message = LightningMessage::UpdateFee(UpdateFee {
            channel_id: draft.state.id,
            feerate_per_kw,
            tlvs: TlvStream::new(),
        });
        draft.state.record_update(&message);
        draft.send(message);
        send_commitment_signed(draft)
    }

    fn handle_enter_quiescence(&self, draft: &mut Draft) -> ProcessingChannelResult {
        let state = &mut draft.state;
        if state.state != ChannelState::Normal {
            return Err(ProcessingChannelError::InvalidState(format!(
                "can not enter quiescence in state {}",
                state.state
            )));
        }
        if state.has_pending_work() {
            return Err(ProcessingChannelError::InvalidState(
                "channel has pending updates".to_string(),
            ));
        }
        state.state = ChannelState::Quiescent(QuiescenceFlags::OUR_STFU_SENT);
        let message = LightningMessage::Stfu(Stfu {
            channel_id: state.id,
            initiator: true,
            tlvs: TlvStream::new(),
        });
        draft.send(message);
        Ok(())
    }

    fn handle_stfu(&self, draft: &mut Draft, stfu: Stfu) -> ProcessingChannelResult {
        let state = &mut draft.state;
        match state.state {
            ChannelState::Normal => {
                if state.has_pending_work() {
                    return Err(ProcessingChannelError::InvalidState(
                        "channel has pending updates".to_string(),
                    ));
                }
                state.state = ChannelState::Quiescent(QuiescenceFlags::QUIESCENT);
                let message = LightningMessage::Stfu(Stfu {
                    channel_id: state.id,
                    initiator: !stfu.initiator,
                    tlvs: TlvStream::new(),
                });
                draft.send(message);
                Ok(())
            }
            ChannelState::Quiescent(flags) if flags == QuiescenceFlags::OUR_STFU_SENT => {
                state.state = ChannelState::Quiescent(QuiescenceFlags::QUIESCENT);
                Ok(())
            }
            s => Err(ProcessingChannelError::InvalidState(format!(
                "unexpected stfu in state {}",
                s
            ))),
        }
    }

    fn handle_exit_quiescence(&self, draft: &mut Draft) -> ProcessingChannelResult {
        match draft.state.state {
            ChannelState::Quiescent(_) => {
                draft.state.state = ChannelState::Normal;
                Ok(())
            }
            s => Err(ProcessingChannelError::InvalidState(format!(
                "channel is not quiescent but {}",
                s
            ))),
        }
    }

    fn local_shutdown_script(state: &ChannelActorState, requested: Option<Vec<u8>>) -> Vec<u8> {
        requested
            .filter(|script| !script.is_empty())
            .unwrap_or_else(|| p2wpkh_script(&state.local_params.basepoints.payment_basepoint))
    }

    fn send_shutdown(draft: &mut Draft, script: Vec<u8>) {
        draft.state.local_shutdown_script = Some(script.clone());
        let message = LightningMessage::Shutdown(Shutdown {
            channel_id: draft.state.id,
            scriptpubkey: script,
            tlvs: TlvStream::new(),
        });
        draft.send(message);
    }

    fn propose_closing_fee(draft: &mut Draft) {
        let fee = draft
            .state
            .closing_fee_satoshis
            .unwrap_or_else(|| default_closing_fee(&draft.state));
        let message = closing_signed_message(&draft.state, fee);
        draft.state.last_closing_fee_sent = Some(fee);
        if let ChannelState::ClosingNegotiation(flags) = draft.state.state {
            draft.state.state =
                ChannelState::ClosingNegotiation(flags | ClosingFlags::CLOSING_SIGNED_SENT);
        }
        draft.send(message);
    }

    fn handle_shutdown_command(
        &self,
        draft: &mut Draft,
        command: ShutdownCommand,
    ) -> ProcessingChannelResult {
        let flags = match draft.state.state {
            ChannelState::Normal => ClosingFlags::empty(),
            ChannelState::ClosingNegotiation(flags)
                if !flags.contains(ClosingFlags::OUR_SHUTDOWN_SENT) =>
            {
                flags
            }
            s if s.is_closed() => return Err(ProcessingChannelError::ChannelClosed),
            s => {
                return Err(ProcessingChannelError::InvalidState(format!(
                    "can not shut down channel in state {}",
                    s
                )))
            }
        };
        if draft.state.has_pending_htlcs() {
            return Err(ProcessingChannelError::InvalidState(
                "channel has pending htlcs".to_string(),
            ));
        }
        let script = Self::local_shutdown_script(&draft.state, command.close_script);
        if script.is_empty() {
            return Err(ProcessingChannelError::InvalidParameter(
                "empty shutdown script".to_string(),
            ));
        }
        draft.state.closing_fee_satoshis = command.fee_satoshis;
        Self::send_shutdown(draft, script);
        let flags = flags | ClosingFlags::OUR_SHUTDOWN_SENT;
        draft.state.state = ChannelState::ClosingNegotiation(flags);
        if flags.contains(ClosingFlags::SHUTDOWN_SENT) && draft.state.is_funder {
            Self::propose_closing_fee(draft);
        }
        Ok(())
    }

    fn handle_shutdown(&self, draft: &mut Draft, shutdown: Shutdown) -> ProcessingChannelResult {
        let flags = match draft.state.state {
            ChannelState::Normal => ClosingFlags::empty(),
            ChannelState::ClosingNegotiation(flags)
                if !flags.contains(ClosingFlags::THEIR_SHUTDOWN_SENT) =>
            {
                flags
            }
            s => {
                return Err(ProcessingChannelError::InvalidState(format!(
                    "unexpected shutdown in state {}",
                    s
                )))
            }
        };
        if draft.state.has_pending_htlcs() {
            return Err(ProcessingChannelError::InvalidState(
                "shutdown with pending htlcs is not supported".to_string(),
            ));
        }
        draft.state.remote_shutdown_script = Some(shutdown.scriptpubkey);
        let mut flags = flags | ClosingFlags::THEIR_SHUTDOWN_SENT;
        if !flags.contains(ClosingFlags::OUR_SHUTDOWN_SENT) {
            let script = Self::local_shutdown_script(&draft.state, None);
            Self::send_shutdown(draft, script);
            flags |= ClosingFlags::OUR_SHUTDOWN_SENT;
        }
        draft.state.state = ChannelState::ClosingNegotiation(flags);
        if draft.state.is_funder {
            Self::propose_closing_fee(draft);
        }
        Ok(())
    }

    fn handle_closing_signed(
        &self,
        draft: &mut Draft,
        closing_signed: ClosingSigned,
    ) -> ProcessingChannelResult {
        match draft.state.state {
            ChannelState::ClosingNegotiation(flags) if flags.contains(ClosingFlags::SHUTDOWN_SENT) => {}
            ChannelState::Closed(CloseFlags::COOPERATIVE) => {
                debug!("Channel {} is already closed cooperatively", draft.state.id);
                return Ok(());
            }
            s => {
                return Err(ProcessingChannelError::InvalidState(format!(
                    "unexpected closing_signed in state {}",
                    s
                )))
            }
        }
        let their_fee = closing_signed.fee_satoshis;
        verify_signature(
            &draft.state.get_remote_funding_pubkey()?,
            &closing_digest(&draft.state.id, their_fee),
            &closing_signed.signature,
        )?;
        if their_fee > draft.state.funding_satoshis {
            return Err(ProcessingChannelError::InvalidParameter(format!(
                "closing fee {} sat exceeds the channel capacity",
                their_fee
            )));
        }

        if draft.state.last_closing_fee_sent != Some(their_fee) {
            let ours = draft
                .state
                .last_closing_fee_sent
                .or(draft.state.closing_fee_satoshis)
                .unwrap_or_else(|| default_closing_fee(&draft.state));
            let middle = (ours + their_fee) / 2;
            if middle.abs_diff(their_fee) > 1 {
                debug!(
                    "Counter proposing closing fee {} to {} for channel {}",
                    middle, their_fee, draft.state.id
                );
                let message = closing_signed_message(&draft.state, middle);
                draft.state.last_closing_fee_sent = Some(middle);
                draft.send(message);
                return Ok(());
            }
            let message = closing_signed_message(&draft.state, their_fee);
            draft.state.last_closing_fee_sent = Some(their_fee);
            draft.send(message);
        }

        let state = &mut draft.state;
        let funding = state
            .funding_outpoint()
            .ok_or(ProcessingChannelError::NoFundingTransaction)?;
        let (local_fee, remote_fee) = if state.is_funder {
            (their_fee, 0)
        } else {
            (0, their_fee)
        };
        let closing = ClosingBroadcast {
            channel_id: state.id,
            funding,
            fee_sat: their_fee,
            local_script: state.local_shutdown_script.clone().unwrap_or_default(),
            remote_script: state.remote_shutdown_script.clone().unwrap_or_default(),
            to_local_sat: (state.to_local_msat / 1000).saturating_sub(local_fee),
            to_remote_sat: (state.to_remote_msat / 1000).saturating_sub(remote_fee),
        };
        debug!(
            "Channel {} agreed on closing fee {} sat",
            state.id, their_fee
        );
        state.pending_broadcast = Some(PendingBroadcast::Closing(closing));
        Ok(())
    }

    /// Decide to broadcast our latest commitment transaction.
    fn force_close(&self, draft: &mut Draft) -> ProcessingChannelResult {
        let state = &mut draft.state;
        if state.state == ChannelState::ForceClosing && state.force_close_txid.is_none() {
            // The previous broadcast failed; committing again retries the stored one.
            return Ok(());
        }
        if state.state.is_closed() {
            return Err(ProcessingChannelError::ChannelClosed);
        }
        let funding = state
            .funding_outpoint()
            .ok_or(ProcessingChannelError::NoFundingTransaction)?;
        let to_self_delay = state
            .remote_params
            .as_ref()
            .map(|params| params.to_self_delay)
            .unwrap_or(state.local_params.to_self_delay);
        let commitment = CommitmentBroadcast {
            channel_id: state.id,
            funding,
            commitment_number: state.commitment_numbers.get_local(),
            to_local_sat: state.to_local_msat / 1000,
            to_remote_sat: state.to_remote_msat / 1000,
            to_self_delay,
        };
        state.pending_broadcast = Some(PendingBroadcast::Commitment(commitment));
        state.state = ChannelState::ForceClosing;
        Ok(())
    }

    fn handle_force_close_command(&self, draft: &mut Draft) -> ProcessingChannelResult {
        self.force_close(draft)?;
        let message = ErrorMessage::new(draft.state.id, "channel force closed");
        draft.send(LightningMessage::Error(message));
        Ok(())
    }

    /// The peer broke the protocol: tell it with an `error` and tear the channel down,
    /// on chain when there is a funding transaction to enforce.
    async fn fail_channel(&self, state: &mut ChannelActorState, reason: ProcessingChannelError) {
        error!(
            "Failing channel {} with {}: {}",
            state.id, self.remote_pubkey, reason
        );
        let mut draft = Draft::new(state);
        let result = if draft.state.state.is_closed() {
            Ok(())
        } else if draft.state.funding_outpoint().is_some() && draft.state.state.is_funded() {
            self.force_close(&mut draft)
        } else {
            draft.state.state = ChannelState::Closed(CloseFlags::FUNDING_ABORTED);
            Ok(())
        };
        let message = ErrorMessage::new(draft.state.id, &reason.to_string());
        draft.send(LightningMessage::Error(message));
        if let Err(err) = self.finish(state, draft, result).await {
            error!("Failed to tear down channel {}: {}", state.id, err);
        }
    }

    fn handle_error_message(
        &self,
        draft: &mut Draft,
        error: ErrorMessage,
    ) -> ProcessingChannelResult {
        error!(
            "Peer {} sent error for channel {}: {}",
            self.remote_pubkey,
            error.channel_id,
            String::from_utf8_lossy(&error.data)
        );
        if draft.state.state.is_closed() {
            return Ok(());
        }
        if draft.state.funding_outpoint().is_some() && draft.state.state.is_funded() {
            self.force_close(draft)?;
        } else {
            draft.state.state = ChannelState::Closed(CloseFlags::FUNDING_ABORTED);
        }
        Ok(())
    }

    fn handle_reestablish_command(&self, draft: &mut Draft) -> ProcessingChannelResult {
        if draft.state.state.is_closed() {
            return Err(ProcessingChannelError::ChannelNotReestablishable);
        }
        if !draft.state.reestablish_sent {
            let message = draft.state.create_reestablish_message();
            draft.state.reestablish_sent = true;
            draft.send(LightningMessage::ChannelReestablish(message));
        }
        Ok(())
    }

    fn handle_channel_reestablish(
        &self,
        draft: &mut Draft,
        reestablish: ChannelReestablish,
    ) -> ProcessingChannelResult {
        if draft.state.state.is_closed() {
            return Err(ProcessingChannelError::ChannelNotReestablishable);
        }
        self.handle_reestablish_command(draft)?;

        let retransmit = match draft.state.check_reestablish(&reestablish) {
            ReestablishAction::Desync(reason) => {
                error!(
                    "Channel {} can not be reestablished with {}: {}",
                    draft.state.id, self.remote_pubkey, reason
                );
                if draft.state.funding_txid.is_some() && draft.state.state.is_funded() {
                    draft.effects.disconnect = true;
                } else {
                    draft.state.state = ChannelState::Error;
                    let message = ErrorMessage::new(draft.state.id, &reason);
                    draft.send(LightningMessage::Error(message));
                }
                return Ok(());
            }
            ReestablishAction::Resume => None,
            ReestablishAction::Retransmit {
                commitment_signed,
                revoke_and_ack,
            } => Some((commitment_signed, revoke_and_ack)),
        };

        let state = &draft.state;
        let numbers = state.commitment_numbers;
        let mut messages = vec![];
        if numbers.get_local() == 0
            && numbers.get_remote() == 0
            && state.short_channel_id.is_some()
            && matches!(
                state.state,
                ChannelState::ChannelReady(_) | ChannelState::Normal | ChannelState::Offline
            )
            && !matches!(state.state, ChannelState::ChannelReady(flags) if !flags.contains(ChannelReadyFlags::OUR_CHANNEL_READY))
        {
            messages.push(channel_ready_message(state));
        }
        if let Some((commitment_signed, revoke_and_ack)) = retransmit {
            let decode_stored = |bytes: &Vec<u8>| {
                super::wire::decode(bytes).map_err(|err| {
                    ProcessingChannelError::InternalError(format!(
                        "stored message is undecodable: {}",
                        err
                    ))
                })
            };
            let mut commitment = vec![];
            if commitment_signed {
                for bytes in state.last_commitment_signed.iter().flatten() {
                    commitment.push(decode_stored(bytes)?);
                }
            }
            let mut revocation = vec![];
            if revoke_and_ack {
                if let Some(bytes) = &state.last_revoke_and_ack {
                    revocation.push(decode_stored(bytes)?);
                }
            }
            info!(
                "Retransmitting {} commitment and {} revocation messages for channel {}",
                commitment.len(),
                revocation.len(),
                state.id
            );
            if state.cs_sent_after_raa {
                messages.extend(revocation);
                messages.extend(commitment);
            } else {
                messages.extend(commitment);
                messages.extend(revocation);
            }
        }
        if let ChannelState::ClosingNegotiation(flags) = state.state {
            if let Some(script) = &state.local_shutdown_script {
                messages.push(LightningMessage::Shutdown(Shutdown {
                    channel_id: state.id,
                    scriptpubkey: script.clone(),
                    tlvs: TlvStream::new(),
                }));
            }
            if flags.contains(ClosingFlags::CLOSING_SIGNED_SENT) {
                if let Some(fee) = state.last_closing_fee_sent {
                    messages.push(closing_signed_message(state, fee));
                }
            }
        }
        for message in messages {
            draft.send(message);
        }

        if draft.state.state == ChannelState::Offline {
            draft.state.state = ChannelState::Normal;
        }
        Ok(())
    }

    async fn handle_event(&self, draft: &mut Draft, event: ChannelEvent) -> ProcessingChannelResult {
        match event {
            ChannelEvent::FundingConfirmed(short_channel_id) => {
                let state = &mut draft.state;
                let flags = match state.state {
                    ChannelState::FundingSigned(FundingFlags::AWAITING_CONFIRMATION) => {
                        ChannelReadyFlags::empty()
                    }
                    ChannelState::ChannelReady(flags)
                        if !flags.contains(ChannelReadyFlags::OUR_CHANNEL_READY) =>
                    {
                        flags
                    }
                    s => {
                        return Err(ProcessingChannelError::InvalidState(format!(
                            "unexpected funding confirmation in state {}",
                            s
                        )))
                    }
                };
                info!(
                    "Funding of channel {} confirmed at {}",
                    state.id, short_channel_id
                );
                state.short_channel_id = Some(short_channel_id);
                let flags = flags | ChannelReadyFlags::OUR_CHANNEL_READY;
                state.state = if flags.contains(ChannelReadyFlags::CHANNEL_READY) {
                    ChannelState::Normal
                } else {
                    ChannelState::ChannelReady(flags)
                };
                let message = channel_ready_message(state);
                draft.send(message);
            }
            ChannelEvent::ClosingConfirmed(txid) => {
                let state = &mut draft.state;
                if state.force_close_txid == Some(txid) {
                    state.state = ChannelState::Closed(CloseFlags::UNCOOPERATIVE_LOCAL);
                } else if state.closing_txid == Some(txid) {
                    state.state = ChannelState::Closed(CloseFlags::COOPERATIVE);
                } else if state.state.is_funded() {
                    warn!(
                        "Unknown transaction {} closed channel {}, assuming a remote commitment",
                        txid, state.id
                    );
                    state.state = ChannelState::Closed(CloseFlags::UNCOOPERATIVE_REMOTE);
                } else {
                    return Err(ProcessingChannelError::InvalidState(format!(
                        "closing confirmation for unfunded channel {}",
                        state.id
                    )));
                }
            }
            ChannelEvent::PeerDisconnected => {
                let state = &mut draft.state;
                debug!("Peer of channel {} disconnected", state.id);
                state.reestablish_sent = false;
                state.tlc_state.drop_unsigned_remote_updates();
                if !state.is_funder {
                    state.pending_feerate = None;
                }
                match state.state {
                    ChannelState::Normal | ChannelState::Quiescent(_) => {
                        state.state = ChannelState::Offline;
                    }
                    s if !s.is_funded() => {
                        state.state = ChannelState::Closed(CloseFlags::FUNDING_ABORTED);
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    async fn reply<T: Send>(
        &self,
        state: &mut ChannelActorState,
        draft: Draft,
        result: Result<T, ProcessingChannelError>,
        reply: ChannelCommandReply<T>,
    ) {
        let result = self.finish(state, draft, result).await;
        if let Err(err) = &result {
            debug!("Channel {} command failed: {}", state.id, err);
        }
        // The caller may have given up waiting.
        let _ = reply.send(result);
    }

    async fn handle_command(&self, state: &mut ChannelActorState, command: ChannelCommand) {
        trace!("Channel {} handling command {}", state.id, command.as_ref());
        let mut draft = Draft::new(state);
        match command {
            ChannelCommand::AddHtlc(command, reply) => {
                let result = self.handle_add_htlc_command(&mut draft, command);
                self.reply(state, draft, result, reply).await;
            }
            ChannelCommand::FulfillHtlc(tlc_id, preimage, reply) => {
                let reason = RemoveTlcReason::Fulfill { preimage };
                let result = self.handle_remove_htlc_command(&mut draft, tlc_id, reason);
                self.reply(state, draft, result, reply).await;
            }
            ChannelCommand::FailHtlc(tlc_id, reason, reply) => {
                let reason = RemoveTlcReason::Fail { reason };
                let result = self.handle_remove_htlc_command(&mut draft, tlc_id, reason);
                self.reply(state, draft, result, reply).await;
            }
            ChannelCommand::FailMalformedHtlc(tlc_id, sha256_of_onion, failure_code, reply) => {
                let reason = RemoveTlcReason::FailMalformed {
                    sha256_of_onion,
                    failure_code,
                };
                let result = self.handle_remove_htlc_command(&mut draft, tlc_id, reason);
                self.reply(state, draft, result, reply).await;
            }
            ChannelCommand::CommitmentSigned() => {
                if draft.state.tlc_state.need_another_commitment_signed()
                    && check_state_for_local_update(&draft.state).is_ok()
                {
                    let result = send_commitment_signed(&mut draft);
                    if let Err(err) = self.finish(state, draft, result).await {
                        error!("Failed to send commitment_signed: {}", err);
                    }
                }
            }
            ChannelCommand::EnterQuiescence(reply) => {
                let result = self.handle_enter_quiescence(&mut draft);
                self.reply(state, draft, result, reply).await;
            }
            ChannelCommand::ExitQuiescence(reply) => {
                let result = self.handle_exit_quiescence(&mut draft);
                self.reply(state, draft, result, reply).await;
            }
            ChannelCommand::Shutdown(command, reply) => {
                let result = self.handle_shutdown_command(&mut draft, command);
                self.reply(state, draft, result, reply).await;
            }
            ChannelCommand::ForceClose(reply) => {
                let result = self.handle_force_close_command(&mut draft);
                let result = self.finish(state, draft, result).await.and_then(|()| {
                    state.force_close_txid.ok_or_else(|| {
                        ProcessingChannelError::InternalError(
                            "commitment broadcast left no txid".to_string(),
                        )
                    })
                });
                if let Err(err) = &result {
                    debug!("Channel {} command failed: {}", state.id, err);
                }
                let _ = reply.send(result);
            }
            ChannelCommand::Reestablish(reply) => {
                let result = self.handle_reestablish_command(&mut draft);
                self.reply(state, draft, result, reply).await;
            }
            ChannelCommand::UpdateFee(feerate_per_kw, reply) => {
                let result = self.handle_update_fee_command(&mut draft, feerate_per_kw);
                self.reply(state, draft, result, reply).await;
            }
            ChannelCommand::GetState(reply) => {
                let _ = reply.send(draft.state);
            }
        }
    }
}

#[async_trait]
impl<S> Actor for ChannelActor<S>
where
    S: ChannelStore + ChannelSeedStore + InvoiceStore + PreimageStore + Send + Sync + 'static,
{
    type Msg = ChannelActorMessage;
    type State = ChannelActorState;
    type Arguments = ChannelInitializationOperation;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let mut effects = Effects::default();
        let state = match args {
            ChannelInitializationOperation::OpenChannel(OpenChannelParameter {
                temporary_channel_id,
                funding_satoshis,
                push_msat,
                feerate_per_kw,
                to_self_delay,
                limits,
                seed,
            }) => {
                validate_open_params(
                    &limits,
                    funding_satoshis,
                    push_msat,
                    default_channel_reserve(funding_satoshis, limits.dust_limit_sat),
                    to_self_delay,
                )?;
                debug!(
                    "Opening channel {} of {} sat to peer {}",
                    temporary_channel_id, funding_satoshis, self.remote_pubkey
                );
                self.store.save_channel_seed(&temporary_channel_id, seed)?;
                let state = ChannelActorState::new_outbound_channel(
                    temporary_channel_id,
                    self.local_pubkey,
                    self.remote_pubkey,
                    &seed,
                    funding_satoshis,
                    push_msat,
                    feerate_per_kw,
                    to_self_delay,
                    &limits,
                )?;
                let local = &state.local_params;
                effects
                    .messages
                    .push(LightningMessage::OpenChannel(OpenChannel {
                        chain_hash: get_chain_hash(),
                        temporary_channel_id,
                        funding_satoshis,
                        push_msat,
                        dust_limit_satoshis: local.dust_limit_sat,
                        max_htlc_value_in_flight_msat: local.max_htlc_value_in_flight_msat,
                        channel_reserve_satoshis: local.channel_reserve_sat,
                        htlc_minimum_msat: local.htlc_minimum_msat,
                        feerate_per_kw,
                        to_self_delay: local.to_self_delay,
                        max_accepted_htlcs: local.max_accepted_htlcs,
                        basepoints: local.basepoints,
                        channel_flags: 0,
                        tlvs: TlvStream::new(),
                    }));
                state
            }
            ChannelInitializationOperation::AcceptChannel(AcceptChannelParameter {
                open_channel,
                to_self_delay,
                limits,
                seed,
            }) => {
                if open_channel.chain_hash != get_chain_hash() {
                    return Err(Box::new(ProcessingChannelError::InvalidChannelParameters(
                        format!("unknown chain hash {}", open_channel.chain_hash),
                    )));
                }
                validate_open_params(
                    &limits,
                    open_channel.funding_satoshis,
                    open_channel.push_msat,
                    open_channel.channel_reserve_satoshis,
                    open_channel.to_self_delay,
                )?;
                debug!(
                    "Accepting channel {} of {} sat from peer {}",
                    open_channel.temporary_channel_id,
                    open_channel.funding_satoshis,
                    self.remote_pubkey
                );
                self.store
                    .save_channel_seed(&open_channel.temporary_channel_id, seed)?;
                let state = ChannelActorState::new_inbound_channel(
                    &open_channel,
                    self.local_pubkey,
                    self.remote_pubkey,
                    &seed,
                    to_self_delay,
                    &limits,
                )?;
                let local = &state.local_params;
                effects
                    .messages
                    .push(LightningMessage::AcceptChannel(AcceptChannel {
                        temporary_channel_id: open_channel.temporary_channel_id,
                        dust_limit_satoshis: local.dust_limit_sat,
                        max_htlc_value_in_flight_msat: local.max_htlc_value_in_flight_msat,
                        channel_reserve_satoshis: local.channel_reserve_sat,
                        htlc_minimum_msat: local.htlc_minimum_msat,
                        minimum_depth: 1,
                        to_self_delay: local.to_self_delay,
                        max_accepted_htlcs: local.max_accepted_htlcs,
                        basepoints: local.basepoints,
                        tlvs: TlvStream::new(),
                    }));
                state
            }
            ChannelInitializationOperation::Restore(channel_id) => {
                let state = self
                    .store
                    .find_channel_by_id(&channel_id)?
                    .ok_or(ProcessingChannelError::ChannelNotFound(channel_id))?;
                debug!("Restored channel {} in state {}", channel_id, state.state);
                state
            }
        };

        self.store.save_channel(&state)?;
        self.registry.insert(
            state.id,
            ChannelEntry {
                peer: self.remote_pubkey,
                actor: myself,
            },
        );
        self.events.emit(WalletEvent::ChannelStateChanged {
            channel_id: state.id,
            peer: self.remote_pubkey,
            state: state.state,
        });
        self.flush(effects).await;
        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ChannelActorMessage::PeerMessage(message) => {
                let mut draft = Draft::new(state);
                let result = self.handle_peer_message(&mut draft, message).await;
                match self.finish(state, draft, result).await {
                    Ok(()) => {}
                    Err(error) if error.is_protocol_violation() => {
                        self.fail_channel(state, error).await;
                    }
                    Err(error) => {
                        error!("Error while processing channel message: {}", error);
                        let warning = Warning {
                            channel_id: state.id,
                            data: error.to_string().into_bytes(),
                            tlvs: TlvStream::new(),
                        };
                        if let Err(err) = self
                            .sink
                            .send_message(&self.remote_pubkey, LightningMessage::Warning(warning))
                            .await
                        {
                            debug!("Failed to send warning to {}: {}", self.remote_pubkey, err);
                        }
                    }
                }
            }
            ChannelActorMessage::Command(command) => self.handle_command(state, command).await,
            ChannelActorMessage::Event(event) => {
                let mut draft = Draft::new(state);
                let result = self.handle_event(&mut draft, event).await;
                if let Err(err) = self.finish(state, draft, result).await {
                    error!("Error while processing channel event: {}", err);
                }
            }
        }

        if let ChannelState::Closed(flags) = state.state {
            debug!("Channel {} is closed ({:?}), stopping its actor", state.id, flags);
            myself.stop(Some("channel closed".to_string()));
        }
        Ok(())
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if state.pending_broadcast.is_some() {
            info!("Retrying the pending broadcast of channel {}", state.id);
            if let Err(err) = self.broadcast_pending(state).await {
                error!(
                    "Pending broadcast of channel {} failed again: {}",
                    state.id, err
                );
            }
            if let ChannelState::Closed(_) = state.state {
                myself.stop(Some("channel closed".to_string()));
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        self.registry.remove(&state.id);
        Ok(())
    }
}

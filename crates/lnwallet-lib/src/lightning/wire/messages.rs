use super::tlv::{
    ChannelOpeningTlv, ChannelReadyTlv, ChannelReestablishTlv, ClosingSignedTlv, ExtensionTlv,
    InitTlv, TlvStream, UpdateAddHtlcTlv,
};
use super::{DecodeError, Reader, WireMessage, WriteExt};
use crate::lightning::types::{Hash256, Pubkey, ShortChannelId, Signature64};

/// Size of the sphinx packet carried by `update_add_htlc`.
pub const ONION_PACKET_SIZE: usize = 1366;

#[derive(Clone, PartialEq, Eq)]
pub struct OnionPacket(Vec<u8>);

impl std::fmt::Debug for OnionPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OnionPacket({}..)", hex::encode(&self.0[..4]))
    }
}

impl OnionPacket {
    pub fn new(bytes: Vec<u8>) -> Option<Self> {
        (bytes.len() == ONION_PACKET_SIZE).then_some(OnionPacket(bytes))
    }

    pub fn blank() -> Self {
        OnionPacket(vec![0u8; ONION_PACKET_SIZE])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Init {
    pub global_features: Vec<u8>,
    pub features: Vec<u8>,
    pub tlvs: TlvStream<InitTlv>,
}

impl WireMessage for Init {
    fn write(&self, w: &mut Vec<u8>) {
        w.put_var_bytes(&self.global_features);
        w.put_var_bytes(&self.features);
        self.tlvs.write(w);
    }

    fn read(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            global_features: r.read_var_bytes()?,
            features: r.read_var_bytes()?,
            tlvs: TlvStream::read(r)?,
        })
    }
}

/// `error`. An all zero channel id refers to every channel with the peer.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorMessage {
    pub channel_id: Hash256,
    pub data: Vec<u8>,
    pub tlvs: TlvStream<ExtensionTlv>,
}

impl ErrorMessage {
    pub fn new(channel_id: Hash256, text: &str) -> Self {
        Self {
            channel_id,
            data: text.as_bytes().to_vec(),
            tlvs: TlvStream::new(),
        }
    }
}

impl WireMessage for ErrorMessage {
    fn write(&self, w: &mut Vec<u8>) {
        w.put_slice(self.channel_id.as_ref());
        w.put_var_bytes(&self.data);
        self.tlvs.write(w);
    }

    fn read(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            channel_id: r.read_hash()?,
            data: r.read_var_bytes()?,
            tlvs: TlvStream::read(r)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Warning {
    pub channel_id: Hash256,
    pub data: Vec<u8>,
    pub tlvs: TlvStream<ExtensionTlv>,
}

impl WireMessage for Warning {
    fn write(&self, w: &mut Vec<u8>) {
        w.put_slice(self.channel_id.as_ref());
        w.put_var_bytes(&self.data);
        self.tlvs.write(w);
    }

    fn read(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            channel_id: r.read_hash()?,
            data: r.read_var_bytes()?,
            tlvs: TlvStream::read(r)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Ping {
    pub num_pong_bytes: u16,
    pub ignored: Vec<u8>,
    pub tlvs: TlvStream<ExtensionTlv>,
}

impl Ping {
    pub fn new(num_pong_bytes: u16) -> Self {
        Self {
            num_pong_bytes,
            ignored: Vec::new(),
            tlvs: TlvStream::new(),
        }
    }
}

impl WireMessage for Ping {
    fn write(&self, w: &mut Vec<u8>) {
        w.put_u16(self.num_pong_bytes);
        w.put_var_bytes(&self.ignored);
        self.tlvs.write(w);
    }

    fn read(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            num_pong_bytes: r.read_u16()?,
            ignored: r.read_var_bytes()?,
            tlvs: TlvStream::read(r)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Pong {
    pub ignored: Vec<u8>,
    pub tlvs: TlvStream<ExtensionTlv>,
}

/// Largest `num_pong_bytes` a ping can be answered to: the pong's type and length
/// prefix take the rest of a maximum size message.
pub const MAX_PONG_BYTES: u16 = 65531;

impl Pong {
    /// The pong for `ping`, if it asks for one that fits in a message.
    pub fn answering(ping: &Ping) -> Option<Self> {
        (ping.num_pong_bytes <= MAX_PONG_BYTES).then(|| Self {
            ignored: vec![0u8; ping.num_pong_bytes as usize],
            tlvs: TlvStream::new(),
        })
    }
}

impl WireMessage for Pong {
    fn write(&self, w: &mut Vec<u8>) {
        w.put_var_bytes(&self.ignored);
        self.tlvs.write(w);
    }

    fn read(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            ignored: r.read_var_bytes()?,
            tlvs: TlvStream::read(r)?,
        })
    }
}

/// Quiescence request (`stfu`).
#[derive(Clone, Debug, PartialEq)]
pub struct Stfu {
    pub channel_id: Hash256,
    pub initiator: bool,
    pub tlvs: TlvStream<ExtensionTlv>,
}

impl WireMessage for Stfu {
    fn write(&self, w: &mut Vec<u8>) {
        w.put_slice(self.channel_id.as_ref());
        w.put_u8(self.initiator as u8);
        self.tlvs.write(w);
    }

    fn read(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            channel_id: r.read_hash()?,
            initiator: r.read_u8()? != 0,
            tlvs: TlvStream::read(r)?,
        })
    }
}

/// The six keys each side contributes while opening a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChannelBasepoints {
    pub funding_pubkey: Pubkey,
    pub revocation_basepoint: Pubkey,
    pub payment_basepoint: Pubkey,
    pub delayed_payment_basepoint: Pubkey,
    pub htlc_basepoint: Pubkey,
    pub first_per_commitment_point: Pubkey,
}

impl ChannelBasepoints {
    fn write(&self, w: &mut Vec<u8>) {
        for key in [
            &self.funding_pubkey,
            &self.revocation_basepoint,
            &self.payment_basepoint,
            &self.delayed_payment_basepoint,
            &self.htlc_basepoint,
            &self.first_per_commitment_point,
        ] {
            w.put_slice(&key.serialize());
        }
    }

    fn read(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            funding_pubkey: r.read_pubkey()?,
            revocation_basepoint: r.read_pubkey()?,
            payment_basepoint: r.read_pubkey()?,
            delayed_payment_basepoint: r.read_pubkey()?,
            htlc_basepoint: r.read_pubkey()?,
            first_per_commitment_point: r.read_pubkey()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OpenChannel {
    pub chain_hash: Hash256,
    pub temporary_channel_id: Hash256,
    pub funding_satoshis: u64,
    pub push_msat: u64,
    pub dust_limit_satoshis: u64,
    pub max_htlc_value_in_flight_msat: u64,
    pub channel_reserve_satoshis: u64,
    pub htlc_minimum_msat: u64,
    pub feerate_per_kw: u32,
    pub to_self_delay: u16,
    pub max_accepted_htlcs: u16,
    pub basepoints: ChannelBasepoints,
    pub channel_flags: u8,
    pub tlvs: TlvStream<ChannelOpeningTlv>,
}

impl WireMessage for OpenChannel {
    fn write(&self, w: &mut Vec<u8>) {
        w.put_slice(self.chain_hash.as_ref());
        w.put_slice(self.temporary_channel_id.as_ref());
        w.put_u64(self.funding_satoshis);
        w.put_u64(self.push_msat);
        w.put_u64(self.dust_limit_satoshis);
        w.put_u64(self.max_htlc_value_in_flight_msat);
        w.put_u64(self.channel_reserve_satoshis);
        w.put_u64(self.htlc_minimum_msat);
        w.put_u32(self.feerate_per_kw);
        w.put_u16(self.to_self_delay);
        w.put_u16(self.max_accepted_htlcs);
        self.basepoints.write(w);
        w.put_u8(self.channel_flags);
        self.tlvs.write(w);
    }

    fn read(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            chain_hash: r.read_hash()?,
            temporary_channel_id: r.read_hash()?,
            funding_satoshis: r.read_u64()?,
            push_msat: r.read_u64()?,
            dust_limit_satoshis: r.read_u64()?,
            max_htlc_value_in_flight_msat: r.read_u64()?,
            channel_reserve_satoshis: r.read_u64()?,
            htlc_minimum_msat: r.read_u64()?,
            feerate_per_kw: r.read_u32()?,
            to_self_delay: r.read_u16()?,
            max_accepted_htlcs: r.read_u16()?,
            basepoints: ChannelBasepoints::read(r)?,
            channel_flags: r.read_u8()?,
            tlvs: TlvStream::read(r)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AcceptChannel {
    pub temporary_channel_id: Hash256,
    pub dust_limit_satoshis: u64,
    pub max_htlc_value_in_flight_msat: u64,
    pub channel_reserve_satoshis: u64,
    pub htlc_minimum_msat: u64,
    pub minimum_depth: u32,
    pub to_self_delay: u16,
    pub max_accepted_htlcs: u16,
    pub basepoints: ChannelBasepoints,
    pub tlvs: TlvStream<ChannelOpeningTlv>,
}

impl WireMessage for AcceptChannel {
    fn write(&self, w: &mut Vec<u8>) {
        w.put_slice(self.temporary_channel_id.as_ref());
        w.put_u64(self.dust_limit_satoshis);
        w.put_u64(self.max_htlc_value_in_flight_msat);
        w.put_u64(self.channel_reserve_satoshis);
        w.put_u64(self.htlc_minimum_msat);
        w.put_u32(self.minimum_depth);
        w.put_u16(self.to_self_delay);
        w.put_u16(self.max_accepted_htlcs);
        self.basepoints.write(w);
        self.tlvs.write(w);
    }

    fn read(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            temporary_channel_id: r.read_hash()?,
            dust_limit_satoshis: r.read_u64()?,
            max_htlc_value_in_flight_msat: r.read_u64()?,
            channel_reserve_satoshis: r.read_u64()?,
            htlc_minimum_msat: r.read_u64()?,
            minimum_depth: r.read_u32()?,
            to_self_delay: r.read_u16()?,
            max_accepted_htlcs: r.read_u16()?,
            basepoints: ChannelBasepoints::read(r)?,
            tlvs: TlvStream::read(r)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FundingCreated {
    pub temporary_channel_id: Hash256,
    pub funding_txid: Hash256,
    pub funding_output_index: u16,
    pub signature: Signature64,
    pub tlvs: TlvStream<ExtensionTlv>,
}

impl WireMessage for FundingCreated {
    fn write(&self, w: &mut Vec<u8>) {
        w.put_slice(self.temporary_channel_id.as_ref());
        w.put_slice(self.funding_txid.as_ref());
        w.put_u16(self.funding_output_index);
        w.put_slice(&self.signature.0);
        self.tlvs.write(w);
    }

    fn read(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            temporary_channel_id: r.read_hash()?,
            funding_txid: r.read_hash()?,
            funding_output_index: r.read_u16()?,
            signature: r.read_signature()?,
            tlvs: TlvStream::read(r)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FundingSigned {
    pub channel_id: Hash256,
    pub signature: Signature64,
    pub tlvs: TlvStream<ExtensionTlv>,
}

impl WireMessage for FundingSigned {
    fn write(&self, w: &mut Vec<u8>) {
        w.put_slice(self.channel_id.as_ref());
        w.put_slice(&self.signature.0);
        self.tlvs.write(w);
    }

    fn read(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            channel_id: r.read_hash()?,
            signature: r.read_signature()?,
            tlvs: TlvStream::read(r)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChannelReady {
    pub channel_id: Hash256,
    pub second_per_commitment_point: Pubkey,
    pub tlvs: TlvStream<ChannelReadyTlv>,
}

impl WireMessage for ChannelReady {
    fn write(&self, w: &mut Vec<u8>) {
        w.put_slice(self.channel_id.as_ref());
        w.put_slice(&self.second_per_commitment_point.serialize());
        self.tlvs.write(w);
    }

    fn read(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            channel_id: r.read_hash()?,
            second_per_commitment_point: r.read_pubkey()?,
            tlvs: TlvStream::read(r)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Shutdown {
    pub channel_id: Hash256,
    pub scriptpubkey: Vec<u8>,
    pub tlvs: TlvStream<ExtensionTlv>,
}

impl WireMessage for Shutdown {
    fn write(&self, w: &mut Vec<u8>) {
        w.put_slice(self.channel_id.as_ref());
        w.put_var_bytes(&self.scriptpubkey);
        self.tlvs.write(w);
    }

    fn read(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            channel_id: r.read_hash()?,
            scriptpubkey: r.read_var_bytes()?,
            tlvs: TlvStream::read(r)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClosingSigned {
    pub channel_id: Hash256,
    pub fee_satoshis: u64,
    pub signature: Signature64,
    pub tlvs: TlvStream<ClosingSignedTlv>,
}

impl WireMessage for ClosingSigned {
    fn write(&self, w: &mut Vec<u8>) {
        w.put_slice(self.channel_id.as_ref());
        w.put_u64(self.fee_satoshis);
        w.put_slice(&self.signature.0);
        self.tlvs.write(w);
    }

    fn read(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            channel_id: r.read_hash()?,
            fee_satoshis: r.read_u64()?,
            signature: r.read_signature()?,
            tlvs: TlvStream::read(r)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UpdateAddHtlc {
    pub channel_id: Hash256,
    pub id: u64,
    pub amount_msat: u64,
    pub payment_hash: Hash256,
    pub cltv_expiry: u32,
    pub onion_routing_packet: OnionPacket,
    pub tlvs: TlvStream<UpdateAddHtlcTlv>,
}

impl WireMessage for UpdateAddHtlc {
    fn write(&self, w: &mut Vec<u8>) {
        w.put_slice(self.channel_id.as_ref());
        w.put_u64(self.id);
        w.put_u64(self.amount_msat);
        w.put_slice(self.payment_hash.as_ref());
        w.put_u32(self.cltv_expiry);
        w.put_slice(self.onion_routing_packet.as_bytes());
        self.tlvs.write(w);
    }

    fn read(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            channel_id: r.read_hash()?,
            id: r.read_u64()?,
            amount_msat: r.read_u64()?,
            payment_hash: r.read_hash()?,
            cltv_expiry: r.read_u32()?,
            onion_routing_packet: OnionPacket(r.read_bytes(ONION_PACKET_SIZE)?.to_vec()),
            tlvs: TlvStream::read(r)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UpdateFulfillHtlc {
    pub channel_id: Hash256,
    pub id: u64,
    pub payment_preimage: Hash256,
    pub tlvs: TlvStream<ExtensionTlv>,
}

impl WireMessage for UpdateFulfillHtlc {
    fn write(&self, w: &mut Vec<u8>) {
        w.put_slice(self.channel_id.as_ref());
        w.put_u64(self.id);
        w.put_slice(self.payment_preimage.as_ref());
        self.tlvs.write(w);
    }

    fn read(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            channel_id: r.read_hash()?,
            id: r.read_u64()?,
            payment_preimage: r.read_hash()?,
            tlvs: TlvStream::read(r)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UpdateFailHtlc {
    pub channel_id: Hash256,
    pub id: u64,
    pub reason: Vec<u8>,
    pub tlvs: TlvStream<ExtensionTlv>,
}

impl WireMessage for UpdateFailHtlc {
    fn write(&self, w: &mut Vec<u8>) {
        w.put_slice(self.channel_id.as_ref());
        w.put_u64(self.id);
        w.put_var_bytes(&self.reason);
        self.tlvs.write(w);
    }

    fn read(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            channel_id: r.read_hash()?,
            id: r.read_u64()?,
            reason: r.read_var_bytes()?,
            tlvs: TlvStream::read(r)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UpdateFailMalformedHtlc {
    pub channel_id: Hash256,
    pub id: u64,
    pub sha256_of_onion: Hash256,
    pub failure_code: u16,
    pub tlvs: TlvStream<ExtensionTlv>,
}

impl WireMessage for UpdateFailMalformedHtlc {
    fn write(&self, w: &mut Vec<u8>) {
        w.put_slice(self.channel_id.as_ref());
        w.put_u64(self.id);
        w.put_slice(self.sha256_of_onion.as_ref());
        w.put_u16(self.failure_code);
        self.tlvs.write(w);
    }

    fn read(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            channel_id: r.read_hash()?,
            id: r.read_u64()?,
            sha256_of_onion: r.read_hash()?,
            failure_code: r.read_u16()?,
            tlvs: TlvStream::read(r)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommitmentSigned {
    pub channel_id: Hash256,
    pub signature: Signature64,
    pub htlc_signatures: Vec<Signature64>,
    pub tlvs: TlvStream<ExtensionTlv>,
}

impl WireMessage for CommitmentSigned {
    fn write(&self, w: &mut Vec<u8>) {
        w.put_slice(self.channel_id.as_ref());
        w.put_slice(&self.signature.0);
        let count = u16::try_from(self.htlc_signatures.len()).unwrap_or(u16::MAX);
        w.put_u16(count);
        for sig in self.htlc_signatures.iter().take(usize::from(count)) {
            w.put_slice(&sig.0);
        }
        self.tlvs.write(w);
    }

    fn read(r: &mut Reader) -> Result<Self, DecodeError> {
        let channel_id = r.read_hash()?;
        let signature = r.read_signature()?;
        let num_htlcs = r.read_u16()? as usize;
        if num_htlcs * 64 > r.remaining() {
            return Err(DecodeError::InvalidLength {
                declared: num_htlcs as u64 * 64,
                remaining: r.remaining(),
            });
        }
        let htlc_signatures = (0..num_htlcs)
            .map(|_| r.read_signature())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            channel_id,
            signature,
            htlc_signatures,
            tlvs: TlvStream::read(r)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RevokeAndAck {
    pub channel_id: Hash256,
    pub per_commitment_secret: Hash256,
    pub next_per_commitment_point: Pubkey,
    pub tlvs: TlvStream<ExtensionTlv>,
}

impl WireMessage for RevokeAndAck {
    fn write(&self, w: &mut Vec<u8>) {
        w.put_slice(self.channel_id.as_ref());
        w.put_slice(self.per_commitment_secret.as_ref());
        w.put_slice(&self.next_per_commitment_point.serialize());
        self.tlvs.write(w);
    }

    fn read(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            channel_id: r.read_hash()?,
            per_commitment_secret: r.read_hash()?,
            next_per_commitment_point: r.read_pubkey()?,
            tlvs: TlvStream::read(r)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UpdateFee {
    pub channel_id: Hash256,
    pub feerate_per_kw: u32,
    pub tlvs: TlvStream<ExtensionTlv>,
}

impl WireMessage for UpdateFee {
    fn write(&self, w: &mut Vec<u8>) {
        w.put_slice(self.channel_id.as_ref());
        w.put_u32(self.feerate_per_kw);
        self.tlvs.write(w);
    }

    fn read(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            channel_id: r.read_hash()?,
            feerate_per_kw: r.read_u32()?,
            tlvs: TlvStream::read(r)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChannelReestablish {
    pub channel_id: Hash256,
    pub next_commitment_number: u64,
    pub next_revocation_number: u64,
    pub your_last_per_commitment_secret: Hash256,
    pub my_current_per_commitment_point: Pubkey,
    pub tlvs: TlvStream<ChannelReestablishTlv>,
}

impl WireMessage for ChannelReestablish {
    fn write(&self, w: &mut Vec<u8>) {
        w.put_slice(self.channel_id.as_ref());
        w.put_u64(self.next_commitment_number);
        w.put_u64(self.next_revocation_number);
        w.put_slice(self.your_last_per_commitment_secret.as_ref());
        w.put_slice(&self.my_current_per_commitment_point.serialize());
        self.tlvs.write(w);
    }

    fn read(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            channel_id: r.read_hash()?,
            next_commitment_number: r.read_u64()?,
            next_revocation_number: r.read_u64()?,
            your_last_per_commitment_secret: r.read_hash()?,
            my_current_per_commitment_point: r.read_pubkey()?,
            tlvs: TlvStream::read(r)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChannelAnnouncement {
    pub node_signature_1: Signature64,
    pub node_signature_2: Signature64,
    pub bitcoin_signature_1: Signature64,
    pub bitcoin_signature_2: Signature64,
    pub features: Vec<u8>,
    pub chain_hash: Hash256,
    pub short_channel_id: ShortChannelId,
    pub node_id_1: Pubkey,
    pub node_id_2: Pubkey,
    pub bitcoin_key_1: Pubkey,
    pub bitcoin_key_2: Pubkey,
    pub tlvs: TlvStream<ExtensionTlv>,
}

impl WireMessage for ChannelAnnouncement {
    fn write(&self, w: &mut Vec<u8>) {
        for sig in [
            &self.node_signature_1,
            &self.node_signature_2,
            &self.bitcoin_signature_1,
            &self.bitcoin_signature_2,
        ] {
            w.put_slice(&sig.0);
        }
        w.put_var_bytes(&self.features);
        w.put_slice(self.chain_hash.as_ref());
        w.put_u64(self.short_channel_id.0);
        for key in [
            &self.node_id_1,
            &self.node_id_2,
            &self.bitcoin_key_1,
            &self.bitcoin_key_2,
        ] {
            w.put_slice(&key.serialize());
        }
        self.tlvs.write(w);
    }

    fn read(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            node_signature_1: r.read_signature()?,
            node_signature_2: r.read_signature()?,
            bitcoin_signature_1: r.read_signature()?,
            bitcoin_signature_2: r.read_signature()?,
            features: r.read_var_bytes()?,
            chain_hash: r.read_hash()?,
            short_channel_id: ShortChannelId(r.read_u64()?),
            node_id_1: r.read_pubkey()?,
            node_id_2: r.read_pubkey()?,
            bitcoin_key_1: r.read_pubkey()?,
            bitcoin_key_2: r.read_pubkey()?,
            tlvs: TlvStream::read(r)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NodeAnnouncement {
    pub signature: Signature64,
    pub features: Vec<u8>,
    pub timestamp: u32,
    pub node_id: Pubkey,
    pub rgb_color: [u8; 3],
    pub alias: [u8; 32],
    pub addresses: Vec<u8>,
    pub tlvs: TlvStream<ExtensionTlv>,
}

impl WireMessage for NodeAnnouncement {
    fn write(&self, w: &mut Vec<u8>) {
        w.put_slice(&self.signature.0);
        w.put_var_bytes(&self.features);
        w.put_u32(self.timestamp);
        w.put_slice(&self.node_id.serialize());
        w.put_slice(&self.rgb_color);
        w.put_slice(&self.alias);
        w.put_var_bytes(&self.addresses);
        self.tlvs.write(w);
    }

    fn read(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            signature: r.read_signature()?,
            features: r.read_var_bytes()?,
            timestamp: r.read_u32()?,
            node_id: r.read_pubkey()?,
            rgb_color: r.read_array()?,
            alias: r.read_array()?,
            addresses: r.read_var_bytes()?,
            tlvs: TlvStream::read(r)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChannelUpdate {
    pub signature: Signature64,
    pub chain_hash: Hash256,
    pub short_channel_id: ShortChannelId,
    pub timestamp: u32,
    pub message_flags: u8,
    /// Bit 0 is the direction (0 when sent by `node_id_1`), bit 1 disables the channel.
    pub channel_flags: u8,
    pub cltv_expiry_delta: u16,
    pub htlc_minimum_msat: u64,
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
    pub htlc_maximum_msat: u64,
    pub tlvs: TlvStream<ExtensionTlv>,
}

impl ChannelUpdate {
    pub fn direction(&self) -> u8 {
        self.channel_flags & 1
    }

    pub fn is_disabled(&self) -> bool {
        self.channel_flags & 2 != 0
    }
}

impl WireMessage for ChannelUpdate {
    fn write(&self, w: &mut Vec<u8>) {
        w.put_slice(&self.signature.0);
        w.put_slice(self.chain_hash.as_ref());
        w.put_u64(self.short_channel_id.0);
        w.put_u32(self.timestamp);
        w.put_u8(self.message_flags);
        w.put_u8(self.channel_flags);
        w.put_u16(self.cltv_expiry_delta);
        w.put_u64(self.htlc_minimum_msat);
        w.put_u32(self.fee_base_msat);
        w.put_u32(self.fee_proportional_millionths);
        w.put_u64(self.htlc_maximum_msat);
        self.tlvs.write(w);
    }

    fn read(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            signature: r.read_signature()?,
            chain_hash: r.read_hash()?,
            short_channel_id: ShortChannelId(r.read_u64()?),
            timestamp: r.read_u32()?,
            message_flags: r.read_u8()?,
            channel_flags: r.read_u8()?,
            cltv_expiry_delta: r.read_u16()?,
            htlc_minimum_msat: r.read_u64()?,
            fee_base_msat: r.read_u32()?,
            fee_proportional_millionths: r.read_u32()?,
            htlc_maximum_msat: r.read_u64()?,
            tlvs: TlvStream::read(r)?,
        })
    }
}

//! BOLT 1 message codec.
//!
//! A message is a big-endian `u16` type followed by the type specific payload and an
//! optional TLV extension stream. Encoding is infallible for well formed messages,
//! decoding never panics on arbitrary input.

mod messages;
pub mod tlv;

pub use messages::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use super::types::{Hash256, Pubkey, Signature64};

/// Largest message (type included) the transport can carry.
pub const MAX_MESSAGE_SIZE: usize = 65535;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Truncated message: needed {needed} more bytes")]
    TruncatedMessage { needed: usize },
    #[error("Unknown mandatory tlv type {0}")]
    UnknownMandatoryTlv(u64),
    #[error("Declared length {declared} disagrees with the {remaining} remaining bytes")]
    InvalidLength { declared: u64, remaining: usize },
    #[error("Payload of {0} bytes exceeds the maximum message size")]
    PayloadTooLarge(usize),
    #[error("Tlv type {0} is not strictly increasing")]
    TlvOutOfOrder(u64),
    #[error("Invalid value for tlv type {0}")]
    InvalidTlvValue(u64),
    #[error("Non canonical bigsize encoding")]
    NonCanonicalBigSize,
    #[error("Invalid public key")]
    InvalidPubkey,
}

/// Cursor over a message being decoded.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::TruncatedMessage {
                needed: n - self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.read_bytes(N)?);
        Ok(array)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    pub fn read_hash(&mut self) -> Result<Hash256, DecodeError> {
        Ok(Hash256::from(self.read_array::<32>()?))
    }

    pub fn read_pubkey(&mut self) -> Result<Pubkey, DecodeError> {
        let bytes = self.read_array::<33>()?;
        Pubkey::from_slice(&bytes).map_err(|_| DecodeError::InvalidPubkey)
    }

    pub fn read_signature(&mut self) -> Result<Signature64, DecodeError> {
        Ok(Signature64(self.read_array()?))
    }

    /// A `u16` length prefixed byte string.
    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_u16()? as usize;
        if len > self.remaining() {
            return Err(DecodeError::InvalidLength {
                declared: len as u64,
                remaining: self.remaining(),
            });
        }
        Ok(self.read_bytes(len)?.to_vec())
    }
}

pub(crate) trait WriteExt {
    fn put_u8(&mut self, v: u8);
    fn put_u16(&mut self, v: u16);
    fn put_u32(&mut self, v: u32);
    fn put_u64(&mut self, v: u64);
    fn put_slice(&mut self, v: &[u8]);
    fn put_var_bytes(&mut self, v: &[u8]);
}

impl WriteExt for Vec<u8> {
    fn put_u8(&mut self, v: u8) {
        self.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_slice(&mut self, v: &[u8]) {
        self.extend_from_slice(v);
    }

    /// Longer input is cut at `u16::MAX` bytes so the prefix always matches the data; the
    /// resulting message is over [`MAX_MESSAGE_SIZE`] and refused by the transport.
    fn put_var_bytes(&mut self, v: &[u8]) {
        let len = u16::try_from(v.len()).unwrap_or(u16::MAX);
        self.put_u16(len);
        self.extend_from_slice(&v[..usize::from(len)]);
    }
}

/// A message payload with a fixed position in the BOLT message type space.
pub(crate) trait WireMessage: Sized {
    fn write(&self, w: &mut Vec<u8>);
    fn read(r: &mut Reader) -> Result<Self, DecodeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum MessageType {
    Warning = 1,
    Stfu = 2,
    Init = 16,
    Error = 17,
    Ping = 18,
    Pong = 19,
    OpenChannel = 32,
    AcceptChannel = 33,
    FundingCreated = 34,
    FundingSigned = 35,
    ChannelReady = 36,
    Shutdown = 38,
    ClosingSigned = 39,
    UpdateAddHtlc = 128,
    UpdateFulfillHtlc = 130,
    UpdateFailHtlc = 131,
    CommitmentSigned = 132,
    RevokeAndAck = 133,
    UpdateFee = 134,
    UpdateFailMalformedHtlc = 135,
    ChannelReestablish = 136,
    ChannelAnnouncement = 256,
    NodeAnnouncement = 257,
    ChannelUpdate = 258,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LightningMessage {
    Warning(Warning),
    Stfu(Stfu),
    Init(Init),
    Error(ErrorMessage),
    Ping(Ping),
    Pong(Pong),
    OpenChannel(OpenChannel),
    AcceptChannel(AcceptChannel),
    FundingCreated(FundingCreated),
    FundingSigned(FundingSigned),
    ChannelReady(ChannelReady),
    Shutdown(Shutdown),
    ClosingSigned(ClosingSigned),
    UpdateAddHtlc(UpdateAddHtlc),
    UpdateFulfillHtlc(UpdateFulfillHtlc),
    UpdateFailHtlc(UpdateFailHtlc),
    CommitmentSigned(CommitmentSigned),
    RevokeAndAck(RevokeAndAck),
    UpdateFee(UpdateFee),
    UpdateFailMalformedHtlc(UpdateFailMalformedHtlc),
    ChannelReestablish(ChannelReestablish),
    ChannelAnnouncement(ChannelAnnouncement),
    NodeAnnouncement(NodeAnnouncement),
    ChannelUpdate(ChannelUpdate),
    /// A message type this implementation does not know. The payload is kept verbatim.
    Unknown { msg_type: u16, payload: Vec<u8> },
}

impl LightningMessage {
    pub fn msg_type(&self) -> u16 {
        let known = match self {
            LightningMessage::Warning(_) => MessageType::Warning,
            LightningMessage::Stfu(_) => MessageType::Stfu,
            LightningMessage::Init(_) => MessageType::Init,
            LightningMessage::Error(_) => MessageType::Error,
            LightningMessage::Ping(_) => MessageType::Ping,
            LightningMessage::Pong(_) => MessageType::Pong,
            LightningMessage::OpenChannel(_) => MessageType::OpenChannel,
            LightningMessage::AcceptChannel(_) => MessageType::AcceptChannel,
            LightningMessage::FundingCreated(_) => MessageType::FundingCreated,
            LightningMessage::FundingSigned(_) => MessageType::FundingSigned,
            LightningMessage::ChannelReady(_) => MessageType::ChannelReady,
            LightningMessage::Shutdown(_) => MessageType::Shutdown,
            LightningMessage::ClosingSigned(_) => MessageType::ClosingSigned,
            LightningMessage::UpdateAddHtlc(_) => MessageType::UpdateAddHtlc,
            LightningMessage::UpdateFulfillHtlc(_) => MessageType::UpdateFulfillHtlc,
            LightningMessage::UpdateFailHtlc(_) => MessageType::UpdateFailHtlc,
            LightningMessage::CommitmentSigned(_) => MessageType::CommitmentSigned,
            LightningMessage::RevokeAndAck(_) => MessageType::RevokeAndAck,
            LightningMessage::UpdateFee(_) => MessageType::UpdateFee,
            LightningMessage::UpdateFailMalformedHtlc(_) => MessageType::UpdateFailMalformedHtlc,
            LightningMessage::ChannelReestablish(_) => MessageType::ChannelReestablish,
            LightningMessage::ChannelAnnouncement(_) => MessageType::ChannelAnnouncement,
            LightningMessage::NodeAnnouncement(_) => MessageType::NodeAnnouncement,
            LightningMessage::ChannelUpdate(_) => MessageType::ChannelUpdate,
            LightningMessage::Unknown { msg_type, .. } => return *msg_type,
        };
        known.into()
    }

    /// Whether the receiver must understand this message ("it's ok to be odd").
    pub fn is_mandatory_unknown(&self) -> bool {
        matches!(self, LightningMessage::Unknown { msg_type, .. } if msg_type % 2 == 0)
    }

    /// The channel a channel-scoped message belongs to. For messages sent before the
    /// funding transaction is known this is the temporary channel id.
    pub fn channel_id(&self) -> Option<Hash256> {
        match self {
            LightningMessage::Stfu(m) => Some(m.channel_id),
            LightningMessage::OpenChannel(m) => Some(m.temporary_channel_id),
            LightningMessage::AcceptChannel(m) => Some(m.temporary_channel_id),
            LightningMessage::FundingCreated(m) => Some(m.temporary_channel_id),
            LightningMessage::FundingSigned(m) => Some(m.channel_id),
            LightningMessage::ChannelReady(m) => Some(m.channel_id),
            LightningMessage::Shutdown(m) => Some(m.channel_id),
            LightningMessage::ClosingSigned(m) => Some(m.channel_id),
            LightningMessage::UpdateAddHtlc(m) => Some(m.channel_id),
            LightningMessage::UpdateFulfillHtlc(m) => Some(m.channel_id),
            LightningMessage::UpdateFailHtlc(m) => Some(m.channel_id),
            LightningMessage::CommitmentSigned(m) => Some(m.channel_id),
            LightningMessage::RevokeAndAck(m) => Some(m.channel_id),
            LightningMessage::UpdateFee(m) => Some(m.channel_id),
            LightningMessage::UpdateFailMalformedHtlc(m) => Some(m.channel_id),
            LightningMessage::ChannelReestablish(m) => Some(m.channel_id),
            LightningMessage::Error(m) => Some(m.channel_id),
            LightningMessage::Warning(m) => Some(m.channel_id),
            _ => None,
        }
    }

    pub fn is_gossip(&self) -> bool {
        matches!(
            self,
            LightningMessage::ChannelAnnouncement(_)
                | LightningMessage::NodeAnnouncement(_)
                | LightningMessage::ChannelUpdate(_)
        )
    }
}

pub fn encode(message: &LightningMessage) -> Vec<u8> {
    let mut w = Vec::with_capacity(64);
    w.put_u16(message.msg_type());
    match message {
        LightningMessage::Warning(m) => m.write(&mut w),
        LightningMessage::Stfu(m) => m.write(&mut w),
        LightningMessage::Init(m) => m.write(&mut w),
        LightningMessage::Error(m) => m.write(&mut w),
        LightningMessage::Ping(m) => m.write(&mut w),
        LightningMessage::Pong(m) => m.write(&mut w),
        LightningMessage::OpenChannel(m) => m.write(&mut w),
        LightningMessage::AcceptChannel(m) => m.write(&mut w),
        LightningMessage::FundingCreated(m) => m.write(&mut w),
        LightningMessage::FundingSigned(m) => m.write(&mut w),
        LightningMessage::ChannelReady(m) => m.write(&mut w),
        LightningMessage::Shutdown(m) => m.write(&mut w),
        LightningMessage::ClosingSigned(m) => m.write(&mut w),
        LightningMessage::UpdateAddHtlc(m) => m.write(&mut w),
        LightningMessage::UpdateFulfillHtlc(m) => m.write(&mut w),
        LightningMessage::UpdateFailHtlc(m) => m.write(&mut w),
        LightningMessage::CommitmentSigned(m) => m.write(&mut w),
        LightningMessage::RevokeAndAck(m) => m.write(&mut w),
        LightningMessage::UpdateFee(m) => m.write(&mut w),
        LightningMessage::UpdateFailMalformedHtlc(m) => m.write(&mut w),
        LightningMessage::ChannelReestablish(m) => m.write(&mut w),
        LightningMessage::ChannelAnnouncement(m) => m.write(&mut w),
        LightningMessage::NodeAnnouncement(m) => m.write(&mut w),
        LightningMessage::ChannelUpdate(m) => m.write(&mut w),
        LightningMessage::Unknown { payload, .. } => w.put_slice(payload),
    }
    w
}

pub fn decode(bytes: &[u8]) -> Result<LightningMessage, DecodeError> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(DecodeError::PayloadTooLarge(bytes.len()));
    }
    let mut r = Reader::new(bytes);
    let msg_type = r.read_u16()?;
    let Ok(known) = MessageType::try_from(msg_type) else {
        return Ok(LightningMessage::Unknown {
            msg_type,
            payload: bytes[2..].to_vec(),
        });
    };
    let r = &mut r;
    let message = match known {
        MessageType::Warning => LightningMessage::Warning(Warning::read(r)?),
        MessageType::Stfu => LightningMessage::Stfu(Stfu::read(r)?),
        MessageType::Init => LightningMessage::Init(Init::read(r)?),
        MessageType::Error => LightningMessage::Error(ErrorMessage::read(r)?),
        MessageType::Ping => LightningMessage::Ping(Ping::read(r)?),
        MessageType::Pong => LightningMessage::Pong(Pong::read(r)?),
        MessageType::OpenChannel => LightningMessage::OpenChannel(OpenChannel::read(r)?),
        MessageType::AcceptChannel => LightningMessage::AcceptChannel(AcceptChannel::read(r)?),
        MessageType::FundingCreated => LightningMessage::FundingCreated(FundingCreated::read(r)?),
        MessageType::FundingSigned => LightningMessage::FundingSigned(FundingSigned::read(r)?),
        MessageType::ChannelReady => LightningMessage::ChannelReady(ChannelReady::read(r)?),
        MessageType::Shutdown => LightningMessage::Shutdown(Shutdown::read(r)?),
        MessageType::ClosingSigned => LightningMessage::ClosingSigned(ClosingSigned::read(r)?),
        MessageType::UpdateAddHtlc => LightningMessage::UpdateAddHtlc(UpdateAddHtlc::read(r)?),
        MessageType::UpdateFulfillHtlc => {
            LightningMessage::UpdateFulfillHtlc(UpdateFulfillHtlc::read(r)?)
        }
        MessageType::UpdateFailHtlc => LightningMessage::UpdateFailHtlc(UpdateFailHtlc::read(r)?),
        MessageType::CommitmentSigned => {
            LightningMessage::CommitmentSigned(CommitmentSigned::read(r)?)
        }
        MessageType::RevokeAndAck => LightningMessage::RevokeAndAck(RevokeAndAck::read(r)?),
        MessageType::UpdateFee => LightningMessage::UpdateFee(UpdateFee::read(r)?),
        MessageType::UpdateFailMalformedHtlc => {
            LightningMessage::UpdateFailMalformedHtlc(UpdateFailMalformedHtlc::read(r)?)
        }
        MessageType::ChannelReestablish => {
            LightningMessage::ChannelReestablish(ChannelReestablish::read(r)?)
        }
        MessageType::ChannelAnnouncement => {
            LightningMessage::ChannelAnnouncement(ChannelAnnouncement::read(r)?)
        }
        MessageType::NodeAnnouncement => {
            LightningMessage::NodeAnnouncement(NodeAnnouncement::read(r)?)
        }
        MessageType::ChannelUpdate => LightningMessage::ChannelUpdate(ChannelUpdate::read(r)?),
    };
    Ok(message)
}

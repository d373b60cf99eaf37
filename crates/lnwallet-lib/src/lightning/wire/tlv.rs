//! BOLT 1 `bigsize` integers and TLV streams.
//!
//! Each message family owns a closed enum of the records it understands plus an
//! `Unknown` variant that keeps the raw bytes of records we do not understand. An
//! unknown record is only acceptable when its type is odd ("it's ok to be odd").

use std::fmt::Debug;

use super::{DecodeError, Reader};
use crate::lightning::types::{Hash256, Pubkey};

pub struct BigSize;

impl BigSize {
    pub fn write(value: u64, w: &mut Vec<u8>) {
        match value {
            0..=0xfc => w.push(value as u8),
            0xfd..=0xffff => {
                w.push(0xfd);
                w.extend_from_slice(&(value as u16).to_be_bytes());
            }
            0x1_0000..=0xffff_ffff => {
                w.push(0xfe);
                w.extend_from_slice(&(value as u32).to_be_bytes());
            }
            _ => {
                w.push(0xff);
                w.extend_from_slice(&value.to_be_bytes());
            }
        }
    }

    pub fn read(r: &mut Reader) -> Result<u64, DecodeError> {
        let value = match r.read_u8()? {
            0xfd => {
                let v = r.read_u16()? as u64;
                if v < 0xfd {
                    return Err(DecodeError::NonCanonicalBigSize);
                }
                v
            }
            0xfe => {
                let v = r.read_u32()? as u64;
                if v < 0x1_0000 {
                    return Err(DecodeError::NonCanonicalBigSize);
                }
                v
            }
            0xff => {
                let v = r.read_u64()?;
                if v < 0x1_0000_0000 {
                    return Err(DecodeError::NonCanonicalBigSize);
                }
                v
            }
            small => small as u64,
        };
        Ok(value)
    }
}

/// A record of one TLV namespace.
pub trait TlvRecord: Sized + Clone + Debug + PartialEq {
    fn tlv_type(&self) -> u64;

    fn write_value(&self, w: &mut Vec<u8>);

    /// Decode a record of a type known to this namespace, `Ok(None)` when the type is unknown.
    fn read_known(tlv_type: u64, value: &[u8]) -> Result<Option<Self>, DecodeError>;

    fn unknown(tlv_type: u64, value: Vec<u8>) -> Self;
}

/// An ordered TLV stream. Records are kept sorted by type and types are unique.
#[derive(Clone, Debug, PartialEq)]
pub struct TlvStream<T>(Vec<T>);

impl<T> Default for TlvStream<T> {
    fn default() -> Self {
        TlvStream(Vec::new())
    }
}

impl<T: TlvRecord> TlvStream<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, replacing any record of the same type.
    pub fn insert(&mut self, record: T) {
        let tlv_type = record.tlv_type();
        match self.0.binary_search_by_key(&tlv_type, |r| r.tlv_type()) {
            Ok(index) => self.0[index] = record,
            Err(index) => self.0.insert(index, record),
        }
    }

    pub fn with(mut self, record: T) -> Self {
        self.insert(record);
        self
    }

    pub fn records(&self) -> &[T] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn find<R>(&self, f: impl Fn(&T) -> Option<R>) -> Option<R> {
        self.0.iter().find_map(f)
    }

    pub fn write(&self, w: &mut Vec<u8>) {
        for record in &self.0 {
            let mut value = Vec::new();
            record.write_value(&mut value);
            BigSize::write(record.tlv_type(), w);
            BigSize::write(value.len() as u64, w);
            w.extend_from_slice(&value);
        }
    }

    /// Consume the rest of the reader as a TLV stream.
    pub fn read(r: &mut Reader) -> Result<Self, DecodeError> {
        let mut records: Vec<T> = Vec::new();
        let mut last_type: Option<u64> = None;
        while !r.is_empty() {
            let tlv_type = BigSize::read(r)?;
            if let Some(last) = last_type {
                if tlv_type <= last {
                    return Err(DecodeError::TlvOutOfOrder(tlv_type));
                }
            }
            last_type = Some(tlv_type);
            let length = BigSize::read(r)?;
            if length > r.remaining() as u64 {
                return Err(DecodeError::InvalidLength {
                    declared: length,
                    remaining: r.remaining(),
                });
            }
            let value = r.read_bytes(length as usize)?;
            match T::read_known(tlv_type, value)? {
                Some(record) => records.push(record),
                None if tlv_type % 2 == 0 => {
                    return Err(DecodeError::UnknownMandatoryTlv(tlv_type));
                }
                None => records.push(T::unknown(tlv_type, value.to_vec())),
            }
        }
        Ok(TlvStream(records))
    }
}

fn expect_len(tlv_type: u64, value: &[u8], len: usize) -> Result<(), DecodeError> {
    if value.len() != len {
        return Err(DecodeError::InvalidTlvValue(tlv_type));
    }
    Ok(())
}

/// Records of messages which do not define any TLV of their own.
#[derive(Clone, Debug, PartialEq)]
pub enum ExtensionTlv {
    Unknown { tlv_type: u64, value: Vec<u8> },
}

impl TlvRecord for ExtensionTlv {
    fn tlv_type(&self) -> u64 {
        match self {
            ExtensionTlv::Unknown { tlv_type, .. } => *tlv_type,
        }
    }

    fn write_value(&self, w: &mut Vec<u8>) {
        match self {
            ExtensionTlv::Unknown { value, .. } => w.extend_from_slice(value),
        }
    }

    fn read_known(_tlv_type: u64, _value: &[u8]) -> Result<Option<Self>, DecodeError> {
        Ok(None)
    }

    fn unknown(tlv_type: u64, value: Vec<u8>) -> Self {
        ExtensionTlv::Unknown { tlv_type, value }
    }
}

/// `init_tlvs`.
#[derive(Clone, Debug, PartialEq)]
pub enum InitTlv {
    Networks(Vec<Hash256>),
    RemoteAddress(Vec<u8>),
    Unknown { tlv_type: u64, value: Vec<u8> },
}

impl TlvRecord for InitTlv {
    fn tlv_type(&self) -> u64 {
        match self {
            InitTlv::Networks(_) => 1,
            InitTlv::RemoteAddress(_) => 3,
            InitTlv::Unknown { tlv_type, .. } => *tlv_type,
        }
    }

    fn write_value(&self, w: &mut Vec<u8>) {
        match self {
            InitTlv::Networks(chains) => {
                for chain in chains {
                    w.extend_from_slice(chain.as_ref());
                }
            }
            InitTlv::RemoteAddress(addr) => w.extend_from_slice(addr),
            InitTlv::Unknown { value, .. } => w.extend_from_slice(value),
        }
    }

    fn read_known(tlv_type: u64, value: &[u8]) -> Result<Option<Self>, DecodeError> {
        match tlv_type {
            1 => {
                if value.len() % 32 != 0 {
                    return Err(DecodeError::InvalidTlvValue(tlv_type));
                }
                let chains = value
                    .chunks(32)
                    .map(|chunk| Hash256::try_from(chunk).map_err(|_| DecodeError::InvalidTlvValue(1)))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Some(InitTlv::Networks(chains)))
            }
            3 => Ok(Some(InitTlv::RemoteAddress(value.to_vec()))),
            _ => Ok(None),
        }
    }

    fn unknown(tlv_type: u64, value: Vec<u8>) -> Self {
        InitTlv::Unknown { tlv_type, value }
    }
}

/// `open_channel_tlvs` and `accept_channel_tlvs`, which share their record types.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelOpeningTlv {
    UpfrontShutdownScript(Vec<u8>),
    ChannelType(Vec<u8>),
    Unknown { tlv_type: u64, value: Vec<u8> },
}

impl TlvRecord for ChannelOpeningTlv {
    fn tlv_type(&self) -> u64 {
        match self {
            ChannelOpeningTlv::UpfrontShutdownScript(_) => 0,
            ChannelOpeningTlv::ChannelType(_) => 1,
            ChannelOpeningTlv::Unknown { tlv_type, .. } => *tlv_type,
        }
    }

    fn write_value(&self, w: &mut Vec<u8>) {
        match self {
            ChannelOpeningTlv::UpfrontShutdownScript(bytes)
            | ChannelOpeningTlv::ChannelType(bytes)
            | ChannelOpeningTlv::Unknown { value: bytes, .. } => w.extend_from_slice(bytes),
        }
    }

    fn read_known(tlv_type: u64, value: &[u8]) -> Result<Option<Self>, DecodeError> {
        Ok(match tlv_type {
            0 => Some(ChannelOpeningTlv::UpfrontShutdownScript(value.to_vec())),
            1 => Some(ChannelOpeningTlv::ChannelType(value.to_vec())),
            _ => None,
        })
    }

    fn unknown(tlv_type: u64, value: Vec<u8>) -> Self {
        ChannelOpeningTlv::Unknown { tlv_type, value }
    }
}

/// `channel_ready_tlvs`.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelReadyTlv {
    ShortChannelIdAlias(u64),
    Unknown { tlv_type: u64, value: Vec<u8> },
}

impl TlvRecord for ChannelReadyTlv {
    fn tlv_type(&self) -> u64 {
        match self {
            ChannelReadyTlv::ShortChannelIdAlias(_) => 1,
            ChannelReadyTlv::Unknown { tlv_type, .. } => *tlv_type,
        }
    }

    fn write_value(&self, w: &mut Vec<u8>) {
        match self {
            ChannelReadyTlv::ShortChannelIdAlias(alias) => w.extend_from_slice(&alias.to_be_bytes()),
            ChannelReadyTlv::Unknown { value, .. } => w.extend_from_slice(value),
        }
    }

    fn read_known(tlv_type: u64, value: &[u8]) -> Result<Option<Self>, DecodeError> {
        match tlv_type {
            1 => {
                expect_len(tlv_type, value, 8)?;
                let mut r = Reader::new(value);
                Ok(Some(ChannelReadyTlv::ShortChannelIdAlias(r.read_u64()?)))
            }
            _ => Ok(None),
        }
    }

    fn unknown(tlv_type: u64, value: Vec<u8>) -> Self {
        ChannelReadyTlv::Unknown { tlv_type, value }
    }
}

/// `closing_signed_tlvs`.
#[derive(Clone, Debug, PartialEq)]
pub enum ClosingSignedTlv {
    FeeRange {
        min_fee_satoshis: u64,
        max_fee_satoshis: u64,
    },
    Unknown {
        tlv_type: u64,
        value: Vec<u8>,
    },
}

impl TlvRecord for ClosingSignedTlv {
    fn tlv_type(&self) -> u64 {
        match self {
            ClosingSignedTlv::FeeRange { .. } => 1,
            ClosingSignedTlv::Unknown { tlv_type, .. } => *tlv_type,
        }
    }

    fn write_value(&self, w: &mut Vec<u8>) {
        match self {
            ClosingSignedTlv::FeeRange {
                min_fee_satoshis,
                max_fee_satoshis,
            } => {
                w.extend_from_slice(&min_fee_satoshis.to_be_bytes());
                w.extend_from_slice(&max_fee_satoshis.to_be_bytes());
            }
            ClosingSignedTlv::Unknown { value, .. } => w.extend_from_slice(value),
        }
    }

    fn read_known(tlv_type: u64, value: &[u8]) -> Result<Option<Self>, DecodeError> {
        match tlv_type {
            1 => {
                expect_len(tlv_type, value, 16)?;
                let mut r = Reader::new(value);
                Ok(Some(ClosingSignedTlv::FeeRange {
                    min_fee_satoshis: r.read_u64()?,
                    max_fee_satoshis: r.read_u64()?,
                }))
            }
            _ => Ok(None),
        }
    }

    fn unknown(tlv_type: u64, value: Vec<u8>) -> Self {
        ClosingSignedTlv::Unknown { tlv_type, value }
    }
}

/// `update_add_htlc_tlvs`.
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateAddHtlcTlv {
    BlindingPoint(Pubkey),
    Unknown { tlv_type: u64, value: Vec<u8> },
}

impl TlvRecord for UpdateAddHtlcTlv {
    fn tlv_type(&self) -> u64 {
        match self {
            UpdateAddHtlcTlv::BlindingPoint(_) => 0,
            UpdateAddHtlcTlv::Unknown { tlv_type, .. } => *tlv_type,
        }
    }

    fn write_value(&self, w: &mut Vec<u8>) {
        match self {
            UpdateAddHtlcTlv::BlindingPoint(point) => w.extend_from_slice(&point.serialize()),
            UpdateAddHtlcTlv::Unknown { value, .. } => w.extend_from_slice(value),
        }
    }

    fn read_known(tlv_type: u64, value: &[u8]) -> Result<Option<Self>, DecodeError> {
        match tlv_type {
            0 => {
                expect_len(tlv_type, value, Pubkey::serialization_len())?;
                let point =
                    Pubkey::from_slice(value).map_err(|_| DecodeError::InvalidTlvValue(tlv_type))?;
                Ok(Some(UpdateAddHtlcTlv::BlindingPoint(point)))
            }
            _ => Ok(None),
        }
    }

    fn unknown(tlv_type: u64, value: Vec<u8>) -> Self {
        UpdateAddHtlcTlv::Unknown { tlv_type, value }
    }
}

/// `channel_reestablish_tlvs`.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelReestablishTlv {
    NextFunding(Hash256),
    Unknown { tlv_type: u64, value: Vec<u8> },
}

impl TlvRecord for ChannelReestablishTlv {
    fn tlv_type(&self) -> u64 {
        match self {
            ChannelReestablishTlv::NextFunding(_) => 0,
            ChannelReestablishTlv::Unknown { tlv_type, .. } => *tlv_type,
        }
    }

    fn write_value(&self, w: &mut Vec<u8>) {
        match self {
            ChannelReestablishTlv::NextFunding(txid) => w.extend_from_slice(txid.as_ref()),
            ChannelReestablishTlv::Unknown { value, .. } => w.extend_from_slice(value),
        }
    }

    fn read_known(tlv_type: u64, value: &[u8]) -> Result<Option<Self>, DecodeError> {
        match tlv_type {
            0 => {
                expect_len(tlv_type, value, 32)?;
                let txid =
                    Hash256::try_from(value).map_err(|_| DecodeError::InvalidTlvValue(tlv_type))?;
                Ok(Some(ChannelReestablishTlv::NextFunding(txid)))
            }
            _ => Ok(None),
        }
    }

    fn unknown(tlv_type: u64, value: Vec<u8>) -> Self {
        ChannelReestablishTlv::Unknown { tlv_type, value }
    }
}

use std::{fmt, str::FromStr};

use secp256k1::{PublicKey, SecretKey, SECP256K1};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use sha2::{Digest, Sha256};

use super::serde_utils::SliceHex;

/// A 256-bit hash digest, used as identifier of channel, payment, transaction hash etc.
#[serde_as]
#[derive(Copy, Clone, Serialize, Deserialize, Hash, Eq, PartialEq, Ord, PartialOrd, Default)]
pub struct Hash256(#[serde_as(as = "SliceHex")] [u8; 32]);

impl Hash256 {
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl From<Hash256> for [u8; 32] {
    fn from(val: Hash256) -> Self {
        val.0
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for Hash256 {
    type Error = anyhow::Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let data: [u8; 32] = value
            .try_into()
            .map_err(|_| anyhow::anyhow!("Invalid hash length {}", value.len()))?;
        Ok(Hash256(data))
    }
}

impl TryFrom<Vec<u8>> for Hash256 {
    type Error = anyhow::Error;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        Hash256::try_from(value.as_slice())
    }
}

impl fmt::LowerHex for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if f.alternate() {
            write!(f, "0x")?;
        }
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Hash256({:#x})", self)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self)
    }
}

impl FromStr for Hash256 {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim_start_matches("0x"))?;
        Hash256::try_from(bytes.as_slice())
    }
}

/// Single SHA256 of `data`.
pub fn sha256(data: &[u8]) -> Hash256 {
    let digest: [u8; 32] = Sha256::digest(data).into();
    digest.into()
}

const PUBKEY_SIZE: usize = 33;

/// The public key of a node, kept in its compressed serialized form so that it can be
/// compared and hashed cheaply. Construction always goes through secp256k1 validation.
#[serde_as]
#[derive(Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pubkey(#[serde_as(as = "SliceHex")] [u8; PUBKEY_SIZE]);

impl fmt::Debug for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pubkey({})", hex::encode(self.0))
    }
}

impl fmt::Display for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Pubkey {
    pub const fn serialization_len() -> usize {
        PUBKEY_SIZE
    }

    pub fn serialize(&self) -> [u8; PUBKEY_SIZE] {
        self.0
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, secp256k1::Error> {
        PublicKey::from_slice(slice).map(Into::into)
    }

    pub fn to_public_key(&self) -> PublicKey {
        PublicKey::from_slice(&self.0).expect("Pubkey always holds a valid serialized key")
    }
}

impl From<PublicKey> for Pubkey {
    fn from(pk: PublicKey) -> Pubkey {
        Pubkey(pk.serialize())
    }
}

impl From<Pubkey> for PublicKey {
    fn from(pk: Pubkey) -> Self {
        pk.to_public_key()
    }
}

impl FromStr for Pubkey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim_start_matches("0x"))?;
        Ok(Pubkey::from_slice(&bytes)?)
    }
}

/// A wrapper for secp256k1 secret key.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Privkey(pub SecretKey);

impl fmt::Debug for Privkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Privkey(..)")
    }
}

impl Privkey {
    pub fn from_slice(key: &[u8]) -> Result<Self, secp256k1::Error> {
        SecretKey::from_slice(key).map(Privkey)
    }

    pub fn generate() -> Self {
        Privkey(SecretKey::new(&mut rand::thread_rng()))
    }

    pub fn pubkey(&self) -> Pubkey {
        Pubkey::from(self.0.public_key(SECP256K1))
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.0.secret_bytes()
    }
}

impl From<SecretKey> for Privkey {
    fn from(sk: SecretKey) -> Self {
        Self(sk)
    }
}

impl From<Privkey> for SecretKey {
    fn from(pk: Privkey) -> Self {
        pk.0
    }
}

/// A 64 byte compact ECDSA signature as it travels on the wire.
///
/// The bytes are not validated while decoding messages, see [`Signature64::to_ecdsa`].
#[serde_as]
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature64(#[serde_as(as = "SliceHex")] pub [u8; 64]);

impl Default for Signature64 {
    fn default() -> Self {
        Signature64([0u8; 64])
    }
}

impl fmt::Debug for Signature64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature64({})", hex::encode(&self.0[..8]))
    }
}

impl Signature64 {
    pub fn to_ecdsa(&self) -> Result<secp256k1::ecdsa::Signature, secp256k1::Error> {
        secp256k1::ecdsa::Signature::from_compact(&self.0)
    }
}

impl From<secp256k1::ecdsa::Signature> for Signature64 {
    fn from(sig: secp256k1::ecdsa::Signature) -> Self {
        Signature64(sig.serialize_compact())
    }
}

/// BOLT 7 short channel id: block height (3 bytes), transaction index (3 bytes)
/// and output index (2 bytes) packed into a u64.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct ShortChannelId(pub u64);

impl ShortChannelId {
    pub fn new(block_height: u32, tx_index: u32, output_index: u16) -> Self {
        ShortChannelId(
            ((block_height as u64 & 0xff_ffff) << 40)
                | ((tx_index as u64 & 0xff_ffff) << 16)
                | output_index as u64,
        )
    }

    pub fn block_height(&self) -> u32 {
        (self.0 >> 40) as u32
    }

    pub fn tx_index(&self) -> u32 {
        ((self.0 >> 16) & 0xff_ffff) as u32
    }

    pub fn output_index(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

impl fmt::Debug for ShortChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShortChannelId({})", self)
    }
}

impl fmt::Display for ShortChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{}",
            self.block_height(),
            self.tx_index(),
            self.output_index()
        )
    }
}

impl FromStr for ShortChannelId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('x').collect();
        if parts.len() != 3 {
            return Err(anyhow::anyhow!("invalid short channel id {}", s));
        }
        Ok(ShortChannelId::new(
            parts[0].parse()?,
            parts[1].parse()?,
            parts[2].parse()?,
        ))
    }
}

/// Where to reach a node: `<pubkey>@<host>:<port>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub pubkey: Pubkey,
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(pubkey: Pubkey, host: impl Into<String>, port: u16) -> Self {
        Self {
            pubkey,
            host: host.into(),
            port,
        }
    }

    pub fn socket_addr_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.pubkey, self.host, self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pubkey, addr) = s
            .split_once('@')
            .ok_or_else(|| anyhow::anyhow!("node address must be pubkey@host:port: {}", s))?;
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("missing port in node address: {}", s))?;
        Ok(NodeAddress {
            pubkey: pubkey.parse()?,
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port: port.parse()?,
        })
    }
}

/// Channel id per BOLT 2: the funding txid with the funding output index xored
/// into its last two bytes.
pub fn channel_id_from_funding(funding_txid: &Hash256, output_index: u16) -> Hash256 {
    let mut id = funding_txid.0;
    let index = output_index.to_be_bytes();
    id[30] ^= index[0];
    id[31] ^= index[1];
    Hash256(id)
}

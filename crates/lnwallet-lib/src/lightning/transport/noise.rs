//! BOLT 8 `Noise_XK_secp256k1_ChaChaPoly_SHA256` handshake and message ciphers.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use secp256k1::{ecdh::SharedSecret, PublicKey, SecretKey, SECP256K1};
use sha2::{Digest, Sha256};

use super::TransportError;
use crate::lightning::types::{Privkey, Pubkey};

const PROTOCOL_NAME: &[u8] = b"Noise_XK_secp256k1_ChaChaPoly_SHA256";
const PROLOGUE: &[u8] = b"lightning";
const HANDSHAKE_VERSION: u8 = 0;

pub const ACT_ONE_SIZE: usize = 50;
pub const ACT_TWO_SIZE: usize = 50;
pub const ACT_THREE_SIZE: usize = 66;
pub const MAC_SIZE: usize = 16;
/// Encrypted 2-byte length prefix of every transport message.
pub const LENGTH_HEADER_SIZE: usize = 2 + MAC_SIZE;
/// Keys are rotated after this many nonces have been used.
pub const KEY_ROTATION_INTERVAL: u64 = 1000;

fn sha256_concat(a: &[u8], b: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

fn hkdf_extract_expand(salt: &[u8; 32], ikm: &[u8]) -> ([u8; 32], [u8; 32]) {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; 64];
    hk.expand(&[], &mut okm)
        .expect("64 bytes is a valid HKDF-SHA256 output length");
    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&okm[..32]);
    second.copy_from_slice(&okm[32..]);
    (first, second)
}

fn ecdh(sk: &SecretKey, pk: &PublicKey) -> [u8; 32] {
    SharedSecret::new(pk, sk).secret_bytes()
}

fn nonce(n: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&n.to_le_bytes());
    *Nonce::from_slice(&bytes)
}

fn encrypt_with_ad(
    key: &[u8; 32],
    n: u64,
    ad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, TransportError> {
    ChaCha20Poly1305::new(Key::from_slice(key))
        .encrypt(&nonce(n), Payload { msg: plaintext, aad: ad })
        .map_err(|_| TransportError::HandshakeFailed("encryption failed".to_string()))
}

fn decrypt_with_ad(
    key: &[u8; 32],
    n: u64,
    ad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, TransportError> {
    ChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt(&nonce(n), Payload { msg: ciphertext, aad: ad })
        .map_err(|_| TransportError::AuthenticationFailed)
}

/// One direction of an established transport: key, chaining key and nonce counter.
pub struct CipherState {
    ck: [u8; 32],
    key: [u8; 32],
    nonce: u64,
}

impl CipherState {
    fn new(ck: [u8; 32], key: [u8; 32]) -> Self {
        Self { ck, key, nonce: 0 }
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    fn advance(&mut self) {
        self.nonce += 1;
        if self.nonce == KEY_ROTATION_INTERVAL {
            let (ck, key) = hkdf_extract_expand(&self.ck, &self.key);
            self.ck = ck;
            self.key = key;
            self.nonce = 0;
        }
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, TransportError> {
        let ciphertext = encrypt_with_ad(&self.key, self.nonce, &[], plaintext)?;
        self.advance();
        Ok(ciphertext)
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, TransportError> {
        let plaintext = decrypt_with_ad(&self.key, self.nonce, &[], ciphertext)?;
        self.advance();
        Ok(plaintext)
    }

    /// Encrypt a whole message: encrypted length header followed by the encrypted body.
    pub fn encrypt_message(&mut self, message: &[u8]) -> Result<Vec<u8>, TransportError> {
        let len = u16::try_from(message.len())
            .map_err(|_| TransportError::MessageTooLarge(message.len()))?;
        let mut frame = self.encrypt(&len.to_be_bytes())?;
        frame.extend(self.encrypt(message)?);
        Ok(frame)
    }

    /// Decrypt a length header, returning the length of the body ciphertext that follows.
    pub fn decrypt_length(&mut self, header: &[u8]) -> Result<usize, TransportError> {
        let plaintext = self.decrypt(header)?;
        let bytes: [u8; 2] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| TransportError::AuthenticationFailed)?;
        Ok(u16::from_be_bytes(bytes) as usize + MAC_SIZE)
    }
}

/// The symmetric key pair derived by a successful handshake.
pub struct TransportKeys {
    pub sending: CipherState,
    pub receiving: CipherState,
    pub remote_static: Pubkey,
}

/// State of a handshake in progress, for either role.
pub struct HandshakeState {
    ck: [u8; 32],
    h: [u8; 32],
    temp_k2: [u8; 32],
    local_static: SecretKey,
    local_ephemeral: SecretKey,
    remote_static: Option<PublicKey>,
    remote_ephemeral: Option<PublicKey>,
}

impl HandshakeState {
    fn initialize(responder_static: &PublicKey, local_static: SecretKey, ephemeral: SecretKey) -> Self {
        let h: [u8; 32] = Sha256::digest(PROTOCOL_NAME).into();
        let ck = h;
        let h = sha256_concat(&h, PROLOGUE);
        let h = sha256_concat(&h, &responder_static.serialize());
        Self {
            ck,
            h,
            temp_k2: [0u8; 32],
            local_static,
            local_ephemeral: ephemeral,
            remote_static: None,
            remote_ephemeral: None,
        }
    }

    pub fn new_initiator(local_static: &Privkey, remote_static: &Pubkey, ephemeral: Privkey) -> Self {
        let remote = remote_static.to_public_key();
        let mut state = Self::initialize(&remote, local_static.0, ephemeral.0);
        state.remote_static = Some(remote);
        state
    }

    pub fn new_responder(local_static: &Privkey, ephemeral: Privkey) -> Self {
        let local_pub = local_static.0.public_key(SECP256K1);
        Self::initialize(&local_pub, local_static.0, ephemeral.0)
    }

    fn mix_hash(&mut self, data: &[u8]) {
        self.h = sha256_concat(&self.h, data);
    }

    fn mix_key(&mut self, ikm: &[u8; 32]) -> [u8; 32] {
        let (ck, temp_k) = hkdf_extract_expand(&self.ck, ikm);
        self.ck = ck;
        temp_k
    }

    fn parse_act(act: &[u8], expected: usize) -> Result<(), TransportError> {
        if act.len() != expected {
            return Err(TransportError::HandshakeFailed(format!(
                "act has {} bytes, expected {}",
                act.len(),
                expected
            )));
        }
        if act[0] != HANDSHAKE_VERSION {
            return Err(TransportError::HandshakeFailed(format!(
                "unsupported handshake version {}",
                act[0]
            )));
        }
        Ok(())
    }

    fn parse_pubkey(bytes: &[u8]) -> Result<PublicKey, TransportError> {
        PublicKey::from_slice(bytes)
            .map_err(|_| TransportError::HandshakeFailed("invalid public key".to_string()))
    }

    /// Initiator: produce act one.
    pub fn act_one(&mut self) -> Result<[u8; ACT_ONE_SIZE], TransportError> {
        let remote_static = self
            .remote_static
            .ok_or_else(|| TransportError::HandshakeFailed("missing remote static key".into()))?;
        let e_pub = self.local_ephemeral.public_key(SECP256K1).serialize();
        self.mix_hash(&e_pub);
        let es = ecdh(&self.local_ephemeral, &remote_static);
        let temp_k1 = self.mix_key(&es);
        let c = encrypt_with_ad(&temp_k1, 0, &self.h, &[])?;
        self.mix_hash(&c);

        let mut act = [0u8; ACT_ONE_SIZE];
        act[0] = HANDSHAKE_VERSION;
        act[1..34].copy_from_slice(&e_pub);
        act[34..].copy_from_slice(&c);
        Ok(act)
    }

    /// Responder: consume act one and produce act two.
    pub fn process_act_one(&mut self, act: &[u8]) -> Result<[u8; ACT_TWO_SIZE], TransportError> {
        Self::parse_act(act, ACT_ONE_SIZE)?;
        let re = Self::parse_pubkey(&act[1..34])?;
        self.mix_hash(&act[1..34]);
        let es = ecdh(&self.local_static, &re);
        let temp_k1 = self.mix_key(&es);
        decrypt_with_ad(&temp_k1, 0, &self.h, &act[34..])?;
        self.mix_hash(&act[34..]);
        self.remote_ephemeral = Some(re);

        let e_pub = self.local_ephemeral.public_key(SECP256K1).serialize();
        self.mix_hash(&e_pub);
        let ee = ecdh(&self.local_ephemeral, &re);
        self.temp_k2 = self.mix_key(&ee);
        let c = encrypt_with_ad(&self.temp_k2, 0, &self.h, &[])?;
        self.mix_hash(&c);

        let mut out = [0u8; ACT_TWO_SIZE];
        out[0] = HANDSHAKE_VERSION;
        out[1..34].copy_from_slice(&e_pub);
        out[34..].copy_from_slice(&c);
        Ok(out)
    }

    /// Initiator: consume act two and produce act three together with the transport keys.
    pub fn process_act_two(
        mut self,
        act: &[u8],
    ) -> Result<([u8; ACT_THREE_SIZE], TransportKeys), TransportError> {
        Self::parse_act(act, ACT_TWO_SIZE)?;
        let re = Self::parse_pubkey(&act[1..34])?;
        self.mix_hash(&act[1..34]);
        let ee = ecdh(&self.local_ephemeral, &re);
        self.temp_k2 = self.mix_key(&ee);
        decrypt_with_ad(&self.temp_k2, 0, &self.h, &act[34..])?;
        self.mix_hash(&act[34..]);

        let s_pub = self.local_static.public_key(SECP256K1).serialize();
        let c = encrypt_with_ad(&self.temp_k2, 1, &self.h, &s_pub)?;
        self.mix_hash(&c);
        let se = ecdh(&self.local_static, &re);
        let temp_k3 = self.mix_key(&se);
        let t = encrypt_with_ad(&temp_k3, 0, &self.h, &[])?;
        let (sk, rk) = hkdf_extract_expand(&self.ck, &[]);

        let mut out = [0u8; ACT_THREE_SIZE];
        out[0] = HANDSHAKE_VERSION;
        out[1..50].copy_from_slice(&c);
        out[50..].copy_from_slice(&t);

        let remote_static = self
            .remote_static
            .ok_or_else(|| TransportError::HandshakeFailed("missing remote static key".into()))?;
        Ok((
            out,
            TransportKeys {
                sending: CipherState::new(self.ck, sk),
                receiving: CipherState::new(self.ck, rk),
                remote_static: remote_static.into(),
            },
        ))
    }

    /// Responder: consume act three, learning the initiator's static key.
    pub fn process_act_three(mut self, act: &[u8]) -> Result<TransportKeys, TransportError> {
        Self::parse_act(act, ACT_THREE_SIZE)?;
        let c = &act[1..50];
        let t = &act[50..];
        let rs_bytes = decrypt_with_ad(&self.temp_k2, 1, &self.h, c)?;
        let rs = Self::parse_pubkey(&rs_bytes)?;
        self.mix_hash(c);
        if self.remote_ephemeral.is_none() {
            return Err(TransportError::HandshakeFailed("act one not processed".into()));
        }
        let se = ecdh(&self.local_ephemeral, &rs);
        let temp_k3 = self.mix_key(&se);
        decrypt_with_ad(&temp_k3, 0, &self.h, t)?;
        let (rk, sk) = hkdf_extract_expand(&self.ck, &[]);
        Ok(TransportKeys {
            sending: CipherState::new(self.ck, sk),
            receiving: CipherState::new(self.ck, rk),
            remote_static: rs.into(),
        })
    }
}

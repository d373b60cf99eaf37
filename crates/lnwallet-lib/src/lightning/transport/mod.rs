//! Per-peer encrypted transport (BOLT 8).

mod keepalive;
pub mod noise;
mod session;

pub use keepalive::PingTracker;
pub use noise::{CipherState, HandshakeState, TransportKeys};
pub use session::{ConnectionState, TransportSession};

use thiserror::Error;

use super::wire::DecodeError;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Handshake timed out")]
    HandshakeTimeout,
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),
    #[error("Session is not connected")]
    NotConnected,
    #[error("Message authentication failed")]
    AuthenticationFailed,
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Connection closed by peer")]
    ConnectionClosed,
    #[error("Message of {0} bytes is too large")]
    MessageTooLarge(usize),
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Errors after which the session keys must be discarded.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            TransportError::NotConnected | TransportError::MessageTooLarge(_)
        )
    }
}

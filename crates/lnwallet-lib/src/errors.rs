use ractor::SpawnErr;
use thiserror::Error;

use crate::{
    invoice::InvoiceError,
    lightning::{
        channel::ProcessingChannelError,
        graph::PathFindError,
        payment::PaymentError,
        transport::TransportError,
        types::{Hash256, Pubkey},
        wire::DecodeError,
    },
    store::StoreError,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Peer not found error: {0:?}")]
    PeerNotFound(Pubkey),
    #[error("Channel not found error: {0:?}")]
    ChannelNotFound(Hash256),
    #[error("Connection not allowed by the session coordinator")]
    ConnectionNotAllowed,
    #[error("Too many peers, the limit is {0}")]
    TooManyPeers(usize),
    #[error("Failed to spawn actor: {0}")]
    SpawnErr(#[from] SpawnErr),
    #[error("Failed to processing channel: {0}")]
    ChannelError(#[from] ProcessingChannelError),
    #[error("Transport error: {0}")]
    TransportError(#[from] TransportError),
    #[error("Decode error: {0}")]
    DecodeError(#[from] DecodeError),
    #[error("Payment error: {0}")]
    PaymentError(#[from] PaymentError),
    #[error("Invoice error: {0}")]
    InvoiceError(#[from] InvoiceError),
    #[error("Network Graph error: {0}")]
    NetworkGraphError(#[from] PathFindError),
    #[error("Persistence failure: {0}")]
    PersistenceFailure(#[from] StoreError),
    #[error("InvalidParameter: {0}")]
    InvalidParameter(String),
    #[error("Invalid peer message: {0}")]
    InvalidPeerMessage(String),
    #[error("Actor call failed: {0}")]
    ActorCallError(String),
    #[error("Internal error: {0}")]
    InternalError(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

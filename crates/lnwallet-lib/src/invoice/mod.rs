//! BOLT 11 invoices.
//!
//! Parsing, validation and signing are delegated to `lightning-invoice`; this module
//! only adapts the result to the wallet's own identifier types.

mod store;
#[cfg(test)]
mod tests;

use std::{fmt, str::FromStr, time::Duration};

use bitcoin::hashes::{sha256, Hash as _};
use lightning_invoice::{Bolt11Invoice, Currency, InvoiceBuilder, PaymentSecret};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use thiserror::Error;

pub use store::{InvoiceStore, PreimageStore};

use crate::{
    lightning::types::{sha256 as sha256_hash, Hash256, Privkey, Pubkey},
    store::StoreError,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvoiceError {
    #[error("Failed to parse invoice: {0}")]
    ParseError(String),
    #[error("Failed to build invoice: {0}")]
    BuildError(String),
    #[error("Invalid payee public key in invoice")]
    InvalidPayee,
    #[error("Invoice is expired")]
    Expired,
    #[error("Invoice does not carry an amount")]
    MissingAmount,
    #[error("Duplicated invoice found: {0}")]
    DuplicatedInvoice(Hash256),
    #[error("Invoice not found")]
    InvoiceNotFound,
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum InvoiceStatus {
    /// The invoice is open and can be paid.
    Open,
    /// The invoice is cancelled.
    Cancelled,
    /// The invoice is expired.
    Expired,
    /// The invoice is paid.
    Paid,
}

/// A signed BOLT 11 invoice.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice(#[serde_as(as = "DisplayFromStr")] Bolt11Invoice);

impl Invoice {
    pub fn payment_hash(&self) -> Hash256 {
        Hash256::from(self.0.payment_hash().to_byte_array())
    }

    pub fn payment_secret(&self) -> Hash256 {
        Hash256::from(self.0.payment_secret().0)
    }

    pub fn amount_msat(&self) -> Option<u64> {
        self.0.amount_milli_satoshis()
    }

    /// The payee, either given explicitly or recovered from the signature.
    pub fn payee(&self) -> Result<Pubkey, InvoiceError> {
        let key = self.0.recover_payee_pub_key();
        Pubkey::from_slice(&key.serialize()).map_err(|_| InvoiceError::InvalidPayee)
    }

    pub fn min_final_cltv_expiry_delta(&self) -> u64 {
        self.0.min_final_cltv_expiry_delta()
    }

    pub fn is_expired(&self) -> bool {
        self.0.is_expired()
    }

    pub fn inner(&self) -> &Bolt11Invoice {
        &self.0
    }
}

impl FromStr for Invoice {
    type Err = InvoiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Bolt11Invoice::from_str(s.trim())
            .map(Invoice)
            .map_err(|err| InvoiceError::ParseError(err.to_string()))
    }
}

impl fmt::Display for Invoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parameters of an invoice the wallet issues to get paid.
#[derive(Clone, Debug)]
pub struct InvoiceParams {
    pub currency: Currency,
    pub amount_msat: Option<u64>,
    pub description: String,
    pub preimage: Hash256,
    pub payment_secret: Hash256,
    pub expiry: Duration,
    pub min_final_cltv_expiry_delta: u64,
}

/// Build and sign an invoice with the node key. The payment hash is the sha256 of
/// `params.preimage`.
pub fn create_invoice(node_key: &Privkey, params: InvoiceParams) -> Result<Invoice, InvoiceError> {
    let payment_hash = sha256_hash(params.preimage.as_ref());
    let secret_key = bitcoin::secp256k1::SecretKey::from_slice(&node_key.secret_bytes())
        .map_err(|err| InvoiceError::BuildError(err.to_string()))?;
    let secp = bitcoin::secp256k1::Secp256k1::new();
    let builder = InvoiceBuilder::new(params.currency)
        .description(params.description)
        .payment_hash(sha256::Hash::from_byte_array(*payment_hash.as_bytes()))
        .payment_secret(PaymentSecret(*params.payment_secret.as_bytes()))
        .current_timestamp()
        .min_final_cltv_expiry_delta(params.min_final_cltv_expiry_delta)
        .expiry_time(params.expiry);
    let builder = match params.amount_msat {
        Some(amount) => builder.amount_milli_satoshis(amount),
        None => builder,
    };
    builder
        .build_signed(|hash| secp.sign_ecdsa_recoverable(hash, &secret_key))
        .map(Invoice)
        .map_err(|err| InvoiceError::BuildError(err.to_string()))
}

use std::{str::FromStr, time::Duration};

use lightning_invoice::Currency;

use crate::{
    gen_rand_sha256_hash,
    invoice::{
        create_invoice, Invoice, InvoiceError, InvoiceParams, InvoiceStatus, InvoiceStore,
        PreimageStore,
    },
    lightning::types::{sha256, Hash256, Privkey},
    store::{MemoryStore, StoreError},
};

fn params(amount_msat: Option<u64>, preimage: Hash256) -> InvoiceParams {
    InvoiceParams {
        currency: Currency::Regtest,
        amount_msat,
        description: "coffee".to_string(),
        preimage,
        payment_secret: gen_rand_sha256_hash(),
        expiry: Duration::from_secs(3600),
        min_final_cltv_expiry_delta: 144,
    }
}

#[test]
fn test_create_invoice() {
    let node = Privkey::generate();
    let preimage = gen_rand_sha256_hash();
    let params = params(Some(250_000), preimage);
    let secret = params.payment_secret;
    let invoice = create_invoice(&node, params).expect("create invoice");

    assert_eq!(invoice.payment_hash(), sha256(preimage.as_ref()));
    assert_eq!(invoice.payment_secret(), secret);
    assert_eq!(invoice.amount_msat(), Some(250_000));
    assert_eq!(invoice.payee(), Ok(node.pubkey()));
    assert_eq!(invoice.min_final_cltv_expiry_delta(), 144);
    assert!(!invoice.is_expired());
}

#[test]
fn test_invoice_string_roundtrip() {
    let node = Privkey::generate();
    let invoice = create_invoice(&node, params(None, gen_rand_sha256_hash())).unwrap();
    let encoded = invoice.to_string();
    assert!(encoded.starts_with("lnbcrt"));

    let decoded = Invoice::from_str(&encoded).expect("parse invoice");
    assert_eq!(decoded, invoice);
    assert_eq!(decoded.amount_msat(), None);
    assert_eq!(decoded.payee(), Ok(node.pubkey()));

    let json = serde_json::to_string(&invoice).unwrap();
    assert_eq!(json, format!("\"{}\"", encoded));
    assert_eq!(serde_json::from_str::<Invoice>(&json).unwrap(), invoice);
}

#[test]
fn test_parse_invalid_invoice() {
    assert!(matches!(
        Invoice::from_str("lnbc1invalid"),
        Err(InvoiceError::ParseError(_))
    ));
    assert!(matches!(
        Invoice::from_str(""),
        Err(InvoiceError::ParseError(_))
    ));
}

#[test]
fn test_tampered_invoice_is_rejected() {
    let node = Privkey::generate();
    let encoded = create_invoice(&node, params(Some(1_000), gen_rand_sha256_hash()))
        .unwrap()
        .to_string();
    // Swapping one data character breaks the bech32 checksum.
    let mut chars: Vec<char> = encoded.chars().collect();
    let index = chars.len() - 10;
    chars[index] = if chars[index] == 'q' { 'p' } else { 'q' };
    let tampered: String = chars.into_iter().collect();
    assert!(Invoice::from_str(&tampered).is_err());
}

#[test]
fn test_invoice_store() {
    let store = MemoryStore::new();
    let preimage = gen_rand_sha256_hash();
    let invoice = create_invoice(&Privkey::generate(), params(Some(5_000), preimage)).unwrap();
    let hash = invoice.payment_hash();

    assert_eq!(store.get_invoice(&hash), None);
    store
        .insert_invoice(invoice.clone(), Some(preimage))
        .expect("insert invoice");
    assert_eq!(store.get_invoice(&hash), Some(invoice.clone()));
    assert_eq!(store.get_invoice_status(&hash), Some(InvoiceStatus::Open));
    assert_eq!(store.get_preimage(&hash), Some(preimage));

    assert_eq!(
        store.insert_invoice(invoice, None),
        Err(InvoiceError::DuplicatedInvoice(hash))
    );

    store
        .update_invoice_status(&hash, InvoiceStatus::Paid)
        .expect("update status");
    assert_eq!(store.get_invoice_status(&hash), Some(InvoiceStatus::Paid));
    assert_eq!(
        store.update_invoice_status(&gen_rand_sha256_hash(), InvoiceStatus::Cancelled),
        Err(InvoiceError::InvoiceNotFound)
    );
}

#[test]
fn test_invoice_store_write_failure() {
    let store = MemoryStore::new();
    store.set_fail_writes(true);
    let invoice =
        create_invoice(&Privkey::generate(), params(None, gen_rand_sha256_hash())).unwrap();
    assert_eq!(
        store.insert_invoice(invoice, None),
        Err(InvoiceError::Store(StoreError::WriteFailed(
            "invoice".to_string()
        )))
    );
}

#[test]
fn test_preimage_store() {
    let store = MemoryStore::new();
    let preimage = gen_rand_sha256_hash();
    let hash = sha256(preimage.as_ref());
    store.insert_preimage(hash, preimage).unwrap();
    assert_eq!(store.get_preimage(&hash), Some(preimage));
    store.remove_preimage(&hash).unwrap();
    assert_eq!(store.get_preimage(&hash), None);
}

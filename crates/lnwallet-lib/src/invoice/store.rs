use super::{Invoice, InvoiceError, InvoiceStatus};
use crate::{lightning::types::Hash256, store::StoreError};

pub trait InvoiceStore {
    fn get_invoice(&self, id: &Hash256) -> Option<Invoice>;
    /// Insert a new invoice with status `Open`, and its preimage when we know it.
    fn insert_invoice(&self, invoice: Invoice, preimage: Option<Hash256>)
        -> Result<(), InvoiceError>;
    fn update_invoice_status(&self, id: &Hash256, status: InvoiceStatus)
        -> Result<(), InvoiceError>;
    fn get_invoice_status(&self, id: &Hash256) -> Option<InvoiceStatus>;
}

pub trait PreimageStore {
    fn insert_preimage(&self, payment_hash: Hash256, preimage: Hash256) -> Result<(), StoreError>;
    fn remove_preimage(&self, payment_hash: &Hash256) -> Result<(), StoreError>;
    fn get_preimage(&self, payment_hash: &Hash256) -> Option<Hash256>;
}

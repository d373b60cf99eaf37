use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use super::{
    ChannelSeedStore, ChannelStore, GraphStore, PaymentStore, PeerStore, StateExport, StoreError,
};
use crate::{
    invoice::{Invoice, InvoiceError, InvoiceStatus, InvoiceStore, PreimageStore},
    lightning::{
        channel::ChannelActorState,
        graph::{ChannelInfo, NodeInfo},
        network::PeerRecord,
        payment::PaymentRecord,
        serde_utils::SliceHex,
        types::{Hash256, Pubkey, ShortChannelId},
    },
};

#[derive(Default)]
struct Collections {
    channels: HashMap<Hash256, ChannelActorState>,
    peers: HashMap<Pubkey, PeerRecord>,
    payments: HashMap<Hash256, PaymentRecord>,
    preimages: HashMap<Hash256, Hash256>,
    invoices: HashMap<Hash256, (Invoice, InvoiceStatus)>,
    channel_seeds: HashMap<Hash256, [u8; 32]>,
    nodes: HashMap<Pubkey, NodeInfo>,
    graph_channels: HashMap<ShortChannelId, ChannelInfo>,
}

#[derive(Serialize, Deserialize)]
struct PreimageEntry {
    payment_hash: Hash256,
    preimage: Hash256,
}

#[derive(Serialize, Deserialize)]
struct InvoiceEntry {
    invoice: Invoice,
    status: InvoiceStatus,
}

#[serde_as]
#[derive(Serialize, Deserialize)]
struct ChannelSeedEntry {
    temporary_id: Hash256,
    #[serde_as(as = "SliceHex")]
    seed: [u8; 32],
}

/// The exported form of the whole store, one array per collection.
#[derive(Serialize, Deserialize, Default)]
#[serde(default)]
struct Snapshot {
    channels: Vec<ChannelActorState>,
    peers: Vec<PeerRecord>,
    payments: Vec<PaymentRecord>,
    preimages: Vec<PreimageEntry>,
    invoices: Vec<InvoiceEntry>,
    channel_seeds: Vec<ChannelSeedEntry>,
    nodes: Vec<NodeInfo>,
    graph_channels: Vec<ChannelInfo>,
}

/// Store keeping everything in memory, shared between clones.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Collections>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail with [`StoreError::WriteFailed`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn read(&self) -> RwLockReadGuard<'_, Collections> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self, what: &str) -> Result<RwLockWriteGuard<'_, Collections>, StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::WriteFailed(what.to_string()));
        }
        Ok(self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

impl ChannelStore for MemoryStore {
    fn save_channel(&self, state: &ChannelActorState) -> Result<(), StoreError> {
        self.write("channel")?
            .channels
            .insert(state.id, state.clone());
        Ok(())
    }

    fn find_channel_by_id(&self, id: &Hash256) -> Result<Option<ChannelActorState>, StoreError> {
        Ok(self.read().channels.get(id).cloned())
    }

    fn find_all_channels(&self) -> Result<Vec<ChannelActorState>, StoreError> {
        Ok(self.read().channels.values().cloned().collect())
    }

    fn delete_channel(&self, id: &Hash256) -> Result<(), StoreError> {
        self.write("channel")?.channels.remove(id);
        Ok(())
    }
}

impl PeerStore for MemoryStore {
    fn save_peer(&self, peer: &PeerRecord) -> Result<(), StoreError> {
        self.write("peer")?.peers.insert(peer.pubkey, peer.clone());
        Ok(())
    }

    fn find_peer(&self, pubkey: &Pubkey) -> Result<Option<PeerRecord>, StoreError> {
        Ok(self.read().peers.get(pubkey).cloned())
    }

    fn find_all_peers(&self) -> Result<Vec<PeerRecord>, StoreError> {
        Ok(self.read().peers.values().cloned().collect())
    }

    fn delete_peer(&self, pubkey: &Pubkey) -> Result<(), StoreError> {
        self.write("peer")?.peers.remove(pubkey);
        Ok(())
    }
}

impl PaymentStore for MemoryStore {
    fn save_payment(&self, payment: &PaymentRecord) -> Result<(), StoreError> {
        self.write("payment")?
            .payments
            .insert(payment.payment_hash, payment.clone());
        Ok(())
    }

    fn find_payment(&self, payment_hash: &Hash256) -> Result<Option<PaymentRecord>, StoreError> {
        Ok(self.read().payments.get(payment_hash).cloned())
    }

    fn find_all_payments(&self) -> Result<Vec<PaymentRecord>, StoreError> {
        Ok(self.read().payments.values().cloned().collect())
    }
}

impl ChannelSeedStore for MemoryStore {
    fn save_channel_seed(&self, temporary_id: &Hash256, seed: [u8; 32]) -> Result<(), StoreError> {
        self.write("channel seed")?
            .channel_seeds
            .insert(*temporary_id, seed);
        Ok(())
    }

    fn find_channel_seed(&self, temporary_id: &Hash256) -> Option<[u8; 32]> {
        self.read().channel_seeds.get(temporary_id).copied()
    }
}

impl GraphStore for MemoryStore {
    fn save_node(&self, node: &NodeInfo) -> Result<(), StoreError> {
        self.write("node")?.nodes.insert(node.node_id, node.clone());
        Ok(())
    }

    fn delete_node(&self, node_id: &Pubkey) -> Result<(), StoreError> {
        self.write("node")?.nodes.remove(node_id);
        Ok(())
    }

    fn find_all_nodes(&self) -> Result<Vec<NodeInfo>, StoreError> {
        Ok(self.read().nodes.values().cloned().collect())
    }

    fn save_graph_channel(&self, channel: &ChannelInfo) -> Result<(), StoreError> {
        self.write("graph channel")?
            .graph_channels
            .insert(channel.short_channel_id, channel.clone());
        Ok(())
    }

    fn delete_graph_channel(&self, short_channel_id: &ShortChannelId) -> Result<(), StoreError> {
        self.write("graph channel")?
            .graph_channels
            .remove(short_channel_id);
        Ok(())
    }

    fn find_all_graph_channels(&self) -> Result<Vec<ChannelInfo>, StoreError> {
        Ok(self.read().graph_channels.values().cloned().collect())
    }
}

impl InvoiceStore for MemoryStore {
    fn get_invoice(&self, id: &Hash256) -> Option<Invoice> {
        self.read().invoices.get(id).map(|(invoice, _)| invoice.clone())
    }

    fn insert_invoice(
        &self,
        invoice: Invoice,
        preimage: Option<Hash256>,
    ) -> Result<(), InvoiceError> {
        let payment_hash = invoice.payment_hash();
        let mut collections = self.write("invoice")?;
        if collections.invoices.contains_key(&payment_hash) {
            return Err(InvoiceError::DuplicatedInvoice(payment_hash));
        }
        collections
            .invoices
            .insert(payment_hash, (invoice, InvoiceStatus::Open));
        if let Some(preimage) = preimage {
            collections.preimages.insert(payment_hash, preimage);
        }
        Ok(())
    }

    fn update_invoice_status(
        &self,
        id: &Hash256,
        status: InvoiceStatus,
    ) -> Result<(), InvoiceError> {
        let mut collections = self.write("invoice status")?;
        let entry = collections
            .invoices
            .get_mut(id)
            .ok_or(InvoiceError::InvoiceNotFound)?;
        entry.1 = status;
        Ok(())
    }

    fn get_invoice_status(&self, id: &Hash256) -> Option<InvoiceStatus> {
        self.read().invoices.get(id).map(|(_, status)| *status)
    }
}

impl PreimageStore for MemoryStore {
    fn insert_preimage(&self, payment_hash: Hash256, preimage: Hash256) -> Result<(), StoreError> {
        self.write("preimage")?
            .preimages
            .insert(payment_hash, preimage);
        Ok(())
    }

    fn remove_preimage(&self, payment_hash: &Hash256) -> Result<(), StoreError> {
        self.write("preimage")?.preimages.remove(payment_hash);
        Ok(())
    }

    fn get_preimage(&self, payment_hash: &Hash256) -> Option<Hash256> {
        self.read().preimages.get(payment_hash).copied()
    }
}

impl StateExport for MemoryStore {
    fn export_data(&self) -> Result<serde_json::Value, StoreError> {
        let collections = self.read();
        let snapshot = Snapshot {
            channels: collections.channels.values().cloned().collect(),
            peers: collections.peers.values().cloned().collect(),
            payments: collections.payments.values().cloned().collect(),
            preimages: collections
                .preimages
                .iter()
                .map(|(payment_hash, preimage)| PreimageEntry {
                    payment_hash: *payment_hash,
                    preimage: *preimage,
                })
                .collect(),
            invoices: collections
                .invoices
                .values()
                .map(|(invoice, status)| InvoiceEntry {
                    invoice: invoice.clone(),
                    status: *status,
                })
                .collect(),
            channel_seeds: collections
                .channel_seeds
                .iter()
                .map(|(temporary_id, seed)| ChannelSeedEntry {
                    temporary_id: *temporary_id,
                    seed: *seed,
                })
                .collect(),
            nodes: collections.nodes.values().cloned().collect(),
            graph_channels: collections.graph_channels.values().cloned().collect(),
        };
        serde_json::to_value(snapshot).map_err(|err| StoreError::Serialization(err.to_string()))
    }

    fn import_data(&self, data: &serde_json::Value) -> Result<(), StoreError> {
        let snapshot: Snapshot = serde_json::from_value(data.clone())
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        let mut collections = self.write("import")?;
        *collections = Collections {
            channels: snapshot.channels.into_iter().map(|c| (c.id, c)).collect(),
            peers: snapshot.peers.into_iter().map(|p| (p.pubkey, p)).collect(),
            payments: snapshot
                .payments
                .into_iter()
                .map(|p| (p.payment_hash, p))
                .collect(),
            preimages: snapshot
                .preimages
                .into_iter()
                .map(|e| (e.payment_hash, e.preimage))
                .collect(),
            invoices: snapshot
                .invoices
                .into_iter()
                .map(|e| (e.invoice.payment_hash(), (e.invoice, e.status)))
                .collect(),
            channel_seeds: snapshot
                .channel_seeds
                .into_iter()
                .map(|e| (e.temporary_id, e.seed))
                .collect(),
            nodes: snapshot.nodes.into_iter().map(|n| (n.node_id, n)).collect(),
            graph_channels: snapshot
                .graph_channels
                .into_iter()
                .map(|c| (c.short_channel_id, c))
                .collect(),
        };
        Ok(())
    }

    fn clear_all(&self) -> Result<(), StoreError> {
        *self.write("clear")? = Collections::default();
        Ok(())
    }
}

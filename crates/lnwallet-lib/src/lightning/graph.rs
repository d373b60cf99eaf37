use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
};

use secp256k1::{Message, SECP256K1};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use thiserror::Error;
use tracing::{debug, trace, warn};

use super::{
    config::LightningConfig,
    get_chain_hash,
    serde_utils::SliceHex,
    trampoline::RoutingMode,
    types::{sha256, Hash256, Pubkey, ShortChannelId, Signature64},
    wire::{self, ChannelAnnouncement, ChannelUpdate, LightningMessage, NodeAnnouncement},
};
use crate::{
    now_timestamp_as_millis_u64,
    store::{GraphStore, StoreError},
};

/// Onion packets can not describe routes longer than this.
pub const MAX_ROUTE_HOPS: usize = 20;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathFindError {
    #[error("No route found to {0}")]
    NoRouteFound(Pubkey),
    #[error("Amount must be greater than zero")]
    InvalidAmount,
    #[error("Source and target are the same node")]
    SameSourceAndTarget,
    #[error("Not enough graph data: {nodes} nodes, {channels} channels")]
    InsufficientGraphData { nodes: usize, channels: usize },
    #[error("No trampoline route available")]
    NoTrampolineRouteAvailable,
    #[error("Trampoline fee {fee_msat} msat exceeds the limit of {limit_msat} msat")]
    TrampolineFeeTooHigh { fee_msat: u64, limit_msat: u64 },
    #[error("Route would need {0} trampoline hops")]
    TooManyTrampolineHops(usize),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GossipError {
    #[error("Invalid signature on {0}")]
    InvalidSignature(&'static str),
    #[error("Gossip for chain {0} ignored")]
    ChainHashMismatch(Hash256),
    #[error("Unknown channel {0}")]
    UnknownChannel(ShortChannelId),
    #[error("Unknown node {0}")]
    UnknownNode(Pubkey),
    #[error("Outdated {0}")]
    Outdated(&'static str),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Details about a node in the network, known from the node announcement.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: Pubkey,
    #[serde_as(as = "SliceHex")]
    pub features: Vec<u8>,
    #[serde_as(as = "SliceHex")]
    pub alias: [u8; 32],
    #[serde_as(as = "SliceHex")]
    pub addresses: Vec<u8>,
    /// Seconds since the epoch, as set by the node in its announcement.
    pub timestamp: u64,
}

impl NodeInfo {
    pub fn alias(&self) -> String {
        let end = self
            .alias
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.alias.len());
        String::from_utf8_lossy(&self.alias[..end]).into_owned()
    }
}

/// The routing policy one end of a channel announced for its direction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelUpdateInfo {
    /// Seconds since the epoch, from the channel update.
    pub timestamp: u64,
    /// Whether the channel can be currently used for payments (in this one direction).
    pub enabled: bool,
    /// The difference in CLTV values that you must have when routing through this channel.
    pub cltv_expiry_delta: u16,
    /// The minimum value, which must be relayed to the next hop via the channel
    pub htlc_minimum_msat: u64,
    /// The maximum value which may be relayed to the next hop via the channel.
    pub htlc_maximum_msat: u64,
    pub fee_base_msat: u64,
    pub fee_proportional_millionths: u64,
}

impl ChannelUpdateInfo {
    pub fn fee_for(&self, amount_msat: u64) -> u64 {
        self.fee_base_msat
            .saturating_add(amount_msat.saturating_mul(self.fee_proportional_millionths) / 1_000_000)
    }

    fn from_update(update: &ChannelUpdate) -> Self {
        Self {
            timestamp: update.timestamp as u64,
            enabled: !update.is_disabled(),
            cltv_expiry_delta: update.cltv_expiry_delta,
            htlc_minimum_msat: update.htlc_minimum_msat,
            htlc_maximum_msat: update.htlc_maximum_msat,
            fee_base_msat: update.fee_base_msat as u64,
            fee_proportional_millionths: update.fee_proportional_millionths as u64,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub short_channel_id: ShortChannelId,
    pub node_1: Pubkey,
    pub node_2: Pubkey,
    /// Funding amount, when known. Announcements do not carry it.
    pub capacity_sat: Option<u64>,
    /// Policy of `node_1` for payments towards `node_2`.
    pub one_to_two: Option<ChannelUpdateInfo>,
    pub two_to_one: Option<ChannelUpdateInfo>,
    /// Our own channels are never pruned and are usable without any update.
    pub is_local: bool,
    /// Seconds since the epoch at which we learned about the channel.
    pub timestamp: u64,
}

impl ChannelInfo {
    /// Timestamp of the most recent information we have about this channel.
    pub fn last_update(&self) -> u64 {
        [&self.one_to_two, &self.two_to_one]
            .into_iter()
            .flatten()
            .map(|u| u.timestamp)
            .fold(self.timestamp, u64::max)
    }

    /// The policy applied when `from` forwards over this channel.
    pub fn policy_from(&self, from: &Pubkey) -> Option<&ChannelUpdateInfo> {
        if *from == self.node_1 {
            self.one_to_two.as_ref()
        } else if *from == self.node_2 {
            self.two_to_one.as_ref()
        } else {
            None
        }
    }

    pub fn other_end(&self, node: &Pubkey) -> Option<Pubkey> {
        if *node == self.node_1 {
            Some(self.node_2)
        } else if *node == self.node_2 {
            Some(self.node_1)
        } else {
            None
        }
    }
}

/// One leg of a route.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHop {
    /// The node this leg reaches.
    pub node_id: Pubkey,
    /// `None` when the leg is left to a trampoline node to route.
    pub short_channel_id: Option<ShortChannelId>,
    /// Amount `node_id` receives, its own forwarding fee included.
    pub amount_msat: u64,
    /// CLTV delta `node_id` requires to forward further, zero for the recipient.
    pub cltv_expiry_delta: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub mode: RoutingMode,
    pub hops: Vec<RouteHop>,
    /// Amount delivered to the recipient.
    pub amount_msat: u64,
    pub fee_msat: u64,
    /// Sum of the hop deltas plus the final delta of the recipient.
    pub cltv_expiry_delta: u32,
}

impl Route {
    pub fn first_hop(&self) -> Option<Pubkey> {
        self.hops.first().map(|h| h.node_id)
    }

    pub fn target(&self) -> Option<Pubkey> {
        self.hops.last().map(|h| h.node_id)
    }

    /// What the sender has to put into the first HTLC.
    pub fn total_amount_msat(&self) -> u64 {
        self.amount_msat + self.fee_msat
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GraphSettings {
    pub staleness_seconds: u64,
    pub min_nodes: usize,
    pub min_channels: usize,
}

impl From<&LightningConfig> for GraphSettings {
    fn from(config: &LightningConfig) -> Self {
        Self {
            staleness_seconds: config.gossip_staleness_seconds(),
            min_nodes: config.min_graph_nodes(),
            min_channels: config.min_graph_channels(),
        }
    }
}

/// Double SHA-256 of the signed part of a gossip message, i.e. everything after the
/// message type and the signatures.
pub fn gossip_digest(message: &LightningMessage) -> Option<Hash256> {
    let skip = match message {
        LightningMessage::ChannelAnnouncement(_) => 2 + 4 * 64,
        LightningMessage::NodeAnnouncement(_) | LightningMessage::ChannelUpdate(_) => 2 + 64,
        _ => return None,
    };
    let bytes = wire::encode(message);
    Some(sha256(sha256(&bytes[skip..]).as_ref()))
}

fn check_signature(
    pubkey: &Pubkey,
    digest: &Hash256,
    signature: &Signature64,
    what: &'static str,
) -> Result<(), GossipError> {
    let signature = signature
        .to_ecdsa()
        .map_err(|_| GossipError::InvalidSignature(what))?;
    SECP256K1
        .verify_ecdsa(
            &Message::from_digest(*digest.as_bytes()),
            &signature,
            &pubkey.to_public_key(),
        )
        .map_err(|_| GossipError::InvalidSignature(what))
}

fn now_seconds() -> u64 {
    now_timestamp_as_millis_u64() / 1000
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct SearchKey {
    cost: u64,
    hops: usize,
    cltv: u32,
}

#[derive(Clone, Debug)]
struct NodeLabel {
    key: SearchKey,
    /// Amount this node has to receive for the payment to reach the target.
    amount_msat: u64,
    /// Delta this node adds when forwarding towards `next`.
    cltv_expiry_delta: u16,
    next: Option<(Pubkey, ShortChannelId)>,
}

/// The wallet's view of the public network, fed by gossip and by our own channels.
#[derive(Debug)]
pub struct NetworkGraph<S> {
    channels: HashMap<ShortChannelId, ChannelInfo>,
    nodes: HashMap<Pubkey, NodeInfo>,
    settings: GraphSettings,
    store: S,
}

impl<S> NetworkGraph<S>
where
    S: GraphStore + Send + Sync + 'static,
{
    pub fn new(store: S, settings: GraphSettings) -> Result<Self, StoreError> {
        let mut network_graph = Self {
            channels: HashMap::new(),
            nodes: HashMap::new(),
            settings,
            store,
        };
        network_graph.load_from_store()?;
        Ok(network_graph)
    }

    fn load_from_store(&mut self) -> Result<(), StoreError> {
        for channel in self.store.find_all_graph_channels()? {
            self.channels.insert(channel.short_channel_id, channel);
        }
        for node in self.store.find_all_nodes()? {
            self.nodes.insert(node.node_id, node);
        }
        debug!(
            "Loaded network graph with {} nodes and {} channels",
            self.nodes.len(),
            self.channels.len()
        );
        Ok(())
    }

    pub fn settings(&self) -> &GraphSettings {
        &self.settings
    }

    fn is_stale_at(&self, last_update: u64, now: u64) -> bool {
        now.saturating_sub(last_update) > self.settings.staleness_seconds
    }

    fn channel_is_fresh(&self, channel: &ChannelInfo, now: u64) -> bool {
        channel.is_local || !self.is_stale_at(channel.last_update(), now)
    }

    pub fn get_node(&self, node_id: &Pubkey) -> Option<&NodeInfo> {
        let now = now_seconds();
        self.nodes
            .get(node_id)
            .filter(|node| !self.is_stale_at(node.timestamp, now))
    }

    pub fn get_channel(&self, short_channel_id: &ShortChannelId) -> Option<&ChannelInfo> {
        let now = now_seconds();
        self.channels
            .get(short_channel_id)
            .filter(|channel| self.channel_is_fresh(channel, now))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        let now = now_seconds();
        self.nodes
            .values()
            .filter(move |node| !self.is_stale_at(node.timestamp, now))
    }

    pub fn channels(&self) -> impl Iterator<Item = &ChannelInfo> {
        let now = now_seconds();
        self.channels
            .values()
            .filter(move |channel| self.channel_is_fresh(channel, now))
    }

    pub fn node_count(&self) -> usize {
        self.nodes().count()
    }

    pub fn channel_count(&self) -> usize {
        self.channels().count()
    }

    /// Whether we know enough of the network to compute routes ourselves.
    pub fn has_sufficient_data(&self) -> bool {
        self.node_count() >= self.settings.min_nodes
            && self.channel_count() >= self.settings.min_channels
    }

    /// Remove everything not refreshed within the staleness window. Returns the number
    /// of nodes and channels removed.
    pub fn prune_stale(&mut self) -> (usize, usize) {
        self.prune_stale_at(now_seconds())
    }

    pub fn prune_stale_at(&mut self, now: u64) -> (usize, usize) {
        let stale_channels: Vec<ShortChannelId> = self
            .channels
            .values()
            .filter(|channel| !self.channel_is_fresh(channel, now))
            .map(|channel| channel.short_channel_id)
            .collect();
        for short_channel_id in &stale_channels {
            self.channels.remove(short_channel_id);
            if let Err(err) = self.store.delete_graph_channel(short_channel_id) {
                warn!("Failed to delete stale channel {}: {}", short_channel_id, err);
            }
        }
        let stale_nodes: Vec<Pubkey> = self
            .nodes
            .values()
            .filter(|node| self.is_stale_at(node.timestamp, now))
            .map(|node| node.node_id)
            .collect();
        for node_id in &stale_nodes {
            self.nodes.remove(node_id);
            if let Err(err) = self.store.delete_node(node_id) {
                warn!("Failed to delete stale node {}: {}", node_id, err);
            }
        }
        if !stale_channels.is_empty() || !stale_nodes.is_empty() {
            debug!(
                "Pruned {} stale nodes and {} stale channels",
                stale_nodes.len(),
                stale_channels.len()
            );
        }
        (stale_nodes.len(), stale_channels.len())
    }

    pub fn process_channel_announcement(
        &mut self,
        announcement: &ChannelAnnouncement,
    ) -> Result<bool, GossipError> {
        if announcement.chain_hash != get_chain_hash() {
            return Err(GossipError::ChainHashMismatch(announcement.chain_hash));
        }
        if self.channels.contains_key(&announcement.short_channel_id) {
            trace!(
                "Ignoring known channel announcement {}",
                announcement.short_channel_id
            );
            return Ok(false);
        }
        let message = LightningMessage::ChannelAnnouncement(announcement.clone());
        let digest = gossip_digest(&message).expect("channel announcement is gossip");
        check_signature(
            &announcement.node_id_1,
            &digest,
            &announcement.node_signature_1,
            "channel_announcement",
        )?;
        check_signature(
            &announcement.node_id_2,
            &digest,
            &announcement.node_signature_2,
            "channel_announcement",
        )?;
        check_signature(
            &announcement.bitcoin_key_1,
            &digest,
            &announcement.bitcoin_signature_1,
            "channel_announcement",
        )?;
        check_signature(
            &announcement.bitcoin_key_2,
            &digest,
            &announcement.bitcoin_signature_2,
            "channel_announcement",
        )?;
        let channel = ChannelInfo {
            short_channel_id: announcement.short_channel_id,
            node_1: announcement.node_id_1,
            node_2: announcement.node_id_2,
            capacity_sat: None,
            one_to_two: None,
            two_to_one: None,
            is_local: false,
            timestamp: now_seconds(),
        };
        self.add_channel(channel)?;
        Ok(true)
    }

    pub fn process_node_announcement(
        &mut self,
        announcement: &NodeAnnouncement,
    ) -> Result<bool, GossipError> {
        let node_id = announcement.node_id;
        if !self
            .channels
            .values()
            .any(|c| c.node_1 == node_id || c.node_2 == node_id)
        {
            return Err(GossipError::UnknownNode(node_id));
        }
        if let Some(existing) = self.nodes.get(&node_id) {
            if existing.timestamp >= announcement.timestamp as u64 {
                return Err(GossipError::Outdated("node_announcement"));
            }
        }
        let message = LightningMessage::NodeAnnouncement(announcement.clone());
        let digest = gossip_digest(&message).expect("node announcement is gossip");
        check_signature(
            &node_id,
            &digest,
            &announcement.signature,
            "node_announcement",
        )?;
        self.add_node(NodeInfo {
            node_id,
            features: announcement.features.clone(),
            alias: announcement.alias,
            addresses: announcement.addresses.clone(),
            timestamp: announcement.timestamp as u64,
        })?;
        Ok(true)
    }

    pub fn process_channel_update(&mut self, update: &ChannelUpdate) -> Result<bool, GossipError> {
        if update.chain_hash != get_chain_hash() {
            return Err(GossipError::ChainHashMismatch(update.chain_hash));
        }
        let channel = self
            .channels
            .get(&update.short_channel_id)
            .ok_or(GossipError::UnknownChannel(update.short_channel_id))?;
        let (signer, existing) = match update.direction() {
            0 => (channel.node_1, &channel.one_to_two),
            _ => (channel.node_2, &channel.two_to_one),
        };
        if let Some(existing) = existing {
            if existing.timestamp >= update.timestamp as u64 {
                return Err(GossipError::Outdated("channel_update"));
            }
        }
        let message = LightningMessage::ChannelUpdate(update.clone());
        let digest = gossip_digest(&message).expect("channel update is gossip");
        check_signature(&signer, &digest, &update.signature, "channel_update")?;

        let mut channel = channel.clone();
        let info = ChannelUpdateInfo::from_update(update);
        match update.direction() {
            0 => channel.one_to_two = Some(info),
            _ => channel.two_to_one = Some(info),
        }
        self.store.save_graph_channel(&channel)?;
        self.channels.insert(channel.short_channel_id, channel);
        Ok(true)
    }

    /// Dispatch a gossip message to the matching handler. Returns whether the graph changed.
    pub fn process_gossip(&mut self, message: &LightningMessage) -> Result<bool, GossipError> {
        match message {
            LightningMessage::ChannelAnnouncement(m) => self.process_channel_announcement(m),
            LightningMessage::NodeAnnouncement(m) => self.process_node_announcement(m),
            LightningMessage::ChannelUpdate(m) => self.process_channel_update(m),
            _ => Ok(false),
        }
    }

    pub fn add_node(&mut self, node: NodeInfo) -> Result<(), StoreError> {
        self.store.save_node(&node)?;
        self.nodes.insert(node.node_id, node);
        Ok(())
    }

    pub fn add_channel(&mut self, channel: ChannelInfo) -> Result<(), StoreError> {
        self.store.save_graph_channel(&channel)?;
        self.channels.insert(channel.short_channel_id, channel);
        Ok(())
    }

    /// Register one of our own channels, which may never be announced.
    pub fn add_local_channel(
        &mut self,
        short_channel_id: ShortChannelId,
        local: Pubkey,
        remote: Pubkey,
        capacity_sat: u64,
    ) -> Result<(), StoreError> {
        let (node_1, node_2) = if local < remote {
            (local, remote)
        } else {
            (remote, local)
        };
        let existing = self.channels.get(&short_channel_id).cloned();
        let channel = ChannelInfo {
            short_channel_id,
            node_1,
            node_2,
            capacity_sat: Some(capacity_sat),
            one_to_two: existing.as_ref().and_then(|c| c.one_to_two.clone()),
            two_to_one: existing.as_ref().and_then(|c| c.two_to_one.clone()),
            is_local: true,
            timestamp: now_seconds(),
        };
        self.add_channel(channel)
    }

    pub fn remove_channel(&mut self, short_channel_id: &ShortChannelId) -> Result<(), StoreError> {
        self.store.delete_graph_channel(short_channel_id)?;
        self.channels.remove(short_channel_id);
        Ok(())
    }

    /// Cheapest route delivering `amount_msat` from `source` to `target`.
    ///
    /// Edges are weighted by the forwarding fee plus the CLTV delta of the forwarding
    /// node; ties are broken by fewer hops, then by lower total CLTV delta. Stale
    /// entries are pruned before searching.
    pub fn find_route(
        &mut self,
        source: Pubkey,
        target: Pubkey,
        amount_msat: u64,
        final_cltv_expiry_delta: u16,
    ) -> Result<Route, PathFindError> {
        if amount_msat == 0 {
            return Err(PathFindError::InvalidAmount);
        }
        if source == target {
            return Err(PathFindError::SameSourceAndTarget);
        }
        self.prune_stale();

        let mut adjacency: HashMap<Pubkey, Vec<&ChannelInfo>> = HashMap::new();
        for channel in self.channels.values() {
            adjacency.entry(channel.node_1).or_default().push(channel);
            adjacency.entry(channel.node_2).or_default().push(channel);
        }

        // Searching backwards from the target lets every node know the exact amount it
        // has to forward, which fees depend on.
        let mut labels: HashMap<Pubkey, NodeLabel> = HashMap::new();
        let mut queue = BinaryHeap::new();
        let start = SearchKey {
            cost: 0,
            hops: 0,
            cltv: final_cltv_expiry_delta as u32,
        };
        labels.insert(
            target,
            NodeLabel {
                key: start,
                amount_msat,
                cltv_expiry_delta: 0,
                next: None,
            },
        );
        queue.push(Reverse((start, target)));

        while let Some(Reverse((key, node))) = queue.pop() {
            let Some(label) = labels.get(&node) else {
                continue;
            };
            if label.key < key {
                continue;
            }
            if node == source {
                break;
            }
            if key.hops >= MAX_ROUTE_HOPS {
                continue;
            }
            let amount_to_forward = label.amount_msat;
            for channel in adjacency.get(&node).into_iter().flatten() {
                let Some(from) = channel.other_end(&node) else {
                    continue;
                };
                let policy = channel.policy_from(&from);
                let (fee, delta) = match policy {
                    Some(policy) => {
                        if !policy.enabled
                            || amount_to_forward < policy.htlc_minimum_msat
                            || (policy.htlc_maximum_msat != 0
                                && amount_to_forward > policy.htlc_maximum_msat)
                        {
                            continue;
                        }
                        if from == source {
                            (0, 0)
                        } else {
                            (policy.fee_for(amount_to_forward), policy.cltv_expiry_delta)
                        }
                    }
                    None if channel.is_local && from == source => (0, 0),
                    None => continue,
                };
                if let Some(capacity_sat) = channel.capacity_sat {
                    if amount_to_forward > capacity_sat.saturating_mul(1000) {
                        continue;
                    }
                }
                let next_key = SearchKey {
                    cost: key.cost.saturating_add(fee).saturating_add(delta as u64),
                    hops: key.hops + 1,
                    cltv: key.cltv + delta as u32,
                };
                let better = labels
                    .get(&from)
                    .map_or(true, |existing| next_key < existing.key);
                if better {
                    labels.insert(
                        from,
                        NodeLabel {
                            key: next_key,
                            amount_msat: amount_to_forward + fee,
                            cltv_expiry_delta: delta,
                            next: Some((node, channel.short_channel_id)),
                        },
                    );
                    queue.push(Reverse((next_key, from)));
                }
            }
        }

        let source_label = labels
            .get(&source)
            .ok_or(PathFindError::NoRouteFound(target))?;
        let mut hops = Vec::new();
        let mut cursor = source_label.next;
        while let Some((node, short_channel_id)) = cursor {
            let label = &labels[&node];
            hops.push(RouteHop {
                node_id: node,
                short_channel_id: Some(short_channel_id),
                amount_msat: label.amount_msat,
                cltv_expiry_delta: label.cltv_expiry_delta,
            });
            cursor = label.next;
        }
        let route = Route {
            mode: RoutingMode::Local,
            amount_msat,
            fee_msat: source_label.amount_msat - amount_msat,
            cltv_expiry_delta: source_label.key.cltv,
            hops,
        };
        debug!(
            "Found route to {} with {} hops, fee {} msat",
            target,
            route.hops.len(),
            route.fee_msat
        );
        Ok(route)
    }

    #[cfg(test)]
    pub fn reset(&mut self) {
        self.channels.clear();
        self.nodes.clear();
    }
}

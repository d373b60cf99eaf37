//! Route selection between our own graph and trusted trampoline nodes.
//!
//! A wallet rarely knows enough of the network to find routes itself. When the local
//! graph is below its density floor, or when trampoline routing is forced, the payment
//! is handed to one of the trusted trampoline nodes we are connected to, which finds the
//! rest of the route. Every switch between the two modes is published so that other
//! components can react without polling.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast::error::RecvError, watch, RwLock};
use tracing::{debug, info, warn};

use super::{
    config::LightningConfig,
    events::{EventBus, WalletEvent},
    graph::{NetworkGraph, PathFindError, Route, RouteHop},
    transport::ConnectionState,
    types::{NodeAddress, Pubkey},
};
use crate::{store::GraphStore, tasks::TaskTrackerWithCancellation};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoutingMode {
    #[default]
    Local,
    Trampoline,
}

/// Fees and limits of trampoline routing. The fee policy is the one advertised by the
/// trusted node set.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrampolinePolicy {
    pub enabled: bool,
    pub forced: bool,
    pub fee_base_msat: u64,
    pub fee_proportional_millionths: u64,
    pub cltv_expiry_delta: u16,
    pub max_fee_percent: f64,
    pub max_hops: usize,
}

impl TrampolinePolicy {
    pub fn fee_for(&self, amount_msat: u64) -> u64 {
        self.fee_base_msat
            .saturating_add(amount_msat.saturating_mul(self.fee_proportional_millionths) / 1_000_000)
    }

    pub fn fee_limit_for(&self, amount_msat: u64) -> u64 {
        (amount_msat as f64 * self.max_fee_percent / 100.0) as u64
    }
}

impl From<&LightningConfig> for TrampolinePolicy {
    fn from(config: &LightningConfig) -> Self {
        Self {
            enabled: config.trampoline_enabled(),
            forced: config.trampoline_forced(),
            fee_base_msat: config.trampoline_fee_base_msat(),
            fee_proportional_millionths: config.trampoline_fee_proportional_millionths(),
            cltv_expiry_delta: config.trampoline_cltv_expiry_delta(),
            max_fee_percent: config.max_trampoline_fee_percent(),
            max_hops: config.max_trampoline_hops(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrampolineNode {
    pub address: NodeAddress,
    /// Whether we currently hold an established session with the node.
    pub reachable: bool,
}

pub struct TrampolineRouter<S> {
    local_pubkey: Pubkey,
    graph: Arc<RwLock<NetworkGraph<S>>>,
    policy: TrampolinePolicy,
    // Kept in configuration order, which is the order of preference.
    nodes: RwLock<Vec<TrampolineNode>>,
    mode: watch::Sender<RoutingMode>,
    events: EventBus,
}

impl<S> TrampolineRouter<S>
where
    S: GraphStore + Send + Sync + 'static,
{
    pub fn new(
        local_pubkey: Pubkey,
        graph: Arc<RwLock<NetworkGraph<S>>>,
        trusted_nodes: Vec<NodeAddress>,
        policy: TrampolinePolicy,
        events: EventBus,
    ) -> Self {
        let (mode, _) = watch::channel(RoutingMode::Local);
        let nodes = trusted_nodes
            .into_iter()
            .map(|address| TrampolineNode {
                address,
                reachable: false,
            })
            .collect();
        Self {
            local_pubkey,
            graph,
            policy,
            nodes: RwLock::new(nodes),
            mode,
            events,
        }
    }

    pub fn graph(&self) -> &Arc<RwLock<NetworkGraph<S>>> {
        &self.graph
    }

    pub fn policy(&self) -> &TrampolinePolicy {
        &self.policy
    }

    pub fn mode(&self) -> RoutingMode {
        *self.mode.borrow()
    }

    pub fn subscribe_mode(&self) -> watch::Receiver<RoutingMode> {
        self.mode.subscribe()
    }

    pub async fn trusted_nodes(&self) -> Vec<TrampolineNode> {
        self.nodes.read().await.clone()
    }

    pub async fn is_trusted(&self, pubkey: &Pubkey) -> bool {
        self.nodes
            .read()
            .await
            .iter()
            .any(|n| n.address.pubkey == *pubkey)
    }

    pub async fn set_reachable(&self, pubkey: &Pubkey, reachable: bool) {
        let mut nodes = self.nodes.write().await;
        for node in nodes.iter_mut().filter(|n| n.address.pubkey == *pubkey) {
            if node.reachable != reachable {
                debug!(
                    "Trampoline node {} is now {}",
                    pubkey,
                    if reachable { "reachable" } else { "unreachable" }
                );
                node.reachable = reachable;
            }
        }
    }

    fn set_mode(&self, new: RoutingMode) {
        let old = self.mode.send_replace(new);
        if old != new {
            info!("Routing mode changed from {:?} to {:?}", old, new);
            self.events.emit(WalletEvent::RoutingModeChanged { old, new });
        }
    }

    /// Mode the next route would be computed with.
    pub async fn select_mode(&self) -> RoutingMode {
        if !self.policy.enabled {
            return RoutingMode::Local;
        }
        if self.policy.forced {
            return RoutingMode::Trampoline;
        }
        if self.graph.read().await.has_sufficient_data() {
            RoutingMode::Local
        } else {
            RoutingMode::Trampoline
        }
    }

    pub async fn find_route(
        &self,
        target: Pubkey,
        amount_msat: u64,
        final_cltv_expiry_delta: u16,
    ) -> Result<Route, PathFindError> {
        if amount_msat == 0 {
            return Err(PathFindError::InvalidAmount);
        }
        let mode = self.select_mode().await;
        self.set_mode(mode);
        match mode {
            RoutingMode::Local => {
                let mut graph = self.graph.write().await;
                if !self.policy.enabled && !graph.has_sufficient_data() {
                    debug!(
                        "Trampoline routing disabled, searching a sparse graph of {} nodes",
                        graph.node_count()
                    );
                }
                graph.find_route(
                    self.local_pubkey,
                    target,
                    amount_msat,
                    final_cltv_expiry_delta,
                )
            }
            RoutingMode::Trampoline => {
                self.find_trampoline_route(target, amount_msat, final_cltv_expiry_delta)
                    .await
            }
        }
    }

    async fn find_trampoline_route(
        &self,
        target: Pubkey,
        amount_msat: u64,
        final_cltv_expiry_delta: u16,
    ) -> Result<Route, PathFindError> {
        if target == self.local_pubkey {
            return Err(PathFindError::SameSourceAndTarget);
        }
        let nodes = self.nodes.read().await;
        let reachable: Vec<&TrampolineNode> = nodes.iter().filter(|n| n.reachable).collect();

        // Paying a trusted node itself needs no trampoline hop at all.
        if reachable.iter().any(|n| n.address.pubkey == target) {
            return Ok(Route {
                mode: RoutingMode::Trampoline,
                hops: vec![RouteHop {
                    node_id: target,
                    short_channel_id: None,
                    amount_msat,
                    cltv_expiry_delta: 0,
                }],
                amount_msat,
                fee_msat: 0,
                cltv_expiry_delta: final_cltv_expiry_delta as u32,
            });
        }

        let Some(trampoline) = reachable.first() else {
            warn!(
                "None of the {} trusted trampoline nodes is reachable",
                nodes.len()
            );
            return Err(PathFindError::NoTrampolineRouteAvailable);
        };
        let trampoline_hops = 1;
        if trampoline_hops > self.policy.max_hops {
            return Err(PathFindError::TooManyTrampolineHops(trampoline_hops));
        }
        let fee_msat = self.policy.fee_for(amount_msat);
        let limit_msat = self.policy.fee_limit_for(amount_msat);
        if fee_msat > limit_msat {
            return Err(PathFindError::TrampolineFeeTooHigh {
                fee_msat,
                limit_msat,
            });
        }
        debug!(
            "Routing {} msat to {} through trampoline {}",
            amount_msat, target, trampoline.address.pubkey
        );
        Ok(Route {
            mode: RoutingMode::Trampoline,
            hops: vec![
                RouteHop {
                    node_id: trampoline.address.pubkey,
                    short_channel_id: None,
                    amount_msat: amount_msat + fee_msat,
                    cltv_expiry_delta: self.policy.cltv_expiry_delta,
                },
                RouteHop {
                    node_id: target,
                    short_channel_id: None,
                    amount_msat,
                    cltv_expiry_delta: 0,
                },
            ],
            amount_msat,
            fee_msat,
            cltv_expiry_delta: self.policy.cltv_expiry_delta as u32
                + final_cltv_expiry_delta as u32,
        })
    }

    /// Keep the reachability flags in sync with peer connection events until the
    /// tracker is cancelled.
    pub fn track_reachability(self: &Arc<Self>, tracker: &TaskTrackerWithCancellation) {
        let router = Arc::clone(self);
        let mut events = self.events.subscribe();
        tracker.spawn(async move {
            loop {
                match events.recv().await {
                    Ok(WalletEvent::PeerConnectionChanged { peer, state }) => {
                        router
                            .set_reachable(&peer, state == ConnectionState::Established)
                            .await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Trampoline router lagged behind {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }
}

impl TrampolineNode {
    pub fn pubkey(&self) -> &Pubkey {
        &self.address.pubkey
    }
}


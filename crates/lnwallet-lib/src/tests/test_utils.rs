use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use secp256k1::{Message, SECP256K1};
use tokio::sync::{broadcast, RwLock};

use crate::{
    gen_rand_sha256_hash,
    lightning::{
        channel::{AddHtlcCommand, ChannelActorState, ChannelState, FundingFlags, PeerMessageSink},
        coordinator::NetworkSessionCoordinator,
        events::{EventBus, HtlcResolution, WalletEvent},
        get_chain_hash,
        graph::{gossip_digest, GraphSettings, NetworkGraph},
        onchain::{
            ClosingBroadcast, CommitmentBroadcast, FundingOutpoint, FundingRequest, OnChainError,
            OnChainWallet,
        },
        payment::{HtlcDispatcher, OutboundLiquidity, PaymentError},
        readiness::ReadinessTracker,
        transport::TransportError,
        types::{Hash256, Privkey, Pubkey, ShortChannelId, Signature64},
        wire::{tlv::TlvStream, ChannelAnnouncement, ChannelUpdate, LightningMessage, NodeAnnouncement},
        LightningConfig, NetworkService, NetworkServiceParams,
    },
    store::MemoryStore,
    tasks::TaskTrackerWithCancellation,
};

const DEFAULT_WAIT_UNTIL_TIME_MS: u64 = 10_000;
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub fn init_tracing() {
    use std::sync::Once;

    static INIT: Once = Once::new();

    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .pretty()
            .init();
    });
}

pub async fn wait_until_timeout<F, Fut>(max_ms: u64, mut f: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = Instant::now();
    while !f().await {
        if started.elapsed() > Duration::from_millis(max_ms) {
            panic!("Condition not met within {} ms", max_ms);
        }
        tokio::time::sleep(WAIT_POLL_INTERVAL).await;
    }
}

pub async fn wait_until<F, Fut>(f: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    wait_until_timeout(DEFAULT_WAIT_UNTIL_TIME_MS, f).await
}

/// Receive events until `f` maps one to `Some`, panicking after a while.
pub async fn expect_event<T, F>(events: &mut broadcast::Receiver<WalletEvent>, mut f: F) -> T
where
    F: FnMut(&WalletEvent) -> Option<T>,
{
    let deadline = Duration::from_millis(DEFAULT_WAIT_UNTIL_TIME_MS);
    tokio::time::timeout(deadline, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(value) = f(&event) {
                        return value;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("expected event was not emitted in time")
}

pub fn generate_pubkey() -> Pubkey {
    Privkey::generate().pubkey()
}

pub fn sign_digest(key: &Privkey, digest: &Hash256) -> Signature64 {
    SECP256K1
        .sign_ecdsa(&Message::from_digest(*digest.as_bytes()), &key.0)
        .into()
}

/// A channel announcement between two nodes, signed with their node keys. The node
/// keys double as bitcoin keys.
pub fn signed_channel_announcement(
    node_1: &Privkey,
    node_2: &Privkey,
    short_channel_id: ShortChannelId,
) -> ChannelAnnouncement {
    let (node_1, node_2) = if node_1.pubkey() < node_2.pubkey() {
        (node_1, node_2)
    } else {
        (node_2, node_1)
    };
    let mut announcement = ChannelAnnouncement {
        node_signature_1: Signature64([0u8; 64]),
        node_signature_2: Signature64([0u8; 64]),
        bitcoin_signature_1: Signature64([0u8; 64]),
        bitcoin_signature_2: Signature64([0u8; 64]),
        features: vec![],
        chain_hash: get_chain_hash(),
        short_channel_id,
        node_id_1: node_1.pubkey(),
        node_id_2: node_2.pubkey(),
        bitcoin_key_1: node_1.pubkey(),
        bitcoin_key_2: node_2.pubkey(),
        tlvs: TlvStream::new(),
    };
    let digest = gossip_digest(&LightningMessage::ChannelAnnouncement(announcement.clone()))
        .expect("gossip digest");
    announcement.node_signature_1 = sign_digest(node_1, &digest);
    announcement.node_signature_2 = sign_digest(node_2, &digest);
    announcement.bitcoin_signature_1 = sign_digest(node_1, &digest);
    announcement.bitcoin_signature_2 = sign_digest(node_2, &digest);
    announcement
}

pub fn signed_node_announcement(node: &Privkey, alias: &str, timestamp: u32) -> NodeAnnouncement {
    let mut alias_bytes = [0u8; 32];
    alias_bytes[..alias.len()].copy_from_slice(alias.as_bytes());
    let mut announcement = NodeAnnouncement {
        signature: Signature64([0u8; 64]),
        features: vec![],
        timestamp,
        node_id: node.pubkey(),
        rgb_color: [0, 0, 0],
        alias: alias_bytes,
        addresses: vec![],
        tlvs: TlvStream::new(),
    };
    let digest = gossip_digest(&LightningMessage::NodeAnnouncement(announcement.clone()))
        .expect("gossip digest");
    announcement.signature = sign_digest(node, &digest);
    announcement
}

/// A channel update of `from` for the direction `direction` (0 when `from` is
/// `node_id_1` of the announcement).
pub fn signed_channel_update(
    from: &Privkey,
    short_channel_id: ShortChannelId,
    direction: u8,
    timestamp: u32,
    fee_base_msat: u32,
    cltv_expiry_delta: u16,
) -> ChannelUpdate {
    let mut update = ChannelUpdate {
        signature: Signature64([0u8; 64]),
        chain_hash: get_chain_hash(),
        short_channel_id,
        timestamp,
        message_flags: 1,
        channel_flags: direction & 1,
        cltv_expiry_delta,
        htlc_minimum_msat: 1,
        fee_base_msat,
        fee_proportional_millionths: 0,
        htlc_maximum_msat: 0,
        tlvs: TlvStream::new(),
    };
    let digest =
        gossip_digest(&LightningMessage::ChannelUpdate(update.clone())).expect("gossip digest");
    update.signature = sign_digest(from, &digest);
    update
}

pub fn now_seconds() -> u32 {
    (crate::now_timestamp_as_millis_u64() / 1000) as u32
}

/// On-chain wallet recording everything it is asked to do.
#[derive(Default)]
pub struct MockOnChainWallet {
    fail_funding: AtomicBool,
    fail_broadcast: AtomicBool,
    pub funding_requests: Mutex<Vec<FundingRequest>>,
    pub broadcast_fundings: Mutex<Vec<FundingOutpoint>>,
    pub commitments: Mutex<Vec<CommitmentBroadcast>>,
    pub closings: Mutex<Vec<ClosingBroadcast>>,
}

impl MockOnChainWallet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_funding(&self, fail: bool) {
        self.fail_funding.store(fail, Ordering::SeqCst);
    }

    /// Refuse every broadcast until reset.
    pub fn set_fail_broadcast(&self, fail: bool) {
        self.fail_broadcast.store(fail, Ordering::SeqCst);
    }

    fn check_broadcast(&self) -> Result<(), OnChainError> {
        if self.fail_broadcast.load(Ordering::SeqCst) {
            return Err(OnChainError::BroadcastFailed("mempool rejected".to_string()));
        }
        Ok(())
    }

    pub fn commitment_count(&self) -> usize {
        self.commitments.lock().unwrap().len()
    }

    pub fn closing_count(&self) -> usize {
        self.closings.lock().unwrap().len()
    }
}

#[async_trait]
impl OnChainWallet for MockOnChainWallet {
    async fn create_funding_transaction(
        &self,
        request: FundingRequest,
    ) -> Result<FundingOutpoint, OnChainError> {
        if self.fail_funding.load(Ordering::SeqCst) {
            return Err(OnChainError::InsufficientFunds {
                needed: request.amount_sat,
            });
        }
        self.funding_requests.lock().unwrap().push(request);
        Ok(FundingOutpoint {
            txid: gen_rand_sha256_hash(),
            output_index: 0,
        })
    }

    async fn broadcast_funding(&self, funding: FundingOutpoint) -> Result<(), OnChainError> {
        self.check_broadcast()?;
        self.broadcast_fundings.lock().unwrap().push(funding);
        Ok(())
    }

    async fn broadcast_commitment(
        &self,
        commitment: CommitmentBroadcast,
    ) -> Result<Hash256, OnChainError> {
        self.check_broadcast()?;
        self.commitments.lock().unwrap().push(commitment);
        Ok(gen_rand_sha256_hash())
    }

    async fn broadcast_closing(&self, closing: ClosingBroadcast) -> Result<Hash256, OnChainError> {
        self.check_broadcast()?;
        self.closings.lock().unwrap().push(closing);
        Ok(gen_rand_sha256_hash())
    }
}

/// Peer sink keeping every message instead of sending it.
#[derive(Default)]
pub struct RecordingSink {
    pub messages: Mutex<Vec<(Pubkey, LightningMessage)>>,
    pub disconnected: Mutex<Vec<Pubkey>>,
}

impl RecordingSink {
    pub fn sent_types(&self) -> Vec<u16> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|(_, message)| message.msg_type())
            .collect()
    }
}

#[async_trait]
impl PeerMessageSink for RecordingSink {
    async fn send_message(
        &self,
        peer: &Pubkey,
        message: LightningMessage,
    ) -> Result<(), TransportError> {
        self.messages.lock().unwrap().push((*peer, message));
        Ok(())
    }

    async fn disconnect(&self, peer: &Pubkey) {
        self.disconnected.lock().unwrap().push(*peer);
    }
}

#[derive(Clone, Debug)]
pub enum MockHtlcBehavior {
    Fulfill(Hash256),
    Fail(String),
    /// Never resolve the HTLC.
    Hold,
    /// Refuse to offer the HTLC at all.
    Reject(String),
}

/// Dispatcher resolving HTLCs right away according to scripted behaviors.
pub struct MockHtlcDispatcher {
    liquidity: Mutex<Vec<OutboundLiquidity>>,
    behaviors: Mutex<VecDeque<MockHtlcBehavior>>,
    default_behavior: Mutex<MockHtlcBehavior>,
    events: EventBus,
    next_htlc_id: AtomicU64,
    pub dispatched: Mutex<Vec<(Pubkey, AddHtlcCommand)>>,
}

impl MockHtlcDispatcher {
    pub fn new(events: EventBus, liquidity: Vec<OutboundLiquidity>) -> Self {
        Self {
            liquidity: Mutex::new(liquidity),
            behaviors: Mutex::new(VecDeque::new()),
            default_behavior: Mutex::new(MockHtlcBehavior::Hold),
            events,
            next_htlc_id: AtomicU64::new(0),
            dispatched: Mutex::new(vec![]),
        }
    }

    pub fn set_default_behavior(&self, behavior: MockHtlcBehavior) {
        *self.default_behavior.lock().unwrap() = behavior;
    }

    /// Behavior of the next dispatched HTLC, before falling back to the default.
    pub fn push_behavior(&self, behavior: MockHtlcBehavior) {
        self.behaviors.lock().unwrap().push_back(behavior);
    }

    pub fn set_liquidity(&self, liquidity: Vec<OutboundLiquidity>) {
        *self.liquidity.lock().unwrap() = liquidity;
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatched.lock().unwrap().len()
    }
}

#[async_trait]
impl HtlcDispatcher for MockHtlcDispatcher {
    async fn outbound_liquidity(&self) -> Vec<OutboundLiquidity> {
        self.liquidity.lock().unwrap().clone()
    }

    async fn dispatch_htlc(
        &self,
        first_hop: Pubkey,
        command: AddHtlcCommand,
    ) -> Result<(Hash256, u64), PaymentError> {
        let channel_id = self
            .liquidity
            .lock()
            .unwrap()
            .iter()
            .find(|l| l.peer == first_hop)
            .map(|l| l.channel_id)
            .ok_or_else(|| PaymentError::DispatchFailed("no channel with peer".to_string()))?;
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_behavior.lock().unwrap().clone());
        let resolution = match behavior {
            MockHtlcBehavior::Reject(reason) => return Err(PaymentError::DispatchFailed(reason)),
            MockHtlcBehavior::Hold => None,
            MockHtlcBehavior::Fulfill(preimage) => Some(HtlcResolution::Fulfilled { preimage }),
            MockHtlcBehavior::Fail(reason) => Some(HtlcResolution::Failed { reason }),
        };
        let htlc_id = self.next_htlc_id.fetch_add(1, Ordering::SeqCst);
        let payment_hash = command.payment_hash;
        self.dispatched.lock().unwrap().push((first_hop, command));
        if let Some(resolution) = resolution {
            self.events.emit(WalletEvent::HtlcResolved {
                channel_id,
                htlc_id,
                payment_hash,
                resolution,
            });
        }
        Ok((channel_id, htlc_id))
    }
}

pub fn test_lightning_config() -> LightningConfig {
    LightningConfig {
        auto_accept_channels: Some(true),
        connect_timeout_ms: Some(5_000),
        ping_interval_seconds: Some(3_600),
        ..Default::default()
    }
}

pub fn test_graph_settings() -> GraphSettings {
    GraphSettings {
        staleness_seconds: 24 * 60 * 60,
        min_nodes: 1,
        min_channels: 1,
    }
}

/// One wallet core wired together with in-memory dependencies.
pub struct TestNode {
    pub key: Privkey,
    pub store: MemoryStore,
    pub wallet: Arc<MockOnChainWallet>,
    pub coordinator: Arc<NetworkSessionCoordinator>,
    pub readiness: Arc<ReadinessTracker>,
    pub events: EventBus,
    pub tracker: TaskTrackerWithCancellation,
    pub service: Arc<NetworkService<MemoryStore>>,
}

impl TestNode {
    pub fn new() -> Self {
        Self::new_with_config(test_lightning_config())
    }

    pub fn new_with_config(config: LightningConfig) -> Self {
        let key = Privkey::generate();
        let store = MemoryStore::new();
        let wallet = Arc::new(MockOnChainWallet::new());
        let coordinator = Arc::new(NetworkSessionCoordinator::new());
        coordinator.set_wallet_available(true);
        coordinator.set_internet_available(true);
        let events = EventBus::default();
        let readiness = Arc::new(ReadinessTracker::new(events.clone()));
        let tracker = TaskTrackerWithCancellation::new();
        let graph = NetworkGraph::new(store.clone(), GraphSettings::from(&config))
            .expect("create network graph");
        let service = NetworkService::new(NetworkServiceParams {
            config,
            node_key: key.clone(),
            store: store.clone(),
            wallet: Arc::clone(&wallet) as Arc<dyn OnChainWallet>,
            coordinator: Arc::clone(&coordinator),
            graph: Arc::new(RwLock::new(graph)),
            readiness: Arc::clone(&readiness),
            events: events.clone(),
            tracker: tracker.clone(),
        });
        service.start();
        Self {
            key,
            store,
            wallet,
            coordinator,
            readiness,
            events,
            tracker,
            service,
        }
    }

    pub fn pubkey(&self) -> Pubkey {
        self.key.pubkey()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }

    /// Connect to `other` over an in-memory stream and wait for both `init` messages.
    pub async fn connect_to(&self, other: &TestNode) {
        let (outbound, inbound) = tokio::io::duplex(64 * 1024);
        let acceptor = Arc::clone(&other.service);
        let accept = tokio::spawn(async move { acceptor.accept_stream(inbound).await });
        self.service
            .connect_peer_with_stream(other.pubkey(), outbound)
            .await
            .expect("connect to peer");
        let accepted = accept.await.expect("accept task").expect("accept peer");
        assert_eq!(accepted, self.pubkey());

        let (this, that) = (self, other);
        wait_until(move || async move {
            this.service.remote_features(&that.pubkey()).await.is_some()
                && that.service.remote_features(&this.pubkey()).await.is_some()
        })
        .await;
    }

    pub async fn channel_state(&self, channel_id: &Hash256) -> ChannelActorState {
        self.service
            .get_channel_state(channel_id)
            .await
            .expect("get channel state")
    }

    /// Wait until the channel actor reports a state matching `f`.
    pub async fn wait_for_channel_state<F>(&self, channel_id: Hash256, f: F)
    where
        F: Fn(&ChannelState) -> bool,
    {
        let f = &f;
        wait_until(move || async move {
            match self.service.get_channel_state(&channel_id).await {
                Ok(state) => f(&state.state),
                Err(_) => false,
            }
        })
        .await;
    }

    /// Open a channel to `other` and drive it to `Normal`. Returns the final channel id.
    pub async fn open_channel_to(
        &self,
        other: &TestNode,
        funding_satoshis: u64,
        push_msat: u64,
    ) -> Hash256 {
        let mut events = self.subscribe();
        let temporary_id = self
            .service
            .open_channel(other.pubkey(), funding_satoshis, push_msat)
            .await
            .expect("open channel");
        let channel_id = expect_event(&mut events, |event| match event {
            WalletEvent::ChannelIdChanged {
                old_channel_id,
                new_channel_id,
            } if *old_channel_id == temporary_id => Some(*new_channel_id),
            _ => None,
        })
        .await;

        let awaiting_confirmation =
            |state: &ChannelState| *state == ChannelState::FundingSigned(FundingFlags::AWAITING_CONFIRMATION);
        self.wait_for_channel_state(channel_id, awaiting_confirmation)
            .await;
        other
            .wait_for_channel_state(channel_id, awaiting_confirmation)
            .await;

        let short_channel_id = ShortChannelId::new(800_000, rand::random::<u16>() as u32, 0);
        self.service
            .funding_confirmed(&channel_id, short_channel_id)
            .await
            .expect("confirm funding");
        other
            .service
            .funding_confirmed(&channel_id, short_channel_id)
            .await
            .expect("confirm funding");

        let normal = |state: &ChannelState| *state == ChannelState::Normal;
        self.wait_for_channel_state(channel_id, normal).await;
        other.wait_for_channel_state(channel_id, normal).await;
        channel_id
    }
}

impl Default for TestNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Two connected nodes.
pub async fn create_connected_nodes() -> (TestNode, TestNode) {
    let node_a = TestNode::new();
    let node_b = TestNode::new();
    node_a.connect_to(&node_b).await;
    (node_a, node_b)
}

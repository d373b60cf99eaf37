use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use ractor::{rpc::CallResult, Actor, ActorRef, RpcReplyPort};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::RwLock,
};
use tracing::{debug, error, info, trace, warn};

use super::{
    channel::{
        default_channel_reserve, validate_open_params, AcceptChannelParameter, ChannelActor,
        ChannelActorMessage, ChannelActorState, ChannelCommand, ChannelCommandReply, ChannelEvent,
        ChannelInitializationOperation, ChannelRegistry, ChannelState, CloseFlags,
        OpenChannelParameter, PeerMessageSink, ProcessingChannelError, ShutdownCommand,
        AddHtlcCommand,
    },
    config::{LightningConfig, DEFAULT_COMMITMENT_FEERATE_PER_KW},
    events::{EventBus, WalletEvent},
    get_chain_hash,
    graph::NetworkGraph,
    onchain::OnChainWallet,
    payment::{HtlcDispatcher, OutboundLiquidity, PaymentError},
    readiness::{ReadinessSignal, ReadinessState, ReadinessTracker},
    transport::{ConnectionState, TransportError, TransportSession},
    types::{Hash256, NodeAddress, Privkey, Pubkey, ShortChannelId},
    wire::{tlv::InitTlv, tlv::TlvStream, ErrorMessage, Init, LightningMessage, OpenChannel},
    coordinator::NetworkSessionCoordinator,
};
use crate::{
    gen_rand_sha256_hash,
    invoice::{InvoiceStore, PreimageStore},
    now_timestamp_as_millis_u64,
    store::{ChannelSeedStore, ChannelStore, GraphStore, PeerStore},
    tasks::TaskTrackerWithCancellation,
    Error, Result,
};

const CHANNEL_CALL_TIMEOUT: Duration = Duration::from_secs(30);
const ADD_HTLC_RETRY_INTERVAL: Duration = Duration::from_millis(50);
const ADD_HTLC_MAX_RETRIES: usize = 100;

/// Optional feature bits we advertise in `init`: var_onion_optin, static_remotekey,
/// payment_secret, basic_mpp and option_quiesce.
const ADVERTISED_FEATURE_BITS: [usize; 5] = [9, 13, 15, 17, 35];

/// Feature bits, required or optional, we know how to handle.
const KNOWN_FEATURE_BITS: [usize; 10] = [8, 9, 12, 13, 14, 15, 16, 17, 34, 35];

pub fn local_features() -> Vec<u8> {
    let max_bit = ADVERTISED_FEATURE_BITS.iter().copied().max().unwrap_or(0);
    let len = max_bit / 8 + 1;
    let mut features = vec![0u8; len];
    for bit in ADVERTISED_FEATURE_BITS {
        features[len - 1 - bit / 8] |= 1 << (bit % 8);
    }
    features
}

/// Indices of the bits set in a big-endian feature vector.
fn feature_bits(features: &[u8]) -> impl Iterator<Item = usize> + '_ {
    let len = features.len();
    features.iter().enumerate().flat_map(move |(i, byte)| {
        (0..8)
            .filter(move |bit| byte & (1u8 << bit) != 0)
            .map(move |bit| (len - 1 - i) * 8 + bit)
    })
}

/// The first required ("even") feature bit we do not understand, if any.
pub fn unknown_required_feature(features: &[u8]) -> Option<usize> {
    feature_bits(features).find(|bit| bit % 2 == 0 && !KNOWN_FEATURE_BITS.contains(bit))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub pubkey: Pubkey,
    pub address: Option<NodeAddress>,
    pub state: ConnectionState,
    pub last_connected_at: Option<u64>,
    pub last_disconnected_at: Option<u64>,
    pub reconnect_attempts: u32,
}

impl PeerRecord {
    pub fn new(pubkey: Pubkey) -> Self {
        Self {
            pubkey,
            address: None,
            state: ConnectionState::Disconnected,
            last_connected_at: None,
            last_disconnected_at: None,
            reconnect_attempts: 0,
        }
    }
}

struct PeerEntry {
    session: Arc<TransportSession>,
    remote_init: Option<Init>,
}

pub struct NetworkServiceParams<S> {
    pub config: LightningConfig,
    pub node_key: Privkey,
    pub store: S,
    pub wallet: Arc<dyn OnChainWallet>,
    pub coordinator: Arc<NetworkSessionCoordinator>,
    pub graph: Arc<RwLock<NetworkGraph<S>>>,
    pub readiness: Arc<ReadinessTracker>,
    pub events: EventBus,
    pub tracker: TaskTrackerWithCancellation,
}

/// Owns the connections to our peers and the actors of our channels.
///
/// Peers are kept in an arena keyed by their public key; channels only know the key of
/// their peer and reach it through this service, which acts as their
/// [`PeerMessageSink`]. Every connection runs a reader loop that answers pings, feeds
/// gossip into the graph and hands channel messages to the matching channel actor.
pub struct NetworkService<S> {
    node_key: Privkey,
    local_pubkey: Pubkey,
    config: LightningConfig,
    store: S,
    wallet: Arc<dyn OnChainWallet>,
    coordinator: Arc<NetworkSessionCoordinator>,
    graph: Arc<RwLock<NetworkGraph<S>>>,
    readiness: Arc<ReadinessTracker>,
    events: EventBus,
    registry: ChannelRegistry,
    peers: RwLock<HashMap<Pubkey, PeerEntry>>,
    tracker: TaskTrackerWithCancellation,
}

impl<S> NetworkService<S>
where
    S: ChannelStore
        + ChannelSeedStore
        + InvoiceStore
        + PreimageStore
        + PeerStore
        + GraphStore
        + Clone
        + Send
        + Sync
        + 'static,
{
    pub fn new(params: NetworkServiceParams<S>) -> Arc<Self> {
        let NetworkServiceParams {
            config,
            node_key,
            store,
            wallet,
            coordinator,
            graph,
            readiness,
            events,
            tracker,
        } = params;
        Arc::new(Self {
            local_pubkey: node_key.pubkey(),
            node_key,
            config,
            store,
            wallet,
            coordinator,
            graph,
            readiness,
            events,
            registry: ChannelRegistry::new(),
            peers: RwLock::new(HashMap::new()),
            tracker,
        })
    }

    pub fn local_pubkey(&self) -> Pubkey {
        self.local_pubkey
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn graph(&self) -> &Arc<RwLock<NetworkGraph<S>>> {
        &self.graph
    }

    pub fn readiness(&self) -> ReadinessState {
        self.readiness.current()
    }

    /// Start following the session coordinator: whenever connecting stops being
    /// allowed, every peer is disconnected.
    pub fn start(self: &Arc<Self>) {
        self.readiness.signal(ReadinessSignal::WalletLoaded(true));
        let mut can_connect = self.coordinator.subscribe();
        let service = Arc::clone(self);
        self.tracker.spawn(async move {
            while can_connect.changed().await.is_ok() {
                let allowed = *can_connect.borrow_and_update();
                if !allowed {
                    info!("Connections are no longer allowed, disconnecting all peers");
                    service.disconnect_all().await;
                }
            }
        });
    }

    /// Accept inbound connections on `addr` until the service shuts down.
    pub async fn listen(self: &Arc<Self>, addr: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Listening for peers on {}", local_addr);
        let service = Arc::clone(self);
        self.tracker.spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote_addr)) => {
                        debug!("Inbound connection from {}", remote_addr);
                        let _ = stream.set_nodelay(true);
                        let service_clone = Arc::clone(&service);
                        service.tracker.spawn(async move {
                            if let Err(err) = service_clone.accept_stream(stream).await {
                                debug!("Inbound connection from {} failed: {}", remote_addr, err);
                            }
                        });
                    }
                    Err(err) => warn!("Failed to accept inbound connection: {}", err),
                }
            }
        });
        Ok(local_addr)
    }

    /// Run the responder handshake on an inbound stream. Returns the peer's identity.
    pub async fn accept_stream<T>(self: &Arc<Self>, stream: T) -> Result<Pubkey>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if !self.coordinator.can_connect() {
            return Err(Error::ConnectionNotAllowed);
        }
        let session = TransportSession::accept(
            stream,
            self.node_key.clone(),
            self.config.connect_timeout(),
            self.config.max_missed_pings(),
        )
        .await?;
        let peer = session.remote_pubkey();
        if let Err(err) = self.check_connect_allowed(&peer).await {
            session.close().await;
            return Err(err);
        }
        self.register_session(Arc::new(session)).await?;
        Ok(peer)
    }

    /// Whether a new connection to `peer` may be opened. `Ok(true)` means the peer is
    /// already connected.
    async fn check_connect_allowed(&self, peer: &Pubkey) -> Result<bool> {
        if !self.coordinator.can_connect() {
            return Err(Error::ConnectionNotAllowed);
        }
        let peers = self.peers.read().await;
        if peers.contains_key(peer) {
            return Ok(true);
        }
        let max_peers = self.config.max_peers();
        if peers.len() >= max_peers {
            return Err(Error::TooManyPeers(max_peers));
        }
        Ok(false)
    }

    pub async fn connect_peer(self: &Arc<Self>, address: NodeAddress) -> Result<()> {
        let peer = address.pubkey;
        if self.check_connect_allowed(&peer).await? {
            debug!("Peer {:?} is already connected", peer);
            return Ok(());
        }
        let session = Arc::new(TransportSession::new(
            self.node_key.clone(),
            peer,
            self.config.max_missed_pings(),
        ));
        self.connecting(&peer, Some(address.clone()))?;
        info!("Connecting to {}", address);
        let result = session
            .connect(&address.socket_addr_string(), self.config.connect_timeout())
            .await;
        self.finish_connect(session, result).await
    }

    /// Run the initiator handshake with `peer` over an already open stream.
    pub async fn connect_peer_with_stream<T>(self: &Arc<Self>, peer: Pubkey, stream: T) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if self.check_connect_allowed(&peer).await? {
            return Ok(());
        }
        let session = Arc::new(TransportSession::new(
            self.node_key.clone(),
            peer,
            self.config.max_missed_pings(),
        ));
        self.connecting(&peer, None)?;
        let result = session
            .connect_stream(stream, self.config.connect_timeout())
            .await;
        self.finish_connect(session, result).await
    }

    fn connecting(&self, peer: &Pubkey, address: Option<NodeAddress>) -> Result<()> {
        self.update_peer_record(peer, |record| {
            if address.is_some() {
                record.address = address;
            }
            record.state = ConnectionState::Connecting;
            record.reconnect_attempts += 1;
        })?;
        self.events.emit(WalletEvent::PeerConnectionChanged {
            peer: *peer,
            state: ConnectionState::Connecting,
        });
        Ok(())
    }

    async fn finish_connect(
        self: &Arc<Self>,
        session: Arc<TransportSession>,
        result: std::result::Result<(), TransportError>,
    ) -> Result<()> {
        let peer = session.remote_pubkey();
        if let Err(err) = result {
            warn!("Failed to connect to {:?}: {}", peer, err);
            let state = session.state();
            self.update_peer_record(&peer, |record| {
                record.state = state;
                record.last_disconnected_at = Some(now_timestamp_as_millis_u64());
            })?;
            self.events
                .emit(WalletEvent::PeerConnectionChanged { peer, state });
            return Err(err.into());
        }
        self.register_session(session).await
    }

    fn update_peer_record(
        &self,
        peer: &Pubkey,
        update: impl FnOnce(&mut PeerRecord),
    ) -> Result<()> {
        let mut record = self
            .store
            .find_peer(peer)?
            .unwrap_or_else(|| PeerRecord::new(*peer));
        update(&mut record);
        self.store.save_peer(&record)?;
        Ok(())
    }

    async fn register_session(self: &Arc<Self>, session: Arc<TransportSession>) -> Result<()> {
        let peer = session.remote_pubkey();
        let replaced = self.peers.write().await.insert(
            peer,
            PeerEntry {
                session: Arc::clone(&session),
                remote_init: None,
            },
        );
        if let Some(old) = replaced {
            debug!("Replacing the previous session with {:?}", peer);
            old.session.close().await;
        }
        self.update_peer_record(&peer, |record| {
            record.state = ConnectionState::Established;
            record.last_connected_at = Some(now_timestamp_as_millis_u64());
            record.reconnect_attempts = 0;
        })?;
        info!("Connected to peer {:?}", peer);
        self.events.emit(WalletEvent::PeerConnectionChanged {
            peer,
            state: ConnectionState::Established,
        });
        self.readiness
            .signal(ReadinessSignal::TransportConnected(true));

        let init = Init {
            global_features: vec![],
            features: local_features(),
            tlvs: TlvStream::new().with(InitTlv::Networks(vec![get_chain_hash()])),
        };
        if let Err(err) = session.send(&LightningMessage::Init(init)).await {
            self.cleanup_peer(&peer, &session).await;
            return Err(err.into());
        }
        session.spawn_keepalive(
            self.config.ping_interval(),
            self.config.pong_timeout(),
            &self.tracker,
        );
        let service = Arc::clone(self);
        self.tracker.spawn(service.reader_loop(session));
        Ok(())
    }

    async fn reader_loop(self: Arc<Self>, session: Arc<TransportSession>) {
        let peer = session.remote_pubkey();
        match tokio::time::timeout(self.config.connect_timeout(), session.receive()).await {
            Ok(Ok(LightningMessage::Init(init))) => {
                if let Err(err) = self.handle_init(peer, init).await {
                    warn!("Rejecting init from {:?}: {}", peer, err);
                    self.cleanup_peer(&peer, &session).await;
                    return;
                }
            }
            Ok(Ok(message)) => {
                warn!(
                    "Peer {:?} sent message type {} before init",
                    peer,
                    message.msg_type()
                );
                self.cleanup_peer(&peer, &session).await;
                return;
            }
            Ok(Err(err)) => {
                debug!("Connection with {:?} lost before init: {}", peer, err);
                self.cleanup_peer(&peer, &session).await;
                return;
            }
            Err(_) => {
                warn!("Peer {:?} did not send init in time", peer);
                self.cleanup_peer(&peer, &session).await;
                return;
            }
        }

        loop {
            match session.receive().await {
                Ok(message) => {
                    trace!("Received message type {} from {:?}", message.msg_type(), peer);
                    if let Err(err) = self.handle_peer_message(peer, message).await {
                        warn!("Disconnecting {:?}: {}", peer, err);
                        break;
                    }
                }
                Err(TransportError::ConnectionClosed) => {
                    debug!("Peer {:?} closed the connection", peer);
                    break;
                }
                Err(err) => {
                    warn!("Session with {:?} failed: {}", peer, err);
                    break;
                }
            }
        }
        self.cleanup_peer(&peer, &session).await;
    }

    async fn handle_init(self: &Arc<Self>, peer: Pubkey, init: Init) -> Result<()> {
        let networks = init.tlvs.find(|tlv| match tlv {
            InitTlv::Networks(chains) => Some(chains.clone()),
            _ => None,
        });
        if let Some(chains) = networks {
            if !chains.is_empty() && !chains.contains(&get_chain_hash()) {
                return Err(Error::InvalidPeerMessage(
                    "no chain in common with the peer".to_string(),
                ));
            }
        }
        for features in [&init.global_features, &init.features] {
            if let Some(bit) = unknown_required_feature(features) {
                return Err(Error::InvalidPeerMessage(format!(
                    "unknown required feature bit {}",
                    bit
                )));
            }
        }
        match self.peers.write().await.get_mut(&peer) {
            Some(entry) => entry.remote_init = Some(init),
            None => return Err(Error::PeerNotFound(peer)),
        }
        debug!("Init exchanged with {:?}", peer);
        self.readiness.signal(ReadinessSignal::PeerConnected(true));

        // Actors must exist before the peer's own channel_reestablish is read.
        let channels = self.restore_peer_channels(&peer).await;
        let service = Arc::clone(self);
        self.tracker.spawn(async move {
            let mut all_ok = true;
            for channel_id in channels {
                if let Err(err) = service.reestablish_channel(peer, channel_id).await {
                    warn!("Failed to reestablish channel {:?}: {}", channel_id, err);
                    all_ok = false;
                }
            }
            if all_ok {
                service
                    .readiness
                    .signal(ReadinessSignal::ChannelsReestablished(true));
            }
        });
        Ok(())
    }

    /// Spawn actors for the open channels with `peer` that have none. Returns the ids of
    /// every open channel with the peer.
    async fn restore_peer_channels(self: &Arc<Self>, peer: &Pubkey) -> Vec<Hash256> {
        let stored = match self.store.find_channels_by_peer(peer) {
            Ok(channels) => channels,
            Err(err) => {
                error!("Failed to load channels of {:?}: {}", peer, err);
                return vec![];
            }
        };
        let mut channels = vec![];
        for channel in stored.into_iter().filter(|c| !c.state.is_closed()) {
            if self.registry.get(&channel.id).is_none() {
                if let Err(err) = self.spawn_restored_channel(*peer, channel.id).await {
                    error!("Failed to restore channel {:?}: {}", channel.id, err);
                    continue;
                }
            }
            channels.push(channel.id);
        }
        channels
    }

    /// An error means the peer broke the protocol and has to be disconnected.
    async fn handle_peer_message(self: &Arc<Self>, peer: Pubkey, message: LightningMessage) -> Result<()> {
        match message {
            LightningMessage::Init(_) => {
                debug!("Ignoring repeated init from {:?}", peer);
            }
            LightningMessage::Warning(warning) => {
                warn!(
                    "Warning from {:?} for channel {:?}: {}",
                    peer,
                    warning.channel_id,
                    String::from_utf8_lossy(&warning.data)
                );
            }
            LightningMessage::Error(error) if error.channel_id == Hash256::ZERO => {
                warn!(
                    "Peer {:?} failed all our channels: {}",
                    peer,
                    String::from_utf8_lossy(&error.data)
                );
                for (channel_id, actor) in self.registry.channels_of(&peer) {
                    if let Err(err) = actor.send_message(ChannelActorMessage::PeerMessage(
                        LightningMessage::Error(error.clone()),
                    )) {
                        debug!("Channel {:?} is gone, error not delivered: {}", channel_id, err);
                    }
                }
            }
            LightningMessage::OpenChannel(open_channel) => {
                self.handle_open_channel(peer, open_channel).await;
            }
            message if message.is_gossip() => {
                let mut graph = self.graph.write().await;
                match graph.process_gossip(&message) {
                    Ok(true) => {
                        if graph.has_sufficient_data() {
                            self.readiness.signal(ReadinessSignal::GossipSynced(true));
                        }
                    }
                    Ok(false) => {}
                    Err(err) => debug!("Ignoring gossip from {:?}: {}", peer, err),
                }
            }
            LightningMessage::Unknown { msg_type, .. } if msg_type % 2 == 0 => {
                return Err(Error::InvalidPeerMessage(format!(
                    "unknown mandatory message type {}",
                    msg_type
                )));
            }
            LightningMessage::Unknown { msg_type, .. } => {
                trace!("Ignoring unknown odd message type {} from {:?}", msg_type, peer);
            }
            message => match message.channel_id() {
                Some(channel_id) => self.forward_to_channel(peer, channel_id, message).await,
                None => debug!(
                    "Ignoring unexpected message type {} from {:?}",
                    message.msg_type(),
                    peer
                ),
            },
        }
        Ok(())
    }

    async fn forward_to_channel(&self, peer: Pubkey, channel_id: Hash256, message: LightningMessage) {
        match self.registry.get(&channel_id) {
            Some(entry) if entry.peer == peer => {
                if let Err(err) = entry
                    .actor
                    .send_message(ChannelActorMessage::PeerMessage(message))
                {
                    debug!("Channel {:?} is gone: {}", channel_id, err);
                }
            }
            Some(_) => warn!(
                "Peer {:?} sent a message for channel {:?} it is not part of",
                peer, channel_id
            ),
            None => {
                if let LightningMessage::ChannelReestablish(_) = message {
                    let error = ErrorMessage::new(channel_id, "unknown channel");
                    if let Err(err) = self.send_to_peer(&peer, LightningMessage::Error(error)).await {
                        debug!("Failed to send error to {:?}: {}", peer, err);
                    }
                } else {
                    debug!(
                        "Ignoring message type {} for unknown channel {:?}",
                        message.msg_type(),
                        channel_id
                    );
                }
            }
        }
    }

    async fn handle_open_channel(self: &Arc<Self>, peer: Pubkey, open_channel: OpenChannel) {
        let temporary_channel_id = open_channel.temporary_channel_id;
        let rejection = if self.registry.get(&temporary_channel_id).is_some() {
            Some("duplicate temporary channel id".to_string())
        } else if !self.config.auto_accept_channels() {
            Some("channel opening not accepted".to_string())
        } else {
            let seed: [u8; 32] = rand::thread_rng().gen();
            let parameter = AcceptChannelParameter {
                open_channel,
                to_self_delay: self.config.min_to_self_delay(),
                limits: self.config.channel_limits(),
                seed,
            };
            match Actor::spawn(
                None,
                self.new_channel_actor(peer),
                ChannelInitializationOperation::AcceptChannel(parameter),
            )
            .await
            {
                Ok(_) => {
                    info!(
                        "Accepted channel {:?} from {:?}",
                        temporary_channel_id, peer
                    );
                    None
                }
                Err(err) => Some(err.to_string()),
            }
        };
        if let Some(reason) = rejection {
            debug!(
                "Rejecting channel {:?} from {:?}: {}",
                temporary_channel_id, peer, reason
            );
            let error = ErrorMessage::new(temporary_channel_id, &reason);
            if let Err(err) = self.send_to_peer(&peer, LightningMessage::Error(error)).await {
                debug!("Failed to send error to {:?}: {}", peer, err);
            }
        }
    }

    async fn send_to_peer(
        &self,
        peer: &Pubkey,
        message: LightningMessage,
    ) -> std::result::Result<(), TransportError> {
        let session = self
            .peers
            .read()
            .await
            .get(peer)
            .map(|entry| Arc::clone(&entry.session))
            .ok_or(TransportError::NotConnected)?;
        session.send(&message).await
    }

    /// Drop `session` and tell the channels of the peer. Does nothing when `session` was
    /// already replaced by a newer one.
    async fn cleanup_peer(&self, peer: &Pubkey, session: &Arc<TransportSession>) {
        let state = match session.state() {
            ConnectionState::Error => ConnectionState::Error,
            _ => ConnectionState::Disconnected,
        };
        let removed = {
            let mut peers = self.peers.write().await;
            match peers.get(peer) {
                Some(entry) if Arc::ptr_eq(&entry.session, session) => peers.remove(peer),
                _ => None,
            }
        };
        session.close().await;
        if removed.is_none() {
            return;
        }
        info!("Disconnected from peer {:?}", peer);
        for (channel_id, actor) in self.registry.channels_of(peer) {
            if let Err(err) =
                actor.send_message(ChannelActorMessage::Event(ChannelEvent::PeerDisconnected))
            {
                debug!("Channel {:?} is gone, disconnection not delivered: {}", channel_id, err);
            }
        }
        if let Err(err) = self.update_peer_record(peer, |record| {
            record.state = state;
            record.last_disconnected_at = Some(now_timestamp_as_millis_u64());
        }) {
            error!("Failed to save peer {:?}: {}", peer, err);
        }
        self.events.emit(WalletEvent::PeerConnectionChanged { peer: *peer, state });
        if self.peers.read().await.is_empty() {
            self.readiness
                .signal(ReadinessSignal::TransportConnected(false));
            self.readiness.signal(ReadinessSignal::PeerConnected(false));
            self.readiness
                .signal(ReadinessSignal::ChannelsReestablished(false));
        }
    }

    pub async fn disconnect_peer(&self, peer: &Pubkey) -> Result<()> {
        let session = self
            .peers
            .read()
            .await
            .get(peer)
            .map(|entry| Arc::clone(&entry.session))
            .ok_or(Error::PeerNotFound(*peer))?;
        self.cleanup_peer(peer, &session).await;
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        for peer in self.connected_peers().await {
            let _ = self.disconnect_peer(&peer).await;
        }
    }

    /// Forget a peer altogether.
    pub async fn remove_peer(&self, peer: &Pubkey) -> Result<()> {
        if self.is_connected(peer).await {
            self.disconnect_peer(peer).await?;
        }
        self.store.delete_peer(peer)?;
        Ok(())
    }

    pub async fn is_connected(&self, peer: &Pubkey) -> bool {
        self.peers.read().await.contains_key(peer)
    }

    pub async fn connected_peers(&self) -> Vec<Pubkey> {
        self.peers.read().await.keys().copied().collect()
    }

    /// Features the peer announced in its `init`, once received.
    pub async fn remote_features(&self, peer: &Pubkey) -> Option<Vec<u8>> {
        self.peers
            .read()
            .await
            .get(peer)
            .and_then(|entry| entry.remote_init.as_ref())
            .map(|init| init.features.clone())
    }

    /// Stored peers, with the state of live connections.
    pub async fn list_peers(&self) -> Result<Vec<PeerRecord>> {
        let connected = self.connected_peers().await;
        let mut peers = self.store.find_all_peers()?;
        for record in peers.iter_mut() {
            record.state = if connected.contains(&record.pubkey) {
                ConnectionState::Established
            } else if record.state == ConnectionState::Error {
                ConnectionState::Error
            } else {
                ConnectionState::Disconnected
            };
        }
        Ok(peers)
    }

    fn new_channel_actor(self: &Arc<Self>, peer: Pubkey) -> ChannelActor<S> {
        let sink: Arc<dyn PeerMessageSink> = Arc::clone(self) as Arc<dyn PeerMessageSink>;
        ChannelActor::new(
            self.local_pubkey,
            peer,
            self.store.clone(),
            Arc::clone(&self.wallet),
            sink,
            self.events.clone(),
            self.registry.clone(),
        )
    }

    /// Open a channel funded by us. Parameters are checked before anything is sent.
    /// Returns the temporary channel id.
    pub async fn open_channel(
        self: &Arc<Self>,
        peer: Pubkey,
        funding_satoshis: u64,
        push_msat: u64,
    ) -> Result<Hash256> {
        let limits = self.config.channel_limits();
        let to_self_delay = self.config.min_to_self_delay();
        validate_open_params(
            &limits,
            funding_satoshis,
            push_msat,
            default_channel_reserve(funding_satoshis, limits.dust_limit_sat),
            to_self_delay,
        )?;
        if !self.is_connected(&peer).await {
            return Err(Error::PeerNotFound(peer));
        }
        let temporary_channel_id = gen_rand_sha256_hash();
        let seed: [u8; 32] = rand::thread_rng().gen();
        Actor::spawn(
            None,
            self.new_channel_actor(peer),
            ChannelInitializationOperation::OpenChannel(OpenChannelParameter {
                temporary_channel_id,
                funding_satoshis,
                push_msat,
                feerate_per_kw: DEFAULT_COMMITMENT_FEERATE_PER_KW,
                to_self_delay,
                limits,
                seed,
            }),
        )
        .await?;
        info!(
            "Opening channel {:?} with {:?} for {} sat",
            temporary_channel_id, peer, funding_satoshis
        );
        Ok(temporary_channel_id)
    }

    async fn spawn_restored_channel(
        self: &Arc<Self>,
        peer: Pubkey,
        channel_id: Hash256,
    ) -> Result<ActorRef<ChannelActorMessage>> {
        let (actor, _) = Actor::spawn(
            None,
            self.new_channel_actor(peer),
            ChannelInitializationOperation::Restore(channel_id),
        )
        .await?;
        Ok(actor)
    }

    /// Spawn an actor for every stored channel that is not closed or still has a
    /// transaction to publish. Returns how many channels were restored.
    pub async fn restore_channels(self: &Arc<Self>) -> Result<usize> {
        let mut restored = 0;
        for channel in self.store.find_all_channels()? {
            let finished = channel.state.is_closed() && channel.pending_broadcast.is_none();
            if finished || self.registry.get(&channel.id).is_some() {
                continue;
            }
            self.spawn_restored_channel(channel.remote_pubkey, channel.id)
                .await?;
            restored += 1;
        }
        info!("Restored {} channels", restored);
        Ok(restored)
    }

    async fn call_channel<T, F>(&self, channel_id: &Hash256, command: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(ChannelCommandReply<T>) -> ChannelCommand + Send,
    {
        let entry = self
            .registry
            .get(channel_id)
            .ok_or(Error::ChannelNotFound(*channel_id))?;
        let result = entry
            .actor
            .call(
                |reply| ChannelActorMessage::Command(command(reply)),
                Some(CHANNEL_CALL_TIMEOUT),
            )
            .await
            .map_err(|err| Error::ActorCallError(err.to_string()))?;
        match result {
            CallResult::Success(result) => Ok(result?),
            CallResult::Timeout => Err(Error::ActorCallError(format!(
                "channel {:?} did not answer in time",
                channel_id
            ))),
            CallResult::SenderError => Err(Error::ActorCallError(format!(
                "channel {:?} dropped the request",
                channel_id
            ))),
        }
    }

    pub async fn get_channel_state(&self, channel_id: &Hash256) -> Result<ChannelActorState> {
        let entry = self
            .registry
            .get(channel_id)
            .ok_or(Error::ChannelNotFound(*channel_id))?;
        let result = entry
            .actor
            .call(
                |reply: RpcReplyPort<ChannelActorState>| {
                    ChannelActorMessage::Command(ChannelCommand::GetState(reply))
                },
                Some(CHANNEL_CALL_TIMEOUT),
            )
            .await
            .map_err(|err| Error::ActorCallError(err.to_string()))?;
        match result {
            CallResult::Success(state) => Ok(state),
            _ => Err(Error::ActorCallError(format!(
                "channel {:?} did not return its state",
                channel_id
            ))),
        }
    }

    /// Channels as persisted, which includes closed ones.
    pub fn list_channels(&self) -> Result<Vec<ChannelActorState>> {
        Ok(self.store.find_all_channels()?)
    }

    /// Broadcast our latest commitment. Returns its txid.
    pub async fn force_close_channel(&self, channel_id: &Hash256) -> Result<Hash256> {
        self.call_channel(channel_id, ChannelCommand::ForceClose).await
    }

    /// Send our `channel_reestablish` for a channel with `peer`, restoring the channel
    /// from the store first when no actor runs it.
    pub async fn reestablish_channel(self: &Arc<Self>, peer: Pubkey, channel_id: Hash256) -> Result<()> {
        if self.registry.get(&channel_id).is_none() {
            match self.store.find_channel_by_id(&channel_id)? {
                None => {
                    warn!("Channel {:?} to reestablish is unknown, closing it", channel_id);
                    self.events.emit(WalletEvent::ChannelStateChanged {
                        channel_id,
                        peer,
                        state: ChannelState::Closed(CloseFlags::ABANDONED),
                    });
                    return Err(Error::ChannelNotFound(channel_id));
                }
                Some(channel) if channel.state.is_closed() => {
                    return Err(ProcessingChannelError::ChannelNotReestablishable.into());
                }
                Some(channel) => {
                    self.spawn_restored_channel(channel.remote_pubkey, channel_id)
                        .await?;
                }
            }
        }
        self.call_channel(&channel_id, ChannelCommand::Reestablish)
            .await
    }

    pub async fn shutdown_channel(&self, channel_id: &Hash256, command: ShutdownCommand) -> Result<()> {
        self.call_channel(channel_id, |reply| ChannelCommand::Shutdown(command, reply))
            .await
    }

    pub async fn enter_quiescence(&self, channel_id: &Hash256) -> Result<()> {
        self.call_channel(channel_id, ChannelCommand::EnterQuiescence)
            .await
    }

    pub async fn exit_quiescence(&self, channel_id: &Hash256) -> Result<()> {
        self.call_channel(channel_id, ChannelCommand::ExitQuiescence)
            .await
    }

    pub async fn update_fee(&self, channel_id: &Hash256, feerate_per_kw: u32) -> Result<()> {
        self.call_channel(channel_id, |reply| {
            ChannelCommand::UpdateFee(feerate_per_kw, reply)
        })
        .await
    }

    pub async fn add_htlc(&self, channel_id: &Hash256, command: AddHtlcCommand) -> Result<u64> {
        self.call_channel(channel_id, |reply| ChannelCommand::AddHtlc(command, reply))
            .await
    }

    /// The funding transaction of the channel reached its minimum depth. The channel is
    /// also made known to the routing graph.
    pub async fn funding_confirmed(
        &self,
        channel_id: &Hash256,
        short_channel_id: ShortChannelId,
    ) -> Result<()> {
        let entry = self
            .registry
            .get(channel_id)
            .ok_or(Error::ChannelNotFound(*channel_id))?;
        entry
            .actor
            .send_message(ChannelActorMessage::Event(ChannelEvent::FundingConfirmed(
                short_channel_id,
            )))
            .map_err(|err| Error::ActorCallError(err.to_string()))?;
        let state = self.get_channel_state(channel_id).await?;
        self.graph.write().await.add_local_channel(
            short_channel_id,
            self.local_pubkey,
            entry.peer,
            state.funding_satoshis,
        )?;
        Ok(())
    }

    /// The closing or commitment transaction of the channel is confirmed.
    pub async fn closing_confirmed(&self, channel_id: &Hash256, txid: Hash256) -> Result<()> {
        let state = self.get_channel_state(channel_id).await?;
        let entry = self
            .registry
            .get(channel_id)
            .ok_or(Error::ChannelNotFound(*channel_id))?;
        entry
            .actor
            .send_message(ChannelActorMessage::Event(ChannelEvent::ClosingConfirmed(txid)))
            .map_err(|err| Error::ActorCallError(err.to_string()))?;
        if let Some(short_channel_id) = state.short_channel_id {
            self.graph.write().await.remove_channel(&short_channel_id)?;
        }
        Ok(())
    }

    /// Disconnect every peer and stop every channel actor and background task.
    pub async fn shutdown(&self) {
        info!("Shutting down the network service");
        self.disconnect_all().await;
        for (_, entry) in self.registry.all() {
            entry.actor.stop(Some("shutdown".to_string()));
        }
        self.tracker.close().await;
    }
}

#[async_trait]
impl<S> PeerMessageSink for NetworkService<S>
where
    S: ChannelStore
        + ChannelSeedStore
        + InvoiceStore
        + PreimageStore
        + PeerStore
        + GraphStore
        + Clone
        + Send
        + Sync
        + 'static,
{
    async fn send_message(
        &self,
        peer: &Pubkey,
        message: LightningMessage,
    ) -> std::result::Result<(), TransportError> {
        trace!("Sending message type {} to {:?}", message.msg_type(), peer);
        self.send_to_peer(peer, message).await
    }

    async fn disconnect(&self, peer: &Pubkey) {
        if let Err(err) = self.disconnect_peer(peer).await {
            debug!("Failed to disconnect {:?}: {}", peer, err);
        }
    }
}

#[async_trait]
impl<S> HtlcDispatcher for NetworkService<S>
where
    S: ChannelStore
        + ChannelSeedStore
        + InvoiceStore
        + PreimageStore
        + PeerStore
        + GraphStore
        + Clone
        + Send
        + Sync
        + 'static,
{
    async fn outbound_liquidity(&self) -> Vec<OutboundLiquidity> {
        let connected = self.connected_peers().await;
        let mut liquidity = Vec::new();
        for (channel_id, entry) in self.registry.all() {
            if !connected.contains(&entry.peer) {
                continue;
            }
            match self.get_channel_state(&channel_id).await {
                Ok(state) if matches!(state.state, ChannelState::Normal) => {
                    liquidity.push(OutboundLiquidity {
                        peer: entry.peer,
                        channel_id,
                        available_msat: state.get_available_to_send_msat(),
                    });
                }
                Ok(_) => {}
                Err(err) => debug!("Skipping channel {:?}: {}", channel_id, err),
            }
        }
        liquidity
    }

    async fn dispatch_htlc(
        &self,
        first_hop: Pubkey,
        command: AddHtlcCommand,
    ) -> std::result::Result<(Hash256, u64), PaymentError> {
        let mut candidates: Vec<OutboundLiquidity> = self
            .outbound_liquidity()
            .await
            .into_iter()
            .filter(|l| l.peer == first_hop && l.available_msat >= command.amount_msat)
            .collect();
        if candidates.is_empty() {
            return Err(PaymentError::DispatchFailed(format!(
                "no channel with {:?} can carry {} msat",
                first_hop, command.amount_msat
            )));
        }
        candidates.sort_by(|a, b| b.available_msat.cmp(&a.available_msat));

        let mut last_error = None;
        for candidate in candidates {
            for _ in 0..ADD_HTLC_MAX_RETRIES {
                let add = command.clone();
                match self
                    .call_channel(&candidate.channel_id, move |reply| {
                        ChannelCommand::AddHtlc(add, reply)
                    })
                    .await
                {
                    Ok(htlc_id) => return Ok((candidate.channel_id, htlc_id)),
                    // The previous update is not acknowledged yet.
                    Err(Error::ChannelError(ProcessingChannelError::WaitingTlcAck)) => {
                        tokio::time::sleep(ADD_HTLC_RETRY_INTERVAL).await;
                    }
                    Err(err) => {
                        debug!(
                            "Channel {:?} refused the HTLC: {}",
                            candidate.channel_id, err
                        );
                        last_error = Some(err.to_string());
                        break;
                    }
                }
            }
        }
        Err(PaymentError::DispatchFailed(
            last_error.unwrap_or_else(|| "channels stayed busy".to_string()),
        ))
    }
}

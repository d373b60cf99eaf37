use std::{fmt::Debug, fs, path::Path, sync::Arc};

use async_trait::async_trait;
use lnwallet::{
    lightning::{
        coordinator::NetworkSessionCoordinator,
        graph::{GraphSettings, NetworkGraph},
        onchain::{
            ClosingBroadcast, CommitmentBroadcast, FundingOutpoint, FundingRequest, OnChainError,
            OnChainWallet,
        },
        payment::{BlankOnionBuilder, PaymentSessionManager, PaymentSettings},
        readiness::ReadinessTracker,
        trampoline::{TrampolinePolicy, TrampolineRouter},
        types::{Hash256, Privkey},
        NetworkServiceParams,
    },
    store::MemoryStore,
    tasks::TaskTrackerWithCancellation,
    Config, EventBus, NetworkService, WalletEvent,
};
use tokio::sync::{broadcast::error::RecvError, watch, RwLock};
use tracing::{debug, error, info, info_span, warn};
use tracing_subscriber::{fmt, EnvFilter};

const NODE_KEY_FILE_NAME: &str = "node.key";

pub struct ExitMessage(String);

impl Debug for ExitMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Exit because {}", self.0)
    }
}

/// The daemon has no bitcoin wallet attached, so every on-chain request is refused.
/// Channels opened by peers can still be accepted and used.
struct DetachedWallet;

#[async_trait]
impl OnChainWallet for DetachedWallet {
    async fn create_funding_transaction(
        &self,
        _request: FundingRequest,
    ) -> Result<FundingOutpoint, OnChainError> {
        Err(OnChainError::Unavailable("no on-chain wallet attached".to_string()))
    }

    async fn broadcast_funding(&self, _funding: FundingOutpoint) -> Result<(), OnChainError> {
        Err(OnChainError::Unavailable("no on-chain wallet attached".to_string()))
    }

    async fn broadcast_commitment(
        &self,
        commitment: CommitmentBroadcast,
    ) -> Result<Hash256, OnChainError> {
        error!(
            "Cannot publish commitment #{} of channel {:?}",
            commitment.commitment_number, commitment.channel_id
        );
        Err(OnChainError::Unavailable("no on-chain wallet attached".to_string()))
    }

    async fn broadcast_closing(&self, closing: ClosingBroadcast) -> Result<Hash256, OnChainError> {
        error!("Cannot publish closing of channel {:?}", closing.channel_id);
        Err(OnChainError::Unavailable("no on-chain wallet attached".to_string()))
    }
}

fn load_or_create_node_key(dir: &Path) -> Result<Privkey, ExitMessage> {
    let path = dir.join(NODE_KEY_FILE_NAME);
    match fs::read(&path) {
        Ok(bytes) => Privkey::from_slice(&bytes)
            .map_err(|err| ExitMessage(format!("invalid node key in {:?}: {}", path, err))),
        Err(_) => {
            fs::create_dir_all(dir)
                .map_err(|err| ExitMessage(format!("failed to create {:?}: {}", dir, err)))?;
            let key = Privkey::generate();
            fs::write(&path, key.secret_bytes())
                .map_err(|err| ExitMessage(format!("failed to write {:?}: {}", path, err)))?;
            info!("Generated a new node key in {:?}", path);
            Ok(key)
        }
    }
}

fn log_events(events: &EventBus, tracker: &TaskTrackerWithCancellation) {
    let mut receiver = events.subscribe();
    tracker.spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(WalletEvent::PaymentCompleted {
                    payment_hash,
                    status,
                }) => info!("Payment {:?} completed: {:?}", payment_hash, status),
                Ok(WalletEvent::RoutingModeChanged { old, new }) => {
                    info!("Routing mode changed from {:?} to {:?}", old, new)
                }
                Ok(event) => debug!("Event: {:?}", event),
                Err(RecvError::Lagged(skipped)) => warn!("Event log skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
pub async fn main() -> Result<(), ExitMessage> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .pretty()
        .try_init()
        .map_err(|err| ExitMessage(format!("failed to initialize logger: {}", err)))?;

    let config = Config::parse().map_err(|err| ExitMessage(err.to_string()))?;
    let lightning_config = config.lightning.clone();
    let lightning_dir = lightning_config
        .base_dir()
        .cloned()
        .unwrap_or_else(|| config.base_dir.join("lightning"));
    let node_key = load_or_create_node_key(&lightning_dir)?;
    let _span = info_span!("wallet", node = %node_key.pubkey()).entered();
    info!("Starting node {}", node_key.pubkey());

    let store = MemoryStore::new();
    let events = EventBus::default();
    let tracker = TaskTrackerWithCancellation::new();
    log_events(&events, &tracker);

    let coordinator = Arc::new(NetworkSessionCoordinator::new());
    coordinator.set_wallet_available(true);
    coordinator.set_internet_available(true);
    let readiness = Arc::new(ReadinessTracker::new(events.clone()));

    let graph = NetworkGraph::new(store.clone(), GraphSettings::from(&lightning_config))
        .map_err(|err| ExitMessage(format!("failed to load network graph: {}", err)))?;
    let graph = Arc::new(RwLock::new(graph));

    let service = NetworkService::new(NetworkServiceParams {
        config: lightning_config.clone(),
        node_key: node_key.clone(),
        store: store.clone(),
        wallet: Arc::new(DetachedWallet),
        coordinator: Arc::clone(&coordinator),
        graph: Arc::clone(&graph),
        readiness: Arc::clone(&readiness),
        events: events.clone(),
        tracker: tracker.clone(),
    });
    service.start();

    let router = Arc::new(TrampolineRouter::new(
        node_key.pubkey(),
        Arc::clone(&graph),
        lightning_config.trampoline_nodes(),
        TrampolinePolicy::from(&lightning_config),
        events.clone(),
    ));
    router.track_reachability(&tracker);

    // Without a chain source the tip stays unknown; an embedding wallet feeds it here.
    let (_block_height_sender, block_height) = watch::channel(0u32);
    let _payments = PaymentSessionManager::new(
        node_key.pubkey(),
        store.clone(),
        Arc::clone(&router),
        Arc::clone(&service) as _,
        Arc::new(BlankOnionBuilder),
        events.clone(),
        block_height,
        PaymentSettings::from(&lightning_config),
        tracker.clone(),
    );

    if let Some(addr) = lightning_config.listen_addr.as_deref() {
        service
            .listen(addr)
            .await
            .map_err(|err| ExitMessage(format!("failed to listen on {}: {}", addr, err)))?;
    }

    for address in lightning_config.trampoline_nodes() {
        if let Err(err) = service.connect_peer(address.clone()).await {
            warn!("Failed to connect to trampoline node {}: {}", address, err);
        }
    }
    match service.restore_channels().await {
        Ok(count) => info!("Restored {} channels", count),
        Err(err) => warn!("Failed to restore channels: {}", err),
    }

    signal_listener().await;

    service.shutdown().await;
    tracker.close().await;
    info!("Node stopped");
    Ok(())
}

#[cfg(target_family = "unix")]
async fn signal_listener() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("listen for SIGTERM");
    let mut sigint = signal(SignalKind::interrupt()).expect("listen for SIGINT");

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
        _ = sigint.recv() => info!("SIGINT received, shutting down"),
    };
}

#[cfg(not(target_family = "unix"))]
async fn signal_listener() {
    tokio::signal::ctrl_c()
        .await
        .expect("listen for Ctrl-c signal");
    info!("Ctrl-c received, shutting down");
}

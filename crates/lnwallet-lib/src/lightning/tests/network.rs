use std::{sync::Arc, time::Duration};

use tokio::sync::watch;

use crate::{
    expect_event, gen_rand_sha256_hash, init_tracing,
    invoice::PreimageStore,
    lightning::{
        channel::{ChannelEntry, ChannelState, CloseFlags, ProcessingChannelError},
        coordinator::DisconnectReason,
        events::WalletEvent,
        network::{local_features, unknown_required_feature},
        payment::{
            BlankOnionBuilder, HtlcDispatcher, PaymentRequest, PaymentSessionManager,
            PaymentSettings, PaymentStatus,
        },
        trampoline::{TrampolinePolicy, TrampolineRouter},
        transport::{ConnectionState, TransportSession},
        types::{sha256, Privkey},
        wire::{
            tlv::{InitTlv, TlvStream},
            Init, LightningMessage,
        },
        LightningConfig,
    },
    test_lightning_config, wait_until, Error, TestNode,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// A bare transport session connected to `node`, with the node's `init` already read.
async fn raw_connect(node: &TestNode) -> (TransportSession, Privkey) {
    let key = Privkey::generate();
    let (outbound, inbound) = tokio::io::duplex(64 * 1024);
    let service = Arc::clone(&node.service);
    let accept = tokio::spawn(async move { service.accept_stream(inbound).await });
    let session = TransportSession::new(key.clone(), node.pubkey(), 3);
    session
        .connect_stream(outbound, HANDSHAKE_TIMEOUT)
        .await
        .expect("initiator handshake");
    let accepted = accept.await.expect("accept task").expect("accept peer");
    assert_eq!(accepted, key.pubkey());
    let init = session.receive().await.expect("receive init");
    let LightningMessage::Init(init) = init else {
        panic!("expected init, got {:?}", init);
    };
    assert_eq!(init.features, local_features());
    (session, key)
}

fn init_with(features: Vec<u8>, tlvs: TlvStream<InitTlv>) -> LightningMessage {
    LightningMessage::Init(Init {
        global_features: vec![],
        features,
        tlvs,
    })
}

#[test]
fn test_local_features_are_all_known() {
    let features = local_features();
    assert_eq!(unknown_required_feature(&features), None);
    // basic_mpp, bit 17.
    assert_ne!(features[features.len() - 3] & 0x02, 0);
    assert_eq!(unknown_required_feature(&[0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]), Some(48));
    assert_eq!(unknown_required_feature(&[0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connect_exchanges_init() {
    init_tracing();
    let node_a = TestNode::new();
    let node_b = TestNode::new();
    let mut events = node_a.subscribe();
    node_a.connect_to(&node_b).await;

    assert!(node_a.service.is_connected(&node_b.pubkey()).await);
    assert!(node_b.service.is_connected(&node_a.pubkey()).await);
    assert_eq!(
        node_a.service.remote_features(&node_b.pubkey()).await,
        Some(local_features())
    );
    let state = expect_event(&mut events, |event| match event {
        WalletEvent::PeerConnectionChanged { peer, state } if *peer == node_b.pubkey() => {
            Some(*state)
        }
        _ => None,
    })
    .await;
    assert_eq!(state, ConnectionState::Connecting);

    let peers = node_a.service.list_peers().await.expect("list peers");
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].pubkey, node_b.pubkey());
    assert_eq!(peers[0].state, ConnectionState::Established);
    assert!(peers[0].last_connected_at.is_some());
    assert_eq!(peers[0].reconnect_attempts, 0);

    let (a, b) = (&node_a, &node_b);
    wait_until(move || async move {
        a.service.readiness().can_receive() && b.service.readiness().can_receive()
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connecting_twice_keeps_one_session() {
    init_tracing();
    let node_a = TestNode::new();
    let node_b = TestNode::new();
    node_a.connect_to(&node_b).await;
    let (outbound, _inbound) = tokio::io::duplex(1024);
    node_a
        .service
        .connect_peer_with_stream(node_b.pubkey(), outbound)
        .await
        .expect("already connected");
    assert_eq!(node_a.service.connected_peers().await, vec![node_b.pubkey()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disconnect_skips_stopped_channel_actors() {
    init_tracing();
    let node_a = TestNode::new();
    let node_b = TestNode::new();
    node_a.connect_to(&node_b).await;
    let live_channel = node_a.open_channel_to(&node_b, 100_000, 0).await;
    let stale_channel = node_a.open_channel_to(&node_b, 50_000, 0).await;

    let registry = node_a.service.registry();
    let stale = registry.get(&stale_channel).expect("channel entry");
    stale.actor.stop(None);
    wait_until(move || async move { registry.get(&stale_channel).is_none() }).await;
    registry.insert(
        stale_channel,
        ChannelEntry {
            peer: node_b.pubkey(),
            actor: stale.actor,
        },
    );

    node_a
        .service
        .disconnect_peer(&node_b.pubkey())
        .await
        .expect("disconnect peer");
    node_a
        .wait_for_channel_state(live_channel, |s| *s == ChannelState::Offline)
        .await;
    assert!(!node_a.service.is_connected(&node_b.pubkey()).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disconnect_is_seen_by_both_sides() {
    init_tracing();
    let node_a = TestNode::new();
    let node_b = TestNode::new();
    node_a.connect_to(&node_b).await;
    let mut events_a = node_a.subscribe();
    let mut events_b = node_b.subscribe();

    node_a
        .service
        .disconnect_peer(&node_b.pubkey())
        .await
        .expect("disconnect peer");
    assert!(!node_a.service.is_connected(&node_b.pubkey()).await);

    for (events, peer) in [
        (&mut events_a, node_b.pubkey()),
        (&mut events_b, node_a.pubkey()),
    ] {
        let state = expect_event(events, |event| match event {
            WalletEvent::PeerConnectionChanged { peer: p, state } if *p == peer => Some(*state),
            _ => None,
        })
        .await;
        assert_eq!(state, ConnectionState::Disconnected);
    }

    let b = &node_b;
    wait_until(move || async move { !b.service.readiness().peer_connected }).await;
    assert!(!node_a.service.readiness().transport_connected);

    let peers = node_a.service.list_peers().await.expect("list peers");
    assert_eq!(peers[0].state, ConnectionState::Disconnected);
    assert!(peers[0].last_disconnected_at.is_some());

    assert!(matches!(
        node_a.service.disconnect_peer(&node_b.pubkey()).await,
        Err(Error::PeerNotFound(_))
    ));
    node_a
        .service
        .remove_peer(&node_b.pubkey())
        .await
        .expect("remove peer");
    assert!(node_a.service.list_peers().await.expect("list peers").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connection_not_allowed_while_vote_active() {
    init_tracing();
    let node_a = TestNode::new();
    let node_b = TestNode::new();
    node_a
        .coordinator
        .add_disconnect_vote(DisconnectReason::AppBackgrounded);

    let (outbound, inbound) = tokio::io::duplex(1024);
    assert!(matches!(
        node_a
            .service
            .connect_peer_with_stream(node_b.pubkey(), outbound)
            .await,
        Err(Error::ConnectionNotAllowed)
    ));
    assert!(matches!(
        node_a.service.accept_stream(inbound).await,
        Err(Error::ConnectionNotAllowed)
    ));

    node_a
        .coordinator
        .remove_disconnect_vote(DisconnectReason::AppBackgrounded);
    node_a.connect_to(&node_b).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disconnect_vote_drops_peers() {
    init_tracing();
    let node_a = TestNode::new();
    let node_b = TestNode::new();
    node_a.connect_to(&node_b).await;

    node_a
        .coordinator
        .add_disconnect_vote(DisconnectReason::NetworkLost);
    let (a, b) = (&node_a, &node_b);
    wait_until(move || async move {
        !a.service.is_connected(&b.pubkey()).await && !b.service.is_connected(&a.pubkey()).await
    })
    .await;
    assert!(!node_a.service.readiness().can_receive());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_max_peers_is_enforced() {
    init_tracing();
    let node_a = TestNode::new_with_config(LightningConfig {
        max_peers: Some(1),
        ..test_lightning_config()
    });
    let node_b = TestNode::new();
    let node_c = TestNode::new();
    node_a.connect_to(&node_b).await;

    let (outbound, _inbound) = tokio::io::duplex(1024);
    assert!(matches!(
        node_a
            .service
            .connect_peer_with_stream(node_c.pubkey(), outbound)
            .await,
        Err(Error::TooManyPeers(1))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_message_types() {
    init_tracing();
    let node = TestNode::new();
    let (session, key) = raw_connect(&node).await;
    session
        .send(&init_with(vec![], TlvStream::new()))
        .await
        .expect("send init");
    let service = &node.service;
    let peer = key.pubkey();
    wait_until(move || async move { service.remote_features(&peer).await.is_some() }).await;

    session
        .send(&LightningMessage::Unknown {
            msg_type: 0x8001,
            payload: vec![1, 2, 3],
        })
        .await
        .expect("send odd message");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(node.service.is_connected(&peer).await);

    session
        .send(&LightningMessage::Unknown {
            msg_type: 0x8000,
            payload: vec![],
        })
        .await
        .expect("send even message");
    wait_until(move || async move { !service.is_connected(&peer).await }).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_init_with_unknown_required_feature_is_rejected() {
    init_tracing();
    let node = TestNode::new();
    let mut events = node.subscribe();
    let (session, key) = raw_connect(&node).await;
    session
        .send(&init_with(
            vec![0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            TlvStream::new(),
        ))
        .await
        .expect("send init");

    let peer = key.pubkey();
    let state = expect_event(&mut events, |event| match event {
        WalletEvent::PeerConnectionChanged { peer: p, state }
            if *p == peer && *state != ConnectionState::Established =>
        {
            Some(*state)
        }
        _ => None,
    })
    .await;
    assert_eq!(state, ConnectionState::Disconnected);
    assert!(!node.service.is_connected(&peer).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_init_for_other_chain_is_rejected() {
    init_tracing();
    let node = TestNode::new();
    let (session, key) = raw_connect(&node).await;
    session
        .send(&init_with(
            vec![],
            TlvStream::new().with(InitTlv::Networks(vec![gen_rand_sha256_hash()])),
        ))
        .await
        .expect("send init");
    let service = &node.service;
    let peer = key.pubkey();
    wait_until(move || async move { !service.is_connected(&peer).await }).await;
    assert_eq!(node.service.remote_features(&peer).await, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_open_channel_checks_parameters() {
    init_tracing();
    let node_a = TestNode::new();
    let node_b = TestNode::new();

    assert!(matches!(
        node_a.service.open_channel(node_b.pubkey(), 100_000, 0).await,
        Err(Error::PeerNotFound(_))
    ));
    node_a.connect_to(&node_b).await;
    assert!(matches!(
        node_a.service.open_channel(node_b.pubkey(), 500, 0).await,
        Err(Error::ChannelError(
            ProcessingChannelError::InvalidChannelParameters(_)
        ))
    ));
    assert!(node_a.service.list_channels().expect("list channels").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_inbound_channel_rejected_without_auto_accept() {
    init_tracing();
    let node_a = TestNode::new();
    let node_b = TestNode::new_with_config(LightningConfig {
        auto_accept_channels: Some(false),
        ..test_lightning_config()
    });
    node_a.connect_to(&node_b).await;
    let mut events = node_a.subscribe();

    let temporary_id = node_a
        .service
        .open_channel(node_b.pubkey(), 100_000, 0)
        .await
        .expect("open channel");
    let state = expect_event(&mut events, |event| match event {
        WalletEvent::ChannelStateChanged {
            channel_id, state, ..
        } if *channel_id == temporary_id && state.is_closed() => Some(*state),
        _ => None,
    })
    .await;
    assert_eq!(state, ChannelState::Closed(CloseFlags::FUNDING_ABORTED));
    assert!(node_b.service.list_channels().expect("list channels").is_empty());
    assert!(node_a.wallet.broadcast_fundings.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reestablish_unknown_channel() {
    init_tracing();
    let (node_a, node_b) = crate::create_connected_nodes().await;
    let mut events = node_a.subscribe();
    let channel_id = gen_rand_sha256_hash();

    assert!(matches!(
        node_a
            .service
            .reestablish_channel(node_b.pubkey(), channel_id)
            .await,
        Err(Error::ChannelNotFound(id)) if id == channel_id
    ));
    let state = expect_event(&mut events, |event| match event {
        WalletEvent::ChannelStateChanged {
            channel_id: id,
            state,
            ..
        } if *id == channel_id => Some(*state),
        _ => None,
    })
    .await;
    assert_eq!(state, ChannelState::Closed(CloseFlags::ABANDONED));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_channels_are_restored_on_reconnect() {
    init_tracing();
    let (node_a, node_b) = crate::create_connected_nodes().await;
    let channel_id = node_a.open_channel_to(&node_b, 100_000, 0).await;

    node_a
        .service
        .disconnect_peer(&node_b.pubkey())
        .await
        .expect("disconnect peer");
    node_a
        .wait_for_channel_state(channel_id, |state| *state == ChannelState::Offline)
        .await;
    node_b
        .wait_for_channel_state(channel_id, |state| *state == ChannelState::Offline)
        .await;

    node_a.connect_to(&node_b).await;
    let normal = |state: &ChannelState| *state == ChannelState::Normal;
    node_a.wait_for_channel_state(channel_id, normal).await;
    node_b.wait_for_channel_state(channel_id, normal).await;
    let a = &node_a;
    wait_until(move || async move { a.service.readiness().channels_reestablished }).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_payment_over_channel() {
    init_tracing();
    let (node_a, node_b) = crate::create_connected_nodes().await;
    let channel_id = node_a.open_channel_to(&node_b, 100_000, 0).await;

    let liquidity = node_a.service.outbound_liquidity().await;
    assert_eq!(liquidity.len(), 1);
    assert_eq!(liquidity[0].channel_id, channel_id);
    assert_eq!(liquidity[0].peer, node_b.pubkey());

    let preimage = gen_rand_sha256_hash();
    let payment_hash = sha256(preimage.as_bytes());
    node_b
        .store
        .insert_preimage(payment_hash, preimage)
        .expect("insert preimage");

    let router = Arc::new(TrampolineRouter::new(
        node_a.pubkey(),
        Arc::clone(node_a.service.graph()),
        vec![],
        TrampolinePolicy {
            enabled: false,
            ..TrampolinePolicy::from(&test_lightning_config())
        },
        node_a.events.clone(),
    ));
    let (_block_height, block_height_rx) = watch::channel(800_000);
    let manager = PaymentSessionManager::new(
        node_a.pubkey(),
        node_a.store.clone(),
        router,
        Arc::clone(&node_a.service) as Arc<dyn HtlcDispatcher>,
        Arc::new(BlankOnionBuilder),
        node_a.events.clone(),
        block_height_rx,
        PaymentSettings::from(&test_lightning_config()),
        node_a.tracker.clone(),
    );
    let prepared = manager
        .prepare_payment(
            PaymentRequest::Manual {
                destination: node_b.pubkey(),
                amount_msat: 5_000_000,
                payment_hash,
                payment_secret: None,
                final_cltv_delta: 18,
            },
            None,
        )
        .await
        .expect("prepare payment");
    let result = manager.send(prepared).await.expect("send payment");
    assert_eq!(result.status, PaymentStatus::Succeeded);
    assert_eq!(result.preimage, Some(preimage));

    let (a, b) = (&node_a, &node_b);
    wait_until(move || async move {
        a.channel_state(&channel_id).await.to_local_msat == 95_000_000
            && b.channel_state(&channel_id).await.to_local_msat == 5_000_000
    })
    .await;
}

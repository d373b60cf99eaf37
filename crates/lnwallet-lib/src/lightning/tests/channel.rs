use std::{sync::Arc, time::Duration};

use ractor::{rpc::CallResult, Actor, ActorRef};
use tokio::task::JoinHandle;

use crate::{
    expect_event, gen_rand_sha256_hash, init_tracing,
    invoice::PreimageStore,
    lightning::{
        channel::{
            closing_digest, commitment_digest, commitment_point_from_secret,
            default_channel_reserve, generate_from_seed, get_commitment_point,
            get_commitment_secret, validate_open_params, AddHtlcCommand, ChannelActor,
            ChannelActorMessage, ChannelActorState, ChannelCommand, ChannelInitializationOperation,
            ChannelLimits, ChannelParameters, ChannelRegistry, ChannelState, ClosingFlags,
            CloseFlags, FundingFlags, InMemorySigner, PeerMessageSink, ProcessingChannelError,
            QuiescenceFlags, ReestablishAction, ShutdownCommand, MAX_COMMITMENT_INDEX,
        },
        config::DEFAULT_MAX_FUNDING_AMOUNT_SAT,
        coordinator::DisconnectReason,
        events::{EventBus, HtlcResolution, WalletEvent},
        onchain::{OnChainError, OnChainWallet, PendingBroadcast},
        types::{channel_id_from_funding, sha256, Hash256, Privkey, ShortChannelId},
        wire::{
            tlv::TlvStream, AcceptChannel, ChannelReestablish, ClosingSigned, CommitmentSigned,
            FundingSigned, LightningMessage,
        },
    },
    store::{ChannelStore, MemoryStore, StoreError},
    wait_until, Error, MockOnChainWallet, RecordingSink, TestNode,
};

const FUNDING_SATOSHIS: u64 = 100_000;

fn limits() -> ChannelLimits {
    ChannelLimits {
        min_funding_amount_sat: 1_000,
        max_funding_amount_sat: DEFAULT_MAX_FUNDING_AMOUNT_SAT,
        min_to_self_delay: 144,
        max_to_self_delay: 2016,
        dust_limit_sat: 354,
    }
}

fn hex_of(bytes: [u8; 32]) -> String {
    hex::encode(bytes)
}

#[test]
fn test_generate_from_seed_vectors() {
    let max = (1u64 << 48) - 1;
    assert_eq!(max, MAX_COMMITMENT_INDEX);
    assert_eq!(
        hex_of(generate_from_seed(&[0x00; 32], max)),
        "02a40c85b6f28da08dfdbe0926c53fab2de6d28c10301f8f7c4073d5e42e3148"
    );
    assert_eq!(
        hex_of(generate_from_seed(&[0xff; 32], max)),
        "7cc854b54e3e0dcdb010d7a3fee464a9687be6e8db3be6854c475621e007a5dc"
    );
    assert_eq!(
        hex_of(generate_from_seed(&[0xff; 32], 0xaaaaaaaaaaa)),
        "56f4008fb007ca9acf0e15b054d5c9fd12ee06cea347914ddbaed70d1c13a528"
    );
    assert_eq!(
        hex_of(generate_from_seed(&[0xff; 32], 0x555555555555)),
        "9015daaeb06dba4ccc05b91b2f73bd54405f2be9f217fbacd3c5ac2e62327d31"
    );
    assert_eq!(
        hex_of(generate_from_seed(&[0x01; 32], 1)),
        "915c75942a26bb3a433a8ce2cb0427c29ec6c1775cfc78328b57f6ba7bfeaa9c"
    );
}

#[test]
fn test_commitment_secrets_count_down() {
    let seed = [0x42; 32];
    assert_eq!(
        get_commitment_secret(&seed, 0),
        generate_from_seed(&seed, MAX_COMMITMENT_INDEX)
    );
    assert_eq!(
        get_commitment_secret(&seed, 3),
        generate_from_seed(&seed, MAX_COMMITMENT_INDEX - 3)
    );
    assert_eq!(
        commitment_point_from_secret(&get_commitment_secret(&seed, 7)),
        Some(get_commitment_point(&seed, 7))
    );

    let signer = InMemorySigner::generate_from_seed(&seed);
    let secret = signer.get_commitment_secret(2);
    assert_eq!(
        commitment_point_from_secret(&secret),
        Some(signer.get_commitment_point(2))
    );
    assert_ne!(signer.get_commitment_point(2), signer.get_commitment_point(3));
}

#[test]
fn test_default_channel_reserve() {
    assert_eq!(default_channel_reserve(100_000, 354), 1_000);
    assert_eq!(default_channel_reserve(20_000, 354), 354);
}

#[test]
fn test_validate_open_params() {
    let limits = limits();
    assert_eq!(
        validate_open_params(&limits, 100_000, 0, 1_000, 144),
        Ok(())
    );
    assert_eq!(
        validate_open_params(&limits, 100_000, 100_000_000, 1_000, 2016),
        Ok(())
    );

    let rejected = [
        // Funding below the minimum wins over every other problem.
        (999, 0, 0, 0),
        (100_000, 0, 1_000, 143),
        (100_000, 0, 1_000, 2017),
        (100_000, 0, 353, 144),
        (100_000, 100_000_001, 1_000, 144),
        (DEFAULT_MAX_FUNDING_AMOUNT_SAT + 1, 0, 1_000, 144),
    ];
    for (funding, push, reserve, delay) in rejected {
        assert!(
            matches!(
                validate_open_params(&limits, funding, push, reserve, delay),
                Err(ProcessingChannelError::InvalidChannelParameters(_))
            ),
            "{} {} {} {} should be rejected",
            funding,
            push,
            reserve,
            delay
        );
    }

    let Err(ProcessingChannelError::InvalidChannelParameters(message)) =
        validate_open_params(&limits, 999, 0, 0, 0)
    else {
        panic!("expected invalid parameters");
    };
    assert!(message.contains("funding"), "{}", message);

    let Err(ProcessingChannelError::InvalidChannelParameters(message)) =
        validate_open_params(&limits, 100_000, 0, 0, 10)
    else {
        panic!("expected invalid parameters");
    };
    assert!(message.contains("to_self_delay"), "{}", message);
}

#[test]
fn test_huge_funding_amount_is_rejected() {
    // Its msat value does not fit in a u64.
    let funding_satoshis = u64::MAX / 500;
    let mut unbounded = limits();
    unbounded.max_funding_amount_sat = u64::MAX;

    for limits in [limits(), unbounded] {
        assert!(
            matches!(
                validate_open_params(&limits, funding_satoshis, 0, 1_000, 144),
                Err(ProcessingChannelError::InvalidChannelParameters(_))
            ),
            "{:?}",
            limits
        );
        let result = ChannelActorState::new_outbound_channel(
            gen_rand_sha256_hash(),
            Privkey::generate().pubkey(),
            Privkey::generate().pubkey(),
            &[7u8; 32],
            funding_satoshis,
            0,
            253,
            144,
            &limits,
        );
        assert!(
            matches!(
                result,
                Err(ProcessingChannelError::InvalidChannelParameters(_))
            ),
            "{:?}",
            result
        );
    }
}

fn fresh_channel_state() -> ChannelActorState {
    ChannelActorState::new_outbound_channel(
        gen_rand_sha256_hash(),
        Privkey::generate().pubkey(),
        Privkey::generate().pubkey(),
        &[7u8; 32],
        FUNDING_SATOSHIS,
        0,
        253,
        144,
        &limits(),
    )
    .expect("new channel")
}

#[test]
fn test_check_reestablish_on_fresh_channel() {
    let state = fresh_channel_state();
    assert_eq!(state.get_available_to_send_msat(), FUNDING_SATOSHIS * 1000);

    let ours = state.create_reestablish_message();
    assert_eq!(ours.channel_id, state.id);
    assert_eq!(ours.next_commitment_number, 1);
    assert_eq!(ours.next_revocation_number, 0);
    assert_eq!(state.check_reestablish(&ours), ReestablishAction::Resume);

    let mut ahead = ours.clone();
    ahead.next_commitment_number = 5;
    assert!(matches!(
        state.check_reestablish(&ahead),
        ReestablishAction::Desync(_)
    ));

    // Nothing was signed yet, so there is nothing to retransmit.
    let mut behind = ours.clone();
    behind.next_commitment_number = 0;
    assert!(matches!(
        state.check_reestablish(&behind),
        ReestablishAction::Desync(_)
    ));

    let mut revoked_ahead = ours;
    revoked_ahead.next_revocation_number = 2;
    assert!(matches!(
        state.check_reestablish(&revoked_ahead),
        ReestablishAction::Desync(_)
    ));
}

#[test]
fn test_channel_state_flags() {
    assert!(ChannelState::Closed(CloseFlags::COOPERATIVE).is_closed());
    assert!(ChannelState::ForceClosing.is_closed());
    assert!(!ChannelState::Offline.is_closed());
    assert!(!ChannelState::FundingSigned(FundingFlags::AWAITING_FUNDING_SIGNED).is_funded());
    assert!(ChannelState::FundingSigned(FundingFlags::AWAITING_CONFIRMATION).is_funded());
    assert!(ChannelState::Normal.is_funded());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_open_channel_to_normal() {
    init_tracing();
    let node_a = TestNode::new();
    let node_b = TestNode::new();
    node_a.connect_to(&node_b).await;

    let channel_id = node_a.open_channel_to(&node_b, FUNDING_SATOSHIS, 0).await;

    let state_a = node_a.channel_state(&channel_id).await;
    let state_b = node_b.channel_state(&channel_id).await;
    assert!(state_a.is_funder);
    assert!(!state_b.is_funder);
    assert_eq!(state_a.funding_txid, state_b.funding_txid);
    assert_eq!(state_a.short_channel_id, state_b.short_channel_id);
    assert_eq!(state_a.to_local_msat, FUNDING_SATOSHIS * 1000);
    assert_eq!(state_b.to_remote_msat, FUNDING_SATOSHIS * 1000);
    assert_eq!(state_b.to_local_msat, 0);
    assert_ne!(state_a.temporary_id, channel_id);

    let requests = node_a.wallet.funding_requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].amount_sat, FUNDING_SATOSHIS);
    assert_eq!(node_a.wallet.broadcast_fundings.lock().unwrap().len(), 1);
    assert!(node_b.wallet.funding_requests.lock().unwrap().is_empty());

    // Both sides persisted the channel under its final id.
    assert!(node_a
        .service
        .list_channels()
        .expect("list channels")
        .iter()
        .any(|c| c.id == channel_id));
    assert!(node_b
        .service
        .list_channels()
        .expect("list channels")
        .iter()
        .any(|c| c.id == channel_id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_open_channel_with_push_amount() {
    init_tracing();
    let node_a = TestNode::new();
    let node_b = TestNode::new();
    node_a.connect_to(&node_b).await;

    let channel_id = node_a
        .open_channel_to(&node_b, FUNDING_SATOSHIS, 20_000_000)
        .await;
    let state_a = node_a.channel_state(&channel_id).await;
    let state_b = node_b.channel_state(&channel_id).await;
    assert_eq!(state_a.to_local_msat, 80_000_000);
    assert_eq!(state_a.to_remote_msat, 20_000_000);
    assert_eq!(state_b.to_local_msat, 20_000_000);
    assert_eq!(state_b.to_remote_msat, 80_000_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_funding_failure_aborts_open() {
    init_tracing();
    let node_a = TestNode::new();
    let node_b = TestNode::new();
    node_a.connect_to(&node_b).await;
    node_a.wallet.set_fail_funding(true);

    let temporary_id = node_a
        .service
        .open_channel(node_b.pubkey(), FUNDING_SATOSHIS, 0)
        .await
        .expect("open channel");
    let node = &node_a;
    wait_until(move || async move {
        node.service.get_channel_state(&temporary_id).await.is_err()
    })
    .await;
    let stored = node_a.service.list_channels().expect("list channels");
    assert!(stored
        .iter()
        .any(|c| c.id == temporary_id && c.state == ChannelState::Closed(CloseFlags::FUNDING_ABORTED)));
    assert!(node_a.wallet.broadcast_fundings.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_add_htlc_is_fulfilled_by_payee() {
    init_tracing();
    let node_a = TestNode::new();
    let node_b = TestNode::new();
    node_a.connect_to(&node_b).await;
    let channel_id = node_a.open_channel_to(&node_b, FUNDING_SATOSHIS, 0).await;

    let state = node_a.channel_state(&channel_id).await;
    assert_eq!(state.get_available_to_send_msat(), 99_000_000);

    let preimage = gen_rand_sha256_hash();
    let payment_hash = sha256(preimage.as_bytes());
    node_b
        .store
        .insert_preimage(payment_hash, preimage)
        .expect("insert preimage");

    let mut events = node_a.subscribe();
    let htlc_id = node_a
        .service
        .add_htlc(
            &channel_id,
            AddHtlcCommand {
                amount_msat: 10_000_000,
                payment_hash,
                cltv_expiry: 500,
                onion_packet: None,
            },
        )
        .await
        .expect("add htlc");
    assert_eq!(htlc_id, 0);

    let resolved = expect_event(&mut events, |event| match event {
        WalletEvent::HtlcResolved {
            channel_id: id,
            htlc_id: resolved_id,
            resolution,
            ..
        } if *id == channel_id && *resolved_id == htlc_id => Some(resolution.clone()),
        _ => None,
    })
    .await;
    assert_eq!(resolved, HtlcResolution::Fulfilled { preimage });

    let (a, b) = (&node_a, &node_b);
    wait_until(move || async move {
        let state_a = a.channel_state(&channel_id).await;
        let state_b = b.channel_state(&channel_id).await;
        state_a.to_local_msat == 90_000_000
            && state_b.to_local_msat == 10_000_000
            && !state_a.has_pending_htlcs()
            && !state_b.has_pending_htlcs()
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_add_htlc_for_unknown_payment_fails() {
    init_tracing();
    let node_a = TestNode::new();
    let node_b = TestNode::new();
    node_a.connect_to(&node_b).await;
    let channel_id = node_a.open_channel_to(&node_b, FUNDING_SATOSHIS, 0).await;

    let mut events = node_a.subscribe();
    let payment_hash = gen_rand_sha256_hash();
    node_a
        .service
        .add_htlc(
            &channel_id,
            AddHtlcCommand {
                amount_msat: 5_000_000,
                payment_hash,
                cltv_expiry: 500,
                onion_packet: None,
            },
        )
        .await
        .expect("add htlc");

    let resolution = expect_event(&mut events, |event| match event {
        WalletEvent::HtlcResolved {
            payment_hash: hash,
            resolution,
            ..
        } if *hash == payment_hash => Some(resolution.clone()),
        _ => None,
    })
    .await;
    assert!(matches!(resolution, HtlcResolution::Failed { .. }));

    let (a, b) = (&node_a, &node_b);
    wait_until(move || async move {
        let state_a = a.channel_state(&channel_id).await;
        let state_b = b.channel_state(&channel_id).await;
        state_a.to_local_msat == FUNDING_SATOSHIS * 1000
            && !state_a.has_pending_htlcs()
            && !state_b.has_pending_htlcs()
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_add_htlc_above_balance_is_rejected() {
    init_tracing();
    let node_a = TestNode::new();
    let node_b = TestNode::new();
    node_a.connect_to(&node_b).await;
    let channel_id = node_a.open_channel_to(&node_b, FUNDING_SATOSHIS, 0).await;

    let result = node_a
        .service
        .add_htlc(
            &channel_id,
            AddHtlcCommand {
                amount_msat: 99_000_001,
                payment_hash: gen_rand_sha256_hash(),
                cltv_expiry: 500,
                onion_packet: None,
            },
        )
        .await;
    assert!(
        matches!(
            result,
            Err(crate::Error::ChannelError(
                ProcessingChannelError::InsufficientFunds { .. }
            ))
        ),
        "{:?}",
        result
    );

    // The acceptor has nothing to send yet.
    let result = node_b
        .service
        .add_htlc(
            &channel_id,
            AddHtlcCommand {
                amount_msat: 1_000,
                payment_hash: gen_rand_sha256_hash(),
                cltv_expiry: 500,
                onion_packet: None,
            },
        )
        .await;
    assert!(result.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_payment_hash_is_rejected() {
    init_tracing();
    let node_a = TestNode::new();
    let node_b = TestNode::new();
    node_a.connect_to(&node_b).await;
    let channel_id = node_a.open_channel_to(&node_b, FUNDING_SATOSHIS, 0).await;

    // Unknown to the payee, so the first htlc stays pending until it is failed back.
    let payment_hash = gen_rand_sha256_hash();
    let command = AddHtlcCommand {
        amount_msat: 1_000_000,
        payment_hash,
        cltv_expiry: 500,
        onion_packet: None,
    };
    node_a
        .service
        .add_htlc(&channel_id, command.clone())
        .await
        .expect("add htlc");
    let result = node_a.service.add_htlc(&channel_id, command).await;
    // Either still pending, or already failed back and then accepted again.
    if let Err(err) = result {
        assert!(
            matches!(
                err,
                crate::Error::ChannelError(ProcessingChannelError::DuplicatePaymentHash(hash))
                    if hash == payment_hash
            ) || matches!(
                err,
                crate::Error::ChannelError(ProcessingChannelError::WaitingTlcAck)
            ),
            "{:?}",
            err
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cooperative_close() {
    init_tracing();
    let node_a = TestNode::new();
    let node_b = TestNode::new();
    node_a.connect_to(&node_b).await;
    let channel_id = node_a.open_channel_to(&node_b, FUNDING_SATOSHIS, 0).await;

    node_a
        .service
        .shutdown_channel(&channel_id, ShutdownCommand::default())
        .await
        .expect("shutdown channel");

    for node in [&node_a, &node_b] {
        wait_until(move || async move {
            node.service
                .list_channels()
                .expect("list channels")
                .iter()
                .any(|c| c.id == channel_id && c.state == ChannelState::Closed(CloseFlags::COOPERATIVE))
        })
        .await;
        assert_eq!(node.wallet.closing_count(), 1);
        assert_eq!(node.wallet.commitment_count(), 0);
    }

    let stored = node_a
        .service
        .list_channels()
        .expect("list channels")
        .into_iter()
        .find(|c| c.id == channel_id)
        .expect("stored channel");
    assert!(stored.closing_txid.is_some());

    // A closed channel can not be used any more.
    let node = &node_a;
    wait_until(move || async move { node.service.get_channel_state(&channel_id).await.is_err() })
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_offline_channel_rejects_updates() {
    init_tracing();
    let node_a = TestNode::new();
    let node_b = TestNode::new();
    node_a.connect_to(&node_b).await;
    let channel_id = node_a.open_channel_to(&node_b, FUNDING_SATOSHIS, 0).await;

    node_b
        .coordinator
        .add_disconnect_vote(DisconnectReason::UserRequested);
    node_a
        .wait_for_channel_state(channel_id, |s| *s == ChannelState::Offline)
        .await;

    let result = node_a
        .service
        .add_htlc(
            &channel_id,
            AddHtlcCommand {
                amount_msat: 1_000_000,
                payment_hash: gen_rand_sha256_hash(),
                cltv_expiry: 500,
                onion_packet: None,
            },
        )
        .await;
    assert!(result.is_err(), "{:?}", result);
    let result = node_a
        .service
        .shutdown_channel(&channel_id, ShutdownCommand::default())
        .await;
    assert!(result.is_err(), "{:?}", result);
    assert_eq!(
        node_a.channel_state(&channel_id).await.state,
        ChannelState::Offline
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_force_close() {
    init_tracing();
    let node_a = TestNode::new();
    let node_b = TestNode::new();
    node_a.connect_to(&node_b).await;
    let channel_id = node_a.open_channel_to(&node_b, FUNDING_SATOSHIS, 0).await;

    node_a
        .service
        .force_close_channel(&channel_id)
        .await
        .expect("force close");
    assert_eq!(node_a.wallet.commitment_count(), 1);

    for node in [&node_a, &node_b] {
        wait_until(move || async move {
            node.service
                .list_channels()
                .expect("list channels")
                .iter()
                .any(|c| c.id == channel_id && c.state == ChannelState::ForceClosing)
        })
        .await;
    }
    assert_eq!(node_b.wallet.commitment_count(), 1);

    let result = node_a.service.force_close_channel(&channel_id).await;
    assert!(result.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_channel_goes_offline_and_is_reestablished() {
    init_tracing();
    let node_a = TestNode::new();
    let node_b = TestNode::new();
    node_a.connect_to(&node_b).await;
    let channel_id = node_a.open_channel_to(&node_b, FUNDING_SATOSHIS, 0).await;

    node_a
        .service
        .disconnect_peer(&node_b.pubkey())
        .await
        .expect("disconnect");
    node_a
        .wait_for_channel_state(channel_id, |s| *s == ChannelState::Offline)
        .await;
    node_b
        .wait_for_channel_state(channel_id, |s| *s == ChannelState::Offline)
        .await;
    let (a, b) = (&node_a, &node_b);
    wait_until(move || async move { !b.service.is_connected(&a.pubkey()).await }).await;

    node_a.connect_to(&node_b).await;
    node_a
        .wait_for_channel_state(channel_id, |s| *s == ChannelState::Normal)
        .await;
    node_b
        .wait_for_channel_state(channel_id, |s| *s == ChannelState::Normal)
        .await;

    // The channel is usable again.
    let preimage = gen_rand_sha256_hash();
    let payment_hash = sha256(preimage.as_bytes());
    node_b
        .store
        .insert_preimage(payment_hash, preimage)
        .expect("insert preimage");
    let mut events = node_a.subscribe();
    node_a
        .service
        .add_htlc(
            &channel_id,
            AddHtlcCommand {
                amount_msat: 2_000_000,
                payment_hash,
                cltv_expiry: 500,
                onion_packet: None,
            },
        )
        .await
        .expect("add htlc");
    let resolution = expect_event(&mut events, |event| match event {
        WalletEvent::HtlcResolved {
            payment_hash: hash,
            resolution,
            ..
        } if *hash == payment_hash => Some(resolution.clone()),
        _ => None,
    })
    .await;
    assert_eq!(resolution, HtlcResolution::Fulfilled { preimage });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_channel_state_changes_are_published() {
    init_tracing();
    let node_a = TestNode::new();
    let node_b = TestNode::new();
    node_a.connect_to(&node_b).await;
    let mut events = node_b.subscribe();
    let channel_id = node_a.open_channel_to(&node_b, FUNDING_SATOSHIS, 0).await;

    let peer = node_a.pubkey();
    expect_event(&mut events, |event| match event {
        WalletEvent::ChannelStateChanged {
            channel_id: id,
            peer: p,
            state: ChannelState::Normal,
        } if *id == channel_id && *p == peer => Some(()),
        _ => None,
    })
    .await;
}

fn test_htlc(amount_msat: u64) -> AddHtlcCommand {
    AddHtlcCommand {
        amount_msat,
        payment_hash: gen_rand_sha256_hash(),
        cltv_expiry: 500,
        onion_packet: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_force_close_without_funding_is_refused() {
    init_tracing();
    let node = TestNode::new();
    let state = ChannelActorState::new_outbound_channel(
        gen_rand_sha256_hash(),
        node.pubkey(),
        Privkey::generate().pubkey(),
        &[7u8; 32],
        FUNDING_SATOSHIS,
        0,
        253,
        144,
        &limits(),
    )
    .expect("new channel");
    node.store.save_channel(&state).expect("save channel");
    assert_eq!(node.service.restore_channels().await.expect("restore"), 1);

    let result = node.service.force_close_channel(&state.id).await;
    assert!(
        matches!(
            result,
            Err(Error::ChannelError(ProcessingChannelError::NoFundingTransaction))
        ),
        "{:?}",
        result
    );
    assert_eq!(node.wallet.commitment_count(), 0);
    let current = node.channel_state(&state.id).await;
    assert_eq!(current.state, state.state);
    assert_eq!(current.funding_txid, None);
    let stored = node
        .store
        .find_channel_by_id(&state.id)
        .expect("find channel")
        .expect("stored channel");
    assert_eq!(stored.state, state.state);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reestablish_closed_channel_is_refused() {
    init_tracing();
    let node = TestNode::new();
    let peer = Privkey::generate().pubkey();
    let mut state = fresh_channel_state();
    state.remote_pubkey = peer;
    state.state = ChannelState::Closed(CloseFlags::COOPERATIVE);
    node.store.save_channel(&state).expect("save channel");

    assert_eq!(node.service.restore_channels().await.expect("restore"), 0);
    let result = node.service.reestablish_channel(peer, state.id).await;
    assert!(
        matches!(
            result,
            Err(Error::ChannelError(ProcessingChannelError::ChannelNotReestablishable))
        ),
        "{:?}",
        result
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_quiescence() {
    init_tracing();
    let node_a = TestNode::new();
    let node_b = TestNode::new();
    node_a.connect_to(&node_b).await;
    let channel_id = node_a.open_channel_to(&node_b, FUNDING_SATOSHIS, 0).await;

    node_a
        .service
        .enter_quiescence(&channel_id)
        .await
        .expect("enter quiescence");
    for node in [&node_a, &node_b] {
        node.wait_for_channel_state(channel_id, |s| {
            *s == ChannelState::Quiescent(QuiescenceFlags::QUIESCENT)
        })
        .await;
    }

    let result = node_a.service.add_htlc(&channel_id, test_htlc(1_000_000)).await;
    assert!(
        matches!(
            result,
            Err(Error::ChannelError(ProcessingChannelError::InvalidState(_)))
        ),
        "{:?}",
        result
    );
    // Entering twice is refused.
    assert!(node_a.service.enter_quiescence(&channel_id).await.is_err());

    for node in [&node_a, &node_b] {
        node.service
            .exit_quiescence(&channel_id)
            .await
            .expect("exit quiescence");
        assert_eq!(
            node.channel_state(&channel_id).await.state,
            ChannelState::Normal
        );
    }
    node_a
        .service
        .add_htlc(&channel_id, test_htlc(1_000_000))
        .await
        .expect("add htlc after quiescence");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_update_fee_from_funder() {
    init_tracing();
    let node_a = TestNode::new();
    let node_b = TestNode::new();
    node_a.connect_to(&node_b).await;
    let channel_id = node_a.open_channel_to(&node_b, FUNDING_SATOSHIS, 0).await;

    let result = node_b.service.update_fee(&channel_id, 1_000).await;
    assert!(
        matches!(
            result,
            Err(Error::ChannelError(ProcessingChannelError::InvalidParameter(_)))
        ),
        "{:?}",
        result
    );

    node_a
        .service
        .update_fee(&channel_id, 1_000)
        .await
        .expect("update fee");
    for node in [&node_a, &node_b] {
        wait_until(move || async move {
            match node.service.get_channel_state(&channel_id).await {
                Ok(state) => state.feerate_per_kw == 1_000 && state.pending_feerate.is_none(),
                Err(_) => false,
            }
        })
        .await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_persistence_leaves_channel_untouched() {
    init_tracing();
    let node_a = TestNode::new();
    let node_b = TestNode::new();
    node_a.connect_to(&node_b).await;
    let channel_id = node_a.open_channel_to(&node_b, FUNDING_SATOSHIS, 0).await;
    let before = node_a.channel_state(&channel_id).await;
    let remote_before = node_b.channel_state(&channel_id).await;

    node_a.store.set_fail_writes(true);
    let result = node_a.service.add_htlc(&channel_id, test_htlc(1_000_000)).await;
    assert!(
        matches!(
            result,
            Err(Error::ChannelError(ProcessingChannelError::PersistenceFailure(
                StoreError::WriteFailed(_)
            )))
        ),
        "{:?}",
        result
    );
    node_a.store.set_fail_writes(false);

    assert_eq!(node_a.channel_state(&channel_id).await, before);
    // Nothing reached the peer.
    assert_eq!(node_b.channel_state(&channel_id).await, remote_before);
}

const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// A single channel actor wired to in-memory collaborators, with the remote side
/// played by the test.
struct ChannelFixture {
    store: MemoryStore,
    wallet: Arc<MockOnChainWallet>,
    sink: Arc<RecordingSink>,
    registry: ChannelRegistry,
    local_key: Privkey,
    remote_key: Privkey,
    remote_signer: InMemorySigner,
}

impl ChannelFixture {
    fn new() -> Self {
        Self {
            store: MemoryStore::new(),
            wallet: Arc::new(MockOnChainWallet::new()),
            sink: Arc::new(RecordingSink::default()),
            registry: ChannelRegistry::new(),
            local_key: Privkey::generate(),
            remote_key: Privkey::generate(),
            remote_signer: InMemorySigner::generate_from_seed(&[2u8; 32]),
        }
    }

    /// Our side of a channel we are opening, before the peer accepted it.
    fn outbound_channel(&self) -> ChannelActorState {
        ChannelActorState::new_outbound_channel(
            gen_rand_sha256_hash(),
            self.local_key.pubkey(),
            self.remote_key.pubkey(),
            &[7u8; 32],
            FUNDING_SATOSHIS,
            0,
            253,
            144,
            &limits(),
        )
        .expect("new channel")
    }

    /// A funded channel we opened, in `Normal` state.
    fn normal_channel(&self) -> ChannelActorState {
        let mut state = self.outbound_channel();
        let funding_txid = gen_rand_sha256_hash();
        state.funding_txid = Some(funding_txid);
        state.id = channel_id_from_funding(&funding_txid, 0);
        state.short_channel_id = Some(ShortChannelId::new(800_000, 1, 0));
        state.remote_params = Some(ChannelParameters {
            dust_limit_sat: 354,
            max_htlc_value_in_flight_msat: FUNDING_SATOSHIS * 1000,
            channel_reserve_sat: 1_000,
            htlc_minimum_msat: 1,
            to_self_delay: 144,
            max_accepted_htlcs: 30,
            basepoints: self.remote_signer.basepoints(),
        });
        state.state = ChannelState::Normal;
        state
    }

    fn accept_channel(&self, state: &ChannelActorState) -> AcceptChannel {
        AcceptChannel {
            temporary_channel_id: state.temporary_id,
            dust_limit_satoshis: 354,
            max_htlc_value_in_flight_msat: FUNDING_SATOSHIS * 1000,
            channel_reserve_satoshis: 1_000,
            htlc_minimum_msat: 1,
            minimum_depth: 1,
            to_self_delay: 144,
            max_accepted_htlcs: 30,
            basepoints: self.remote_signer.basepoints(),
            tlvs: TlvStream::new(),
        }
    }

    /// The remote signature over our commitment numbered `commitment_number`.
    fn commitment_signature(&self, channel_id: &Hash256, commitment_number: u64) -> CommitmentSigned {
        CommitmentSigned {
            channel_id: *channel_id,
            signature: self.remote_signer.sign(&commitment_digest(
                channel_id,
                &self.local_key.pubkey(),
                commitment_number,
            )),
            htlc_signatures: vec![],
            tlvs: TlvStream::new(),
        }
    }

    async fn spawn(
        &self,
        state: &ChannelActorState,
    ) -> (ActorRef<ChannelActorMessage>, JoinHandle<()>) {
        self.store.save_channel(state).expect("save channel");
        self.restore(state.id).await
    }

    async fn restore(&self, channel_id: Hash256) -> (ActorRef<ChannelActorMessage>, JoinHandle<()>) {
        let actor = ChannelActor::new(
            self.local_key.pubkey(),
            self.remote_key.pubkey(),
            self.store.clone(),
            Arc::clone(&self.wallet) as Arc<dyn OnChainWallet>,
            Arc::clone(&self.sink) as Arc<dyn PeerMessageSink>,
            EventBus::default(),
            self.registry.clone(),
        );
        Actor::spawn(None, actor, ChannelInitializationOperation::Restore(channel_id))
            .await
            .expect("spawn channel actor")
    }

    fn receive(&self, actor: &ActorRef<ChannelActorMessage>, message: LightningMessage) {
        actor
            .send_message(ChannelActorMessage::PeerMessage(message))
            .expect("channel actor alive");
    }

    /// The live state, once every message sent before is handled.
    async fn state(&self, actor: &ActorRef<ChannelActorMessage>) -> ChannelActorState {
        match actor
            .call(
                |reply| ChannelActorMessage::Command(ChannelCommand::GetState(reply)),
                Some(CALL_TIMEOUT),
            )
            .await
            .expect("call channel actor")
        {
            CallResult::Success(state) => state,
            _ => panic!("channel actor did not answer"),
        }
    }

    async fn force_close(
        &self,
        actor: &ActorRef<ChannelActorMessage>,
    ) -> Result<Hash256, ProcessingChannelError> {
        match actor
            .call(
                |reply| ChannelActorMessage::Command(ChannelCommand::ForceClose(reply)),
                Some(CALL_TIMEOUT),
            )
            .await
            .expect("call channel actor")
        {
            CallResult::Success(result) => result,
            _ => panic!("channel actor did not answer"),
        }
    }

    fn stored(&self, channel_id: &Hash256) -> ChannelActorState {
        self.store
            .find_channel_by_id(channel_id)
            .expect("find channel")
            .expect("stored channel")
    }

    fn sent_error(&self) -> bool {
        self.sink
            .messages
            .lock()
            .unwrap()
            .iter()
            .any(|(_, message)| matches!(message, LightningMessage::Error(_)))
    }

    fn sent_revoke_and_ack(&self) -> bool {
        self.sink
            .messages
            .lock()
            .unwrap()
            .iter()
            .any(|(_, message)| matches!(message, LightningMessage::RevokeAndAck(_)))
    }
}

#[tokio::test]
async fn test_force_close_is_not_broadcast_when_persistence_fails() {
    init_tracing();
    let fixture = ChannelFixture::new();
    let state = fixture.normal_channel();
    let (actor, _) = fixture.spawn(&state).await;

    fixture.store.set_fail_writes(true);
    let result = fixture.force_close(&actor).await;
    assert!(
        matches!(
            result,
            Err(ProcessingChannelError::PersistenceFailure(StoreError::WriteFailed(_)))
        ),
        "{:?}",
        result
    );
    assert_eq!(fixture.wallet.commitment_count(), 0);
    assert!(!fixture.sent_error());
    let stored = fixture.stored(&state.id);
    assert_eq!(stored.state, ChannelState::Normal);
    assert_eq!(stored.force_close_txid, None);
    assert_eq!(fixture.state(&actor).await.state, ChannelState::Normal);

    fixture.store.set_fail_writes(false);
    let txid = fixture.force_close(&actor).await.expect("force close");
    assert_eq!(fixture.wallet.commitment_count(), 1);
    assert!(fixture.sent_error());
    let stored = fixture.stored(&state.id);
    assert_eq!(stored.state, ChannelState::ForceClosing);
    assert_eq!(stored.force_close_txid, Some(txid));
    assert_eq!(stored.pending_broadcast, None);
}

#[tokio::test]
async fn test_failed_commitment_broadcast_is_retried_on_restore() {
    init_tracing();
    let fixture = ChannelFixture::new();
    let state = fixture.normal_channel();
    let (actor, handle) = fixture.spawn(&state).await;

    fixture.wallet.set_fail_broadcast(true);
    let result = fixture.force_close(&actor).await;
    assert!(
        matches!(
            result,
            Err(ProcessingChannelError::OnChain(OnChainError::BroadcastFailed(_)))
        ),
        "{:?}",
        result
    );
    let stored = fixture.stored(&state.id);
    assert_eq!(stored.state, ChannelState::ForceClosing);
    assert_eq!(stored.force_close_txid, None);
    assert!(matches!(
        stored.pending_broadcast,
        Some(PendingBroadcast::Commitment(_))
    ));

    actor.stop(None);
    handle.await.expect("channel actor stopped");
    fixture.wallet.set_fail_broadcast(false);
    let (actor, _) = fixture.restore(state.id).await;
    let restored = fixture.state(&actor).await;
    assert_eq!(fixture.wallet.commitment_count(), 1);
    assert!(restored.force_close_txid.is_some());
    assert_eq!(restored.pending_broadcast, None);
    assert_eq!(fixture.stored(&state.id), restored);
}

#[tokio::test]
async fn test_funding_is_not_broadcast_when_persistence_fails() {
    init_tracing();
    let fixture = ChannelFixture::new();
    let state = fixture.outbound_channel();
    let (actor, _) = fixture.spawn(&state).await;

    fixture.receive(
        &actor,
        LightningMessage::AcceptChannel(fixture.accept_channel(&state)),
    );
    let funded = fixture.state(&actor).await;
    assert_eq!(
        funded.state,
        ChannelState::FundingSigned(FundingFlags::AWAITING_FUNDING_SIGNED)
    );
    let channel_id = funded.id;
    assert_ne!(channel_id, state.temporary_id);
    let funding_signed = FundingSigned {
        channel_id,
        signature: fixture.remote_signer.sign(&commitment_digest(
            &channel_id,
            &fixture.local_key.pubkey(),
            0,
        )),
        tlvs: TlvStream::new(),
    };

    fixture.store.set_fail_writes(true);
    fixture.receive(&actor, LightningMessage::FundingSigned(funding_signed.clone()));
    assert_eq!(fixture.state(&actor).await.state, funded.state);
    assert!(fixture.wallet.broadcast_fundings.lock().unwrap().is_empty());
    assert_eq!(fixture.stored(&channel_id).state, funded.state);

    fixture.store.set_fail_writes(false);
    fixture.receive(&actor, LightningMessage::FundingSigned(funding_signed));
    let confirmed = fixture.state(&actor).await;
    assert_eq!(
        confirmed.state,
        ChannelState::FundingSigned(FundingFlags::AWAITING_CONFIRMATION)
    );
    assert_eq!(fixture.wallet.broadcast_fundings.lock().unwrap().len(), 1);
    assert_eq!(fixture.stored(&channel_id).pending_broadcast, None);
}

#[tokio::test]
async fn test_closing_is_not_broadcast_when_persistence_fails() {
    init_tracing();
    let fixture = ChannelFixture::new();
    let mut state = fixture.normal_channel();
    state.is_funder = false;
    state.state = ChannelState::ClosingNegotiation(ClosingFlags::SHUTDOWN_SENT);
    state.last_closing_fee_sent = Some(724);
    let (actor, _) = fixture.spawn(&state).await;
    let closing_signed = ClosingSigned {
        channel_id: state.id,
        fee_satoshis: 724,
        signature: fixture.remote_signer.sign(&closing_digest(&state.id, 724)),
        tlvs: TlvStream::new(),
    };

    fixture.store.set_fail_writes(true);
    fixture.receive(&actor, LightningMessage::ClosingSigned(closing_signed.clone()));
    assert_eq!(fixture.state(&actor).await.state, state.state);
    assert_eq!(fixture.wallet.closing_count(), 0);
    let stored = fixture.stored(&state.id);
    assert_eq!(stored.state, state.state);
    assert_eq!(stored.closing_txid, None);

    fixture.store.set_fail_writes(false);
    fixture.receive(&actor, LightningMessage::ClosingSigned(closing_signed));
    let (fixture, channel_id) = (&fixture, state.id);
    wait_until(move || async move {
        let stored = fixture.stored(&channel_id);
        stored.state == ChannelState::Closed(CloseFlags::COOPERATIVE) && stored.closing_txid.is_some()
    })
    .await;
    assert_eq!(fixture.wallet.closing_count(), 1);
    assert_eq!(fixture.wallet.closings.lock().unwrap()[0].fee_sat, 724);
}

#[tokio::test]
async fn test_invalid_commitment_signature_force_closes() {
    init_tracing();
    let fixture = ChannelFixture::new();
    let state = fixture.normal_channel();
    let (actor, _) = fixture.spawn(&state).await;

    // Signed for the wrong commitment number.
    let tampered = fixture.commitment_signature(&state.id, 2);
    fixture.receive(&actor, LightningMessage::CommitmentSigned(tampered));

    let current = fixture.state(&actor).await;
    assert_eq!(current.state, ChannelState::ForceClosing);
    assert!(current.force_close_txid.is_some());
    assert_eq!(current.commitment_numbers.get_local(), 0);
    assert_eq!(fixture.wallet.commitment_count(), 1);
    assert!(fixture.sent_error());
    assert!(!fixture.sent_revoke_and_ack());
    assert_eq!(fixture.stored(&state.id).state, ChannelState::ForceClosing);
}

#[tokio::test]
async fn test_invalid_funding_signature_aborts_unfunded_channel() {
    init_tracing();
    let fixture = ChannelFixture::new();
    let state = fixture.outbound_channel();
    let (actor, handle) = fixture.spawn(&state).await;

    fixture.receive(
        &actor,
        LightningMessage::AcceptChannel(fixture.accept_channel(&state)),
    );
    let channel_id = fixture.state(&actor).await.id;
    let forged = FundingSigned {
        channel_id,
        signature: InMemorySigner::generate_from_seed(&[3u8; 32]).sign(&commitment_digest(
            &channel_id,
            &fixture.local_key.pubkey(),
            0,
        )),
        tlvs: TlvStream::new(),
    };
    fixture.receive(&actor, LightningMessage::FundingSigned(forged));

    handle.await.expect("channel actor stopped");
    let stored = fixture.stored(&channel_id);
    assert_eq!(stored.state, ChannelState::Closed(CloseFlags::FUNDING_ABORTED));
    assert_eq!(stored.pending_broadcast, None);
    assert!(fixture.wallet.broadcast_fundings.lock().unwrap().is_empty());
    assert_eq!(fixture.wallet.commitment_count(), 0);
    assert!(fixture.sent_error());
    assert!(fixture.registry.get(&channel_id).is_none());
}

#[tokio::test]
async fn test_peer_update_is_refused_while_quiescent() {
    init_tracing();
    let fixture = ChannelFixture::new();
    let mut state = fixture.normal_channel();
    state.state = ChannelState::Quiescent(QuiescenceFlags::QUIESCENT);
    let (actor, _) = fixture.spawn(&state).await;

    let commitment = fixture.commitment_signature(&state.id, 1);
    fixture.receive(&actor, LightningMessage::CommitmentSigned(commitment));

    let current = fixture.state(&actor).await;
    assert_eq!(current.state, state.state);
    assert_eq!(current.commitment_numbers.get_local(), 0);
    assert!(!fixture.sent_revoke_and_ack());
    assert!(fixture
        .sink
        .messages
        .lock()
        .unwrap()
        .iter()
        .any(|(_, message)| matches!(message, LightningMessage::Warning(_))));
    assert_eq!(fixture.wallet.commitment_count(), 0);
}

fn reestablish_for(
    state: &ChannelActorState,
    next_commitment_number: u64,
    next_revocation_number: u64,
    your_last_per_commitment_secret: Hash256,
) -> ChannelReestablish {
    ChannelReestablish {
        channel_id: state.id,
        next_commitment_number,
        next_revocation_number,
        your_last_per_commitment_secret,
        my_current_per_commitment_point: Privkey::generate().pubkey(),
        tlvs: TlvStream::new(),
    }
}

#[tokio::test]
async fn test_reestablish_with_wrong_secret_disconnects() {
    init_tracing();
    let fixture = ChannelFixture::new();
    let mut state = fixture.normal_channel();
    state.commitment_numbers.local = 1;
    state.state = ChannelState::Offline;
    let (actor, _) = fixture.spawn(&state).await;

    let wrong = reestablish_for(&state, 1, 1, gen_rand_sha256_hash());
    fixture.receive(&actor, LightningMessage::ChannelReestablish(wrong));
    let current = fixture.state(&actor).await;
    assert_eq!(
        fixture.sink.disconnected.lock().unwrap().clone(),
        vec![fixture.remote_key.pubkey()]
    );
    assert_eq!(current.state, ChannelState::Offline);
    assert!(!fixture.sent_error());
    assert_eq!(fixture.wallet.commitment_count(), 0);

    let secret: Hash256 = state.signer.get_commitment_secret(0).into();
    let right = reestablish_for(&state, 1, 1, secret);
    fixture.receive(&actor, LightningMessage::ChannelReestablish(right));
    fixture.state(&actor).await;
    assert_eq!(fixture.sink.disconnected.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_reestablish_desync_fails_unfunded_channel() {
    init_tracing();
    let fixture = ChannelFixture::new();
    let state = fixture.outbound_channel();
    let (actor, _) = fixture.spawn(&state).await;

    let ahead = reestablish_for(&state, 5, 0, Hash256::default());
    fixture.receive(&actor, LightningMessage::ChannelReestablish(ahead));
    assert_eq!(fixture.state(&actor).await.state, ChannelState::Error);
    assert_eq!(fixture.stored(&state.id).state, ChannelState::Error);
    assert!(fixture.sent_error());
    assert!(fixture.sink.disconnected.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reestablish_with_mismatched_numbers_disconnects_peer() {
    init_tracing();
    let node_a = TestNode::new();
    let node_b = TestNode::new();
    node_a.connect_to(&node_b).await;
    let channel_id = node_a.open_channel_to(&node_b, FUNDING_SATOSHIS, 0).await;
    let state_b = node_b.channel_state(&channel_id).await;

    let entry = node_b
        .service
        .registry()
        .get(&channel_id)
        .expect("channel of node b");
    let ahead = reestablish_for(&state_b, 5, 0, Hash256::default());
    entry
        .actor
        .send_message(ChannelActorMessage::PeerMessage(
            LightningMessage::ChannelReestablish(ahead),
        ))
        .expect("channel actor alive");

    let (a, b) = (&node_a, &node_b);
    wait_until(move || async move { !b.service.is_connected(&a.pubkey()).await }).await;
    node_b
        .wait_for_channel_state(channel_id, |s| *s == ChannelState::Offline)
        .await;
    assert_eq!(node_a.wallet.commitment_count(), 0);
    assert_eq!(node_b.wallet.commitment_count(), 0);
}

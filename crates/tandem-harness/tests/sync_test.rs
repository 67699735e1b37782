//! Tests for cross-host synchronization.
//!
//! These tests validate the side channel under realistic network conditions:
//! - Packet loss (30% - announcements retransmit until acknowledged)
//! - Network partitions (announcing blocks until the partition heals)
//! - Without loss an announcement needs exactly one transmission
//! - Bounded retries, malformed datagrams and cancellation
//! - Retransmissions are delivered to the script exactly once
//! - State, checkpoints and test results reach the other tester

use std::{
    cell::Cell,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    rc::Rc,
    time::Duration,
};

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tandem_core::{
    Context, Engine, EngineError, Environment, RetryPolicy, State, SyncError, Synchronizer,
    TesterConfig, behavior::any_packet, config::DEFAULT_SYNC_PORT, shutdown,
};
use tandem_harness::{
    SeqAck, SimEnv, SimNetwork, TurmoilSocket,
    scenario::{CLIENT_ADDR, SERVER_ADDR, Scenario, oracle},
    seqack::{SEQ, connection_state},
};
use tandem_proto::{Datagram, SyncMessage};

const PORT: u16 = DEFAULT_SYNC_PORT;
const A: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
const B: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

/// Server host acknowledging every announcement and counting deliveries.
fn acknowledging_server(sim: &mut turmoil::Sim<'_>, delivered: Rc<Cell<usize>>) {
    sim.host("server", move || {
        let delivered = Rc::clone(&delivered);
        async move {
            let socket = TurmoilSocket::bind(PORT).await?;
            let mut sync = Synchronizer::new(socket, PORT, SimEnv::with_seed(1));
            loop {
                sync.await_message(None).await?;
                delivered.set(delivered.get() + 1);
            }
        }
    });
}

#[test]
fn announce_survives_packet_loss() {
    let mut sim = turmoil::Builder::new()
        .simulation_duration(Duration::from_secs(60))
        .fail_rate(0.3)
        .build_with_rng(Box::new(ChaCha20Rng::seed_from_u64(12345)));

    let delivered = Rc::new(Cell::new(0));
    acknowledging_server(&mut sim, Rc::clone(&delivered));

    sim.client("client", async {
        let socket = TurmoilSocket::bind(PORT).await?;
        let env = SimEnv::with_seed(2);
        let mut sync = Synchronizer::new(socket, PORT, env.clone());
        let server = turmoil::lookup("server");

        for round in 0..10u64 {
            let state = State::new().with("round", round);
            sync.announce(SyncMessage::State(state.into_entries()), server).await?;
        }

        // Let the last delivery settle on the server
        env.sleep(Duration::from_secs(1)).await;
        Ok(())
    });

    sim.run().expect("simulation failed");
    assert_eq!(delivered.get(), 10);
}

#[test]
fn announce_blocks_until_partition_heals() {
    let mut sim = turmoil::Builder::new()
        .simulation_duration(Duration::from_secs(60))
        .build_with_rng(Box::new(ChaCha20Rng::seed_from_u64(7)));

    let delivered = Rc::new(Cell::new(0));
    acknowledging_server(&mut sim, Rc::clone(&delivered));

    sim.client("client", async {
        let socket = TurmoilSocket::bind(PORT).await?;
        let env = SimEnv::with_seed(3);
        let mut sync = Synchronizer::new(socket, PORT, env.clone());
        let server = turmoil::lookup("server");

        turmoil::partition("client", "server");
        tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            turmoil::repair("client", "server");
        });

        let started = env.now();
        let transmissions = sync.announce(SyncMessage::Unit, server).await?;

        assert!(env.now() - started >= Duration::from_secs(2));
        assert!(transmissions >= 20, "only {transmissions} transmissions");

        env.sleep(Duration::from_secs(1)).await;
        Ok(())
    });

    sim.run().expect("simulation failed");
    assert_eq!(delivered.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn announce_without_loss_needs_one_transmission() {
    let net = SimNetwork::new();
    let mut a = Synchronizer::new(net.bind(SocketAddr::new(A, PORT)), PORT, SimEnv::with_seed(1));
    let mut b = Synchronizer::new(net.bind(SocketAddr::new(B, PORT)), PORT, SimEnv::with_seed(2));

    let (announced, received) =
        tokio::join!(a.announce(SyncMessage::Unit, B), b.await_message(Some(A)));

    assert_eq!(announced.unwrap(), 1);
    assert!(matches!(received, Ok((SyncMessage::Unit, source)) if source == A));
    assert_eq!(net.datagrams().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn retries_exhausted_after_policy_limit() {
    let net = SimNetwork::new();
    let env = SimEnv::new();
    let policy = RetryPolicy { interval: Duration::from_millis(100), max_attempts: Some(3) };
    let mut sync = Synchronizer::new(net.bind(SocketAddr::new(A, PORT)), PORT, env.clone())
        .with_policy(policy);

    let started = env.now();
    let result = sync.announce(SyncMessage::Unit, B).await;

    assert!(matches!(result, Err(SyncError::RetriesExhausted { attempts: 3 })));
    assert_eq!(env.now() - started, Duration::from_millis(300));
    assert_eq!(net.datagrams().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn retransmission_is_delivered_once() {
    let net = SimNetwork::new();
    let mut a = Synchronizer::new(net.bind(SocketAddr::new(A, PORT)), PORT, SimEnv::with_seed(1));
    let mut b = Synchronizer::new(net.bind(SocketAddr::new(B, PORT)), PORT, SimEnv::with_seed(2));

    // Lose B's first acknowledgment so A retransmits
    net.drop_next_datagrams(B, 1);

    let (announced, (first, second)) = tokio::join!(a.announce(SyncMessage::Unit, B), async {
        let first = b.await_message(Some(A)).await;
        let second = tokio::time::timeout(Duration::from_secs(2), b.await_message(Some(A))).await;
        (first, second)
    });

    assert_eq!(announced.unwrap(), 2);
    assert!(matches!(first, Ok((SyncMessage::Unit, source)) if source == A));
    assert!(second.is_err(), "repeat was delivered again");

    let acks = net
        .datagrams()
        .iter()
        .filter(|d| d.from.ip() == B)
        .filter(|d| Datagram::decode(&d.payload).is_ok_and(|dg| dg.message.is_ack()))
        .count();
    assert_eq!(acks, 2);
}

#[tokio::test(start_paused = true)]
async fn malformed_datagram_is_reported_and_not_acknowledged() {
    let net = SimNetwork::new();
    let raw = net.bind(SocketAddr::new(A, PORT));
    let mut b = Synchronizer::new(net.bind(SocketAddr::new(B, PORT)), PORT, SimEnv::new());

    tandem_core::DatagramChannel::send_to(&raw, &[0xff, 0x00, 0x13], SocketAddr::new(B, PORT))
        .await
        .unwrap();

    let result = b.await_message(None).await;
    assert!(matches!(result, Err(SyncError::Malformed(_))));
    assert_eq!(net.datagrams().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn datagrams_from_other_sources_are_ignored() {
    let net = SimNetwork::new();
    let stranger = IpAddr::V4(Ipv4Addr::new(10, 9, 9, 9));
    let policy = RetryPolicy { interval: Duration::from_millis(100), max_attempts: Some(2) };
    let mut s = Synchronizer::new(net.bind(SocketAddr::new(stranger, PORT)), PORT, SimEnv::new())
        .with_policy(policy);
    let mut a = Synchronizer::new(net.bind(SocketAddr::new(A, PORT)), PORT, SimEnv::with_seed(1));
    let mut b = Synchronizer::new(net.bind(SocketAddr::new(B, PORT)), PORT, SimEnv::with_seed(2));

    let (from_stranger, from_a, received) = tokio::join!(
        s.announce(SyncMessage::Unit, B),
        async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            a.announce(SyncMessage::Verdict { name: "x".into(), passed: true }, B).await
        },
        b.await_message(Some(A)),
    );

    assert!(matches!(from_stranger, Err(SyncError::RetriesExhausted { .. })));
    assert!(from_a.is_ok());
    assert_eq!(received.unwrap(), (SyncMessage::Verdict { name: "x".into(), passed: true }, A));
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_every_wait() {
    let net = SimNetwork::new();
    let (trigger, shutdown) = shutdown::channel();
    let mut engine = Engine::new(
        SeqAck,
        net.attach(A),
        net.bind(SocketAddr::new(A, PORT)),
        TesterConfig::default(),
        SimEnv::new(),
    )
    .with_shutdown(shutdown);

    let (received, ()) = tokio::join!(engine.receive_state(Some(B)), async {
        tokio::time::sleep(Duration::from_secs(2)).await;
        trigger.trigger();
    });
    assert!(matches!(received, Err(EngineError::Cancelled)));

    // Already triggered: later waits return at once
    let mut ctx = Context::with_state(connection_state(A, B, 0));
    let waited = engine.wait_for_packet(&mut ctx, None, any_packet(), None).await;
    assert!(matches!(waited, Err(EngineError::Cancelled)));
    assert!(matches!(engine.checkpoint_ready(B).await, Err(EngineError::Cancelled)));
}

#[test]
fn state_and_verdict_reach_the_other_tester() {
    let received = Rc::new(Cell::new(None));
    let seen = Rc::clone(&received);

    Scenario::new()
        .with_isns(100, 500)
        .client(|peer| {
            Box::pin(async move {
                peer.share_state().await?;
                peer.engine().send_test_result("handshake", true, SERVER_ADDR).await
            })
        })
        .server(move |peer| {
            Box::pin(async move {
                let state = peer.receive_state().await?.expect("state, not a checkpoint");
                seen.set(state.get_u64(SEQ));

                let (name, passed) = peer.engine().get_test_result(CLIENT_ADDR).await?;
                assert_eq!(name, "handshake");
                assert!(passed);
                Ok(())
            })
        })
        .oracle(oracle::no_errors())
        .run()
        .expect("scenario should succeed");

    assert_eq!(received.get(), Some(100));
}

#[test]
fn checkpoints_order_both_testers() {
    Scenario::new()
        .client(|peer| {
            Box::pin(async move {
                peer.checkpoint().await?;
                peer.await_checkpoint().await?;
                assert_eq!(peer.receive_state().await?, None);
                Ok(())
            })
        })
        .server(|peer| {
            Box::pin(async move {
                peer.await_checkpoint().await?;
                peer.checkpoint().await?;
                peer.engine().send_state(None, Some(CLIENT_ADDR)).await
            })
        })
        .oracle(oracle::no_errors())
        .run()
        .expect("scenario should succeed");
}

#[test]
fn state_without_destination_is_rejected() {
    Scenario::new()
        .client(|peer| {
            Box::pin(async move {
                let result = peer.engine().send_state(Some(&State::new()), None).await;
                assert!(matches!(result, Err(EngineError::InvalidUsage(_))));
                Ok(())
            })
        })
        .oracle(Box::new(|world| {
            assert!(world.datagrams().is_empty());
            Ok(())
        }))
        .run()
        .expect("scenario should succeed");
}

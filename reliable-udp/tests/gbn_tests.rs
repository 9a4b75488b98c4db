//! End-to-end Go-Back-N sessions on loopback.
//!
//! Every test runs a real [`Server`] and a real [`Sender`] over UDP and
//! checks both the sender's [`SessionReport`] and the receiver's view of the
//! same session.

use std::net::SocketAddr;
use std::time::Duration;

use reliable_udp::{
    config::{AckMode, ReceiverConfig, SchedulingModel, SenderConfig, TimeoutConfig},
    connection::ConnError,
    packet::{flags, Packet},
    receiver::ReceiverReport,
    socket::Socket,
    state::Phase,
    Sender, Server,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const SESSION_LIMIT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn ephemeral() -> Socket {
    Socket::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap())
        .await
        .expect("bind socket")
}

fn receiver_config(drop_probability: f64, ack_mode: AckMode) -> ReceiverConfig {
    ReceiverConfig {
        drop_probability,
        seed: Some(7),
        fin_grace: Duration::from_millis(20),
        idle_timeout: Duration::from_secs(2),
        ack_mode,
    }
}

/// Generous timeouts so a lossless run never retransmits spuriously.
fn steady_sender(model: SchedulingModel, ack_mode: AckMode) -> SenderConfig {
    SenderConfig {
        timeout: TimeoutConfig {
            default_timeout: Duration::from_secs(1),
            min_timeout: Duration::from_millis(500),
            multiplier: 5.0,
        },
        teardown_timeout: Duration::from_millis(500),
        ack_poll_interval: Duration::from_millis(20),
        model,
        ack_mode,
        seed: Some(42),
        ..SenderConfig::default()
    }
}

/// Short timeouts for sessions that are expected to lose packets.
fn eager_sender(max_transmissions: u32) -> SenderConfig {
    eager_sender_with(max_transmissions, SchedulingModel::DedicatedReceiver, AckMode::ByteOffset)
}

fn eager_sender_with(
    max_transmissions: u32,
    model: SchedulingModel,
    ack_mode: AckMode,
) -> SenderConfig {
    SenderConfig {
        timeout: TimeoutConfig {
            default_timeout: Duration::from_millis(50),
            min_timeout: Duration::from_millis(20),
            multiplier: 3.0,
        },
        max_transmissions,
        teardown_timeout: Duration::from_millis(500),
        ack_poll_interval: Duration::from_millis(20),
        model,
        ack_mode,
        seed: Some(42),
        ..SenderConfig::default()
    }
}

async fn start_server(
    config: ReceiverConfig,
) -> (SocketAddr, JoinHandle<Result<ReceiverReport, ConnError>>) {
    let server = Server::bind("127.0.0.1:0".parse().unwrap(), config)
        .await
        .expect("bind server");
    let addr = server.local_addr();
    (addr, tokio::spawn(async move { server.serve_session().await }))
}

async fn finish(server: JoinHandle<Result<ReceiverReport, ConnError>>) -> ReceiverReport {
    tokio::time::timeout(SESSION_LIMIT, server)
        .await
        .expect("server session timed out")
        .expect("server task panicked")
        .expect("server session failed")
}

// ---------------------------------------------------------------------------
// Lossless sessions
// ---------------------------------------------------------------------------

/// 20 blocks, window 5, no loss: every block goes out once and is acked once.
#[tokio::test]
async fn lossless_session_sends_each_block_once() {
    let (addr, server) = start_server(receiver_config(0.0, AckMode::ByteOffset)).await;
    let config = steady_sender(SchedulingModel::DedicatedReceiver, AckMode::ByteOffset);

    let mut sender = Sender::connect(ephemeral().await, addr, config)
        .await
        .expect("connect");
    let report = tokio::time::timeout(SESSION_LIMIT, sender.transfer_random(20))
        .await
        .expect("transfer timed out")
        .expect("transfer failed");

    assert_eq!(report.blocks, 20);
    assert_eq!(report.transmissions, 20);
    assert_eq!(report.final_base, 21);
    assert_eq!(report.acknowledged, 20);
    assert_eq!(report.go_back_events, 0);
    assert_eq!(format!("{:.2}", report.loss_rate * 100.0), "0.00");
    let rtt = report.rtt.expect("rtt samples");
    assert_eq!(rtt.count, 20);
    assert!(rtt.min_ms <= rtt.max_ms);
    assert_eq!(sender.phase(), Phase::Closed);

    let received = finish(server).await;
    assert_eq!(received.phase, Phase::Closed);
    assert_eq!(received.stats.accepted, 20);
    assert_eq!(received.stats.dropped, 0);
    assert_eq!(received.stats.out_of_order, 0);
}

#[tokio::test]
async fn poll_model_completes_session() {
    let (addr, server) = start_server(receiver_config(0.0, AckMode::ByteOffset)).await;
    let config = steady_sender(SchedulingModel::Poll, AckMode::ByteOffset);

    let mut sender = Sender::connect(ephemeral().await, addr, config)
        .await
        .expect("connect");
    let report = tokio::time::timeout(SESSION_LIMIT, sender.transfer_random(15))
        .await
        .expect("transfer timed out")
        .expect("transfer failed");

    assert_eq!(report.final_base, 16);
    assert_eq!(report.acknowledged, 15);
    assert!(report.transmissions >= 15);
    assert_eq!(sender.phase(), Phase::Closed);
    assert_eq!(finish(server).await.phase, Phase::Closed);
}

#[tokio::test]
async fn block_index_acks_complete_session() {
    let (addr, server) = start_server(receiver_config(0.0, AckMode::BlockIndex)).await;
    let config = steady_sender(SchedulingModel::DedicatedReceiver, AckMode::BlockIndex);

    let mut sender = Sender::connect(ephemeral().await, addr, config)
        .await
        .expect("connect");
    let report = tokio::time::timeout(SESSION_LIMIT, sender.transfer_random(10))
        .await
        .expect("transfer timed out")
        .expect("transfer failed");

    assert_eq!(report.final_base, 11);
    assert_eq!(report.transmissions, 10);

    let received = finish(server).await;
    // Block-index mode tracks the next expected block, not bytes.
    assert_eq!(received.expected, 11);
    assert_eq!(received.stats.accepted, 10);
}

/// A file-sized payload arrives contiguously: the receiver's byte frontier
/// ends one past the last byte.
#[tokio::test]
async fn byte_payload_is_delivered_contiguously() {
    let (addr, server) = start_server(receiver_config(0.0, AckMode::ByteOffset)).await;
    let config = SenderConfig {
        block_len: 5..=10,
        ..steady_sender(SchedulingModel::DedicatedReceiver, AckMode::ByteOffset)
    };
    let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();

    let mut sender = Sender::connect(ephemeral().await, addr, config)
        .await
        .expect("connect");
    let report = tokio::time::timeout(SESSION_LIMIT, sender.transfer_bytes(&data))
        .await
        .expect("transfer timed out")
        .expect("transfer failed");

    assert_eq!(report.acknowledged, report.blocks);

    let received = finish(server).await;
    assert_eq!(received.stats.bytes_accepted, 1000);
    assert_eq!(received.expected, 1001);
}

// ---------------------------------------------------------------------------
// Lossy sessions
// ---------------------------------------------------------------------------

/// Half the DATA datagrams are dropped; the session still finishes, with
/// retransmissions and a non-zero loss rate.
#[tokio::test]
async fn lossy_session_retransmits_and_finishes() {
    let (addr, server) = start_server(receiver_config(0.5, AckMode::ByteOffset)).await;

    let mut sender = Sender::connect(ephemeral().await, addr, eager_sender(200))
        .await
        .expect("connect");
    let report = tokio::time::timeout(SESSION_LIMIT, sender.transfer_random(10))
        .await
        .expect("transfer timed out")
        .expect("transfer failed");

    assert_eq!(report.final_base, 11);
    assert!(report.transmissions > 10, "{report}");
    assert!(report.loss_rate > 0.0);
    assert!(report.go_back_events > 0);

    let received = finish(server).await;
    assert_eq!(received.stats.accepted, 10);
    assert!(received.stats.dropped > 0);
}

/// The poll model recovers from loss through its own receive deadline.
#[tokio::test]
async fn lossy_poll_session_retransmits_and_finishes() {
    let (addr, server) = start_server(receiver_config(0.5, AckMode::ByteOffset)).await;
    let config = eager_sender_with(200, SchedulingModel::Poll, AckMode::ByteOffset);

    let mut sender = Sender::connect(ephemeral().await, addr, config)
        .await
        .expect("connect");
    let report = tokio::time::timeout(SESSION_LIMIT, sender.transfer_random(10))
        .await
        .expect("transfer timed out")
        .expect("transfer failed");

    assert_eq!(report.final_base, 11);
    assert_eq!(report.acknowledged, 10);
    assert!(report.transmissions > 10, "{report}");
    assert!(report.go_back_events > 0);
    assert_eq!(sender.phase(), Phase::Closed);

    let received = finish(server).await;
    assert_eq!(received.phase, Phase::Closed);
    assert_eq!(received.stats.accepted, 10);
    assert!(received.stats.dropped > 0);
}

#[tokio::test]
async fn lossy_poll_session_with_block_index_acks() {
    let (addr, server) = start_server(receiver_config(0.5, AckMode::BlockIndex)).await;
    let config = eager_sender_with(200, SchedulingModel::Poll, AckMode::BlockIndex);

    let mut sender = Sender::connect(ephemeral().await, addr, config)
        .await
        .expect("connect");
    let report = tokio::time::timeout(SESSION_LIMIT, sender.transfer_random(10))
        .await
        .expect("transfer timed out")
        .expect("transfer failed");

    assert_eq!(report.final_base, 11);
    assert!(report.transmissions > 10, "{report}");
    assert!(report.loss_rate > 0.0);

    let received = finish(server).await;
    assert_eq!(received.phase, Phase::Closed);
    assert_eq!(received.expected, 11);
    assert_eq!(received.stats.accepted, 10);
}

/// Every DATA datagram is lost: the sender gives up on block 1 and the
/// receiver abandons the silent peer without a FIN.
#[tokio::test]
async fn total_loss_exhausts_retries() {
    let config = ReceiverConfig {
        idle_timeout: Duration::from_millis(300),
        ..receiver_config(1.0, AckMode::ByteOffset)
    };
    let (addr, server) = start_server(config).await;

    let mut sender = Sender::connect(ephemeral().await, addr, eager_sender(3))
        .await
        .expect("connect");
    let result = tokio::time::timeout(SESSION_LIMIT, sender.transfer_random(5))
        .await
        .expect("transfer timed out");

    match result {
        Err(ConnError::RetriesExhausted { index, transmissions }) => {
            assert_eq!(index, 1);
            assert_eq!(transmissions, 3);
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert_eq!(sender.phase(), Phase::Closed);

    let received = finish(server).await;
    assert_eq!(received.phase, Phase::Transferring);
    assert_eq!(received.stats.accepted, 0);
    assert!(received.stats.dropped >= 3);
    assert_eq!(received.expected, 1);
}

/// Once a failed peer is abandoned, the next sender gets a handshake.
#[tokio::test]
async fn abandoned_peer_frees_server_for_next_sender() {
    let config = ReceiverConfig {
        idle_timeout: Duration::from_millis(300),
        ..receiver_config(1.0, AckMode::ByteOffset)
    };
    let server = Server::bind("127.0.0.1:0".parse().unwrap(), config)
        .await
        .expect("bind server");
    let addr = server.local_addr();
    let server_task = tokio::spawn(async move {
        let first = server.serve_session().await?;
        let second = server.serve_session().await?;
        Ok::<_, ConnError>((first, second))
    });

    let mut first = Sender::connect(ephemeral().await, addr, eager_sender(2))
        .await
        .expect("first connect");
    let result = tokio::time::timeout(SESSION_LIMIT, first.transfer_random(3))
        .await
        .expect("transfer timed out");
    assert!(matches!(result, Err(ConnError::RetriesExhausted { .. })));

    let second = tokio::time::timeout(
        SESSION_LIMIT,
        Sender::connect(ephemeral().await, addr, eager_sender(2)),
    )
    .await
    .expect("second connect timed out")
    .expect("second connect");
    assert_eq!(second.phase(), Phase::Transferring);

    let (a, b) = tokio::time::timeout(SESSION_LIMIT, server_task)
        .await
        .expect("server timed out")
        .expect("server task panicked")
        .expect("server failed");
    assert_eq!(a.peer, first.local_addr());
    assert_eq!(a.phase, Phase::Transferring);
    assert_eq!(b.peer, second.local_addr());
    assert_eq!(b.phase, Phase::Transferring);
}

// ---------------------------------------------------------------------------
// Server behaviour
// ---------------------------------------------------------------------------

/// Garbage from a third party neither crashes the server nor disturbs a
/// session.
#[tokio::test]
async fn malformed_datagrams_are_ignored() {
    let (addr, server) = start_server(receiver_config(0.0, AckMode::ByteOffset)).await;

    let noise = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    noise.send_to(&[0xde, 0xad, 0xbe], addr).await.unwrap();

    let mut sender = Sender::connect(
        ephemeral().await,
        addr,
        steady_sender(SchedulingModel::DedicatedReceiver, AckMode::ByteOffset),
    )
    .await
    .expect("connect");
    noise.send_to(&[0u8; 7], addr).await.unwrap();
    let report = tokio::time::timeout(SESSION_LIMIT, sender.transfer_random(5))
        .await
        .expect("transfer timed out")
        .expect("transfer failed");

    assert_eq!(report.final_base, 6);
    assert_eq!(finish(server).await.phase, Phase::Closed);
}

/// A FIN from a peer the server has no session with still gets the full
/// teardown reply.
#[tokio::test]
async fn stray_fin_gets_teardown_reply() {
    let (addr, server) = start_server(receiver_config(0.0, AckMode::ByteOffset)).await;
    let peer = ephemeral().await;

    peer.send_to(&Packet::fin(0), addr).await.unwrap();

    let (first, _) = peer
        .recv_timeout(Duration::from_secs(2))
        .await
        .unwrap()
        .expect("ACK+FIN");
    assert!(first.header.has(flags::ACK | flags::FIN));
    let (second, _) = peer
        .recv_timeout(Duration::from_secs(2))
        .await
        .unwrap()
        .expect("FIN");
    assert_eq!(second.header.flags, flags::FIN);
    server.abort();
}

/// Two senders at once against the multi-peer server.
#[tokio::test]
async fn server_handles_concurrent_peers() {
    let server = Server::bind(
        "127.0.0.1:0".parse().unwrap(),
        receiver_config(0.0, AckMode::ByteOffset),
    )
    .await
    .expect("bind server");
    let addr = server.local_addr();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.run(shutdown_rx));

    let session = |count: usize| async move {
        let mut sender = Sender::connect(
            ephemeral().await,
            addr,
            steady_sender(SchedulingModel::DedicatedReceiver, AckMode::ByteOffset),
        )
        .await?;
        sender.transfer_random(count).await
    };
    let (a, b) = tokio::time::timeout(SESSION_LIMIT, async {
        tokio::join!(session(8), session(12))
    })
    .await
    .expect("sessions timed out");

    assert_eq!(a.expect("first session").final_base, 9);
    assert_eq!(b.expect("second session").final_base, 13);

    shutdown_tx.send(true).unwrap();
    let reports = tokio::time::timeout(SESSION_LIMIT, server_task)
        .await
        .expect("server shutdown timed out")
        .expect("server task panicked")
        .expect("server failed");

    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.phase == Phase::Closed));
    let mut accepted: Vec<u64> = reports.iter().map(|r| r.stats.accepted).collect();
    accepted.sort_unstable();
    assert_eq!(accepted, vec![8, 12]);
}

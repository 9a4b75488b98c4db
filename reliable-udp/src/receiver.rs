//! Receiving server.
//!
//! A [`Server`] owns one bound UDP socket and answers every peer that
//! talks to it:
//!
//! - SYN is answered with SYN+ACK (again for every repeated SYN).
//! - DATA first passes through the [`LossSimulator`]; a survivor is offered
//!   to the peer's [`ReceiveTracker`] and answered with a cumulative ACK,
//!   in order or not.
//! - FIN is answered with ACK+FIN, a grace delay, then a plain FIN, after
//!   which the peer is closed.
//!
//! A peer that stays silent for the configured idle timeout is abandoned and
//! reported in whatever phase it reached.
//!
//! [`Server::serve_session`] handles exactly one peer inline.
//! [`Server::run`] demultiplexes by source address into one task per peer
//! and keeps going until told to shut down:
//!
//! ```text
//!  socket ──▶ dispatcher ──(mpsc)──▶ peer task 127.0.0.1:50001
//!                 │       ──(mpsc)──▶ peer task 127.0.0.1:50002
//!                 └─ watch<bool> shutdown
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

use crate::config::ReceiverConfig;
use crate::connection::{ConnError, Connection, Event};
use crate::packet::{flags, Packet};
use crate::simulator::LossSimulator;
use crate::socket::{Socket, SocketError};
use crate::state::Phase;
use crate::tracker::{Delivery, ReceiveTracker, TrackerStats};

/// Per-peer inbound queue depth.  Datagrams beyond it are dropped, as the
/// network would.
const PEER_QUEUE_CAPACITY: usize = 256;

/// What one peer session amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    pub peer: SocketAddr,
    /// `Closed` after a completed teardown; any other phase means the peer
    /// went silent and was abandoned.
    pub phase: Phase,
    /// Next expected byte offset or block index when the session ended.
    pub expected: u32,
    pub stats: TrackerStats,
}

/// One datagram routed to a peer session.
#[derive(Debug)]
enum Inbound {
    Packet(Packet),
    Malformed,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Server {
    socket: Arc<Socket>,
    config: ReceiverConfig,
}

impl Server {
    /// Validate `config` and bind to `addr`.
    pub async fn bind(addr: SocketAddr, config: ReceiverConfig) -> Result<Self, ConnError> {
        config.validate()?;
        let socket = Socket::bind(addr).await?;
        log::info!(
            "[receiver] listening on {} (drop probability {:.2}, {:?} acks)",
            socket.local_addr,
            config.drop_probability,
            config.ack_mode
        );
        Ok(Self {
            socket: Arc::new(socket),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    /// Serve a single peer from its SYN through teardown.
    ///
    /// Datagrams from any other address are ignored while the session is
    /// live and do not count as activity.  Returns early, with the session's
    /// current phase, if the peer goes silent for the idle timeout.
    pub async fn serve_session(&self) -> Result<ReceiverReport, ConnError> {
        let mut session: Option<PeerSession> = None;
        loop {
            let received = match session.as_ref() {
                Some(s) => {
                    let next = timeout_at(s.idle_deadline(), recv_inbound(&self.socket));
                    match next.await {
                        Ok(received) => received,
                        Err(_elapsed) => {
                            s.log_abandoned();
                            return Ok(s.report());
                        }
                    }
                }
                None => recv_inbound(&self.socket).await,
            };
            let Some((inbound, addr)) = received else {
                continue;
            };
            match session.as_mut() {
                Some(s) if s.peer == addr => {
                    s.handle(inbound).await?;
                    if s.is_closed() {
                        return Ok(s.report());
                    }
                }
                Some(_) => log::debug!("[receiver] busy; ignoring datagram from {addr}"),
                None => match inbound {
                    Inbound::Packet(pkt) if pkt.header.has(flags::SYN) => {
                        let mut s = PeerSession::new(
                            Arc::clone(&self.socket),
                            addr,
                            &self.config,
                            self.config.seed,
                        );
                        s.handle(Inbound::Packet(pkt)).await?;
                        session = Some(s);
                    }
                    Inbound::Packet(pkt) if pkt.header.has(flags::FIN) => {
                        tokio::spawn(answer_stray_fin(
                            Arc::clone(&self.socket),
                            addr,
                            self.config.fin_grace,
                        ));
                    }
                    _ => log::debug!("[receiver] no session with {addr}; ignoring"),
                },
            }
        }
    }

    /// Serve any number of peers concurrently until `shutdown` turns `true`
    /// (or its sender is dropped).
    ///
    /// Returns one report per peer session, in completion order.
    pub async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<ReceiverReport>, ConnError> {
        let mut peers: HashMap<SocketAddr, PeerHandle> = HashMap::new();
        let mut reports = Vec::new();
        let mut sessions_started: u64 = 0;
        // Abandoned sessions end on their own; this sweeps up their handles
        // even when no further datagrams arrive.
        let mut sweep = tokio::time::interval(self.config.idle_timeout);

        loop {
            if *shutdown.borrow() {
                break;
            }
            let received = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = sweep.tick() => {
                    reap_finished(&mut peers, &mut reports).await?;
                    continue;
                }
                received = recv_inbound(&self.socket) => received,
            };
            let Some((inbound, addr)) = received else {
                continue;
            };

            let inbound = match peers.get(&addr) {
                Some(peer) => match peer.tx.try_send(inbound) {
                    Ok(()) => continue,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        log::debug!("[receiver] queue for {addr} full; dropping datagram");
                        continue;
                    }
                    // The session ended; a SYN may start a new one.
                    Err(mpsc::error::TrySendError::Closed(inbound)) => {
                        if let Some(finished) = peers.remove(&addr) {
                            reports.push(finished.join().await?);
                        }
                        inbound
                    }
                },
                None => inbound,
            };

            match inbound {
                Inbound::Packet(pkt) if pkt.header.has(flags::SYN) => {
                    let seed = self.config.seed.map(|s| s.wrapping_add(sessions_started));
                    sessions_started += 1;
                    let (tx, rx) = mpsc::channel(PEER_QUEUE_CAPACITY);
                    let session = PeerSession::new(Arc::clone(&self.socket), addr, &self.config, seed);
                    let handle = tokio::spawn(peer_task(session, rx));
                    // A fresh queue always has room.
                    let _ = tx.try_send(Inbound::Packet(pkt));
                    peers.insert(addr, PeerHandle { tx, handle });
                    log::info!("[receiver] new peer {addr} ({} active)", peers.len());
                }
                Inbound::Packet(pkt) if pkt.header.has(flags::FIN) => {
                    tokio::spawn(answer_stray_fin(
                        Arc::clone(&self.socket),
                        addr,
                        self.config.fin_grace,
                    ));
                }
                _ => log::debug!("[receiver] no session with {addr}; ignoring"),
            }

            reap_finished(&mut peers, &mut reports).await?;
        }

        log::info!("[receiver] shutting down; {} session(s) still open", peers.len());
        for (_, peer) in peers.drain() {
            reports.push(peer.join().await?);
        }
        Ok(reports)
    }
}

/// Move the reports of every finished peer task into `reports`.
async fn reap_finished(
    peers: &mut HashMap<SocketAddr, PeerHandle>,
    reports: &mut Vec<ReceiverReport>,
) -> Result<(), ConnError> {
    let finished: Vec<SocketAddr> = peers
        .iter()
        .filter(|(_, p)| p.handle.is_finished())
        .map(|(addr, _)| *addr)
        .collect();
    for addr in finished {
        if let Some(peer) = peers.remove(&addr) {
            let report = peer.join().await?;
            log::info!("[receiver] session with {addr} ended in {}", report.phase);
            reports.push(report);
        }
    }
    Ok(())
}

/// Receive one datagram, turning decode failures into [`Inbound::Malformed`].
///
/// `None` means nothing attributable arrived (an I/O error).
async fn recv_inbound(socket: &Socket) -> Option<(Inbound, SocketAddr)> {
    match socket.recv_from().await {
        Ok((pkt, addr)) => Some((Inbound::Packet(pkt), addr)),
        Err(SocketError::Packet {
            addr: Some(addr),
            source,
        }) => {
            log::warn!("[receiver] malformed datagram from {addr}: {source}");
            Some((Inbound::Malformed, addr))
        }
        Err(e) => {
            log::warn!("[receiver] receive error: {e}");
            None
        }
    }
}

/// Teardown reply for a FIN from a peer with no live session, typically a
/// retransmission after we already closed.
async fn answer_stray_fin(socket: Arc<Socket>, peer: SocketAddr, grace: std::time::Duration) {
    log::info!("[receiver] ← FIN from {peer} with no session; replaying teardown");
    if let Err(e) = socket.send_to(&Packet::fin_ack(0), peer).await {
        log::warn!("[receiver] ACK+FIN to {peer}: {e}");
        return;
    }
    tokio::time::sleep(grace).await;
    if let Err(e) = socket.send_to(&Packet::fin(0), peer).await {
        log::warn!("[receiver] FIN to {peer}: {e}");
    }
}

// ---------------------------------------------------------------------------
// Per-peer session
// ---------------------------------------------------------------------------

struct PeerHandle {
    tx: mpsc::Sender<Inbound>,
    handle: JoinHandle<ReceiverReport>,
}

impl PeerHandle {
    async fn join(self) -> Result<ReceiverReport, ConnError> {
        drop(self.tx);
        self.handle.await.map_err(|e| ConnError::Task(e.to_string()))
    }
}

async fn peer_task(mut session: PeerSession, mut rx: mpsc::Receiver<Inbound>) -> ReceiverReport {
    loop {
        let inbound = match timeout_at(session.idle_deadline(), rx.recv()).await {
            Ok(Some(inbound)) => inbound,
            // Dispatcher gone: the server is shutting down.
            Ok(None) => break,
            Err(_elapsed) => {
                session.log_abandoned();
                break;
            }
        };
        if let Err(e) = session.handle(inbound).await {
            log::warn!("[receiver] session with {} failed: {e}", session.peer);
            break;
        }
        if session.is_closed() {
            break;
        }
    }
    session.report()
}

#[derive(Debug)]
struct PeerSession {
    socket: Arc<Socket>,
    peer: SocketAddr,
    conn: Connection,
    tracker: ReceiveTracker,
    loss: LossSimulator,
    fin_grace: std::time::Duration,
    idle_timeout: std::time::Duration,
    last_heard: Instant,
}

impl PeerSession {
    fn new(
        socket: Arc<Socket>,
        peer: SocketAddr,
        config: &ReceiverConfig,
        seed: Option<u64>,
    ) -> Self {
        Self {
            socket,
            peer,
            conn: Connection::receiver(),
            tracker: ReceiveTracker::new(config.ack_mode),
            loss: LossSimulator::new(config.drop_probability, seed),
            fin_grace: config.fin_grace,
            idle_timeout: config.idle_timeout,
            last_heard: Instant::now(),
        }
    }

    /// When the peer counts as gone unless it sends something first.
    fn idle_deadline(&self) -> Instant {
        self.last_heard + self.idle_timeout
    }

    fn log_abandoned(&self) {
        log::warn!(
            "[receiver] {} silent for {:?}; abandoning session in {} ({} block(s) accepted)",
            self.peer,
            self.idle_timeout,
            self.conn.phase(),
            self.tracker.stats.accepted
        );
    }

    fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    fn report(&self) -> ReceiverReport {
        ReceiverReport {
            peer: self.peer,
            phase: self.conn.phase(),
            expected: self.tracker.expected(),
            stats: self.tracker.stats,
        }
    }

    async fn handle(&mut self, inbound: Inbound) -> Result<(), ConnError> {
        self.last_heard = Instant::now();
        let pkt = match inbound {
            Inbound::Packet(pkt) => pkt,
            Inbound::Malformed => {
                self.tracker.on_malformed();
                return Ok(());
            }
        };
        let h = pkt.header;

        if h.has(flags::SYN) {
            if let Err(e) = self.conn.apply(Event::RecvSyn) {
                log::debug!("[receiver] ignoring SYN from {}: {e}", self.peer);
                return Ok(());
            }
            let ack = self.tracker.ack_number();
            self.socket.send_to(&Packet::syn_ack(ack), self.peer).await?;
            log::info!("[receiver] ← SYN from {}; → SYN+ACK ack={ack}", self.peer);
        } else if h.has(flags::FIN) {
            if let Err(e) = self.conn.apply(Event::RecvFin) {
                log::debug!("[receiver] ignoring FIN from {}: {e}", self.peer);
                return Ok(());
            }
            let ack = self.tracker.ack_number();
            self.socket.send_to(&Packet::fin_ack(ack), self.peer).await?;
            log::info!("[receiver] ← FIN from {}; → ACK+FIN", self.peer);

            tokio::time::sleep(self.fin_grace).await;
            self.socket.send_to(&Packet::fin(ack), self.peer).await?;
            self.conn.apply(Event::SendFin)?;
            log::info!(
                "[receiver] → FIN; {} closed ({} block(s), {} byte(s))",
                self.peer,
                self.tracker.stats.accepted,
                self.tracker.stats.bytes_accepted
            );
        } else if h.is_data() {
            self.on_data(&pkt).await?;
        } else {
            log::debug!("[receiver] ignoring {:?} from {}", h, self.peer);
        }
        Ok(())
    }

    async fn on_data(&mut self, pkt: &Packet) -> Result<(), ConnError> {
        let seq = pkt.header.seq;
        if !self.conn.is_transferring() {
            log::debug!("[receiver] DATA seq={seq} outside transfer; ignoring");
            return Ok(());
        }
        if self.loss.should_drop() {
            self.tracker.on_drop();
            log::info!("[receiver] simulated loss of DATA seq={seq}");
            return Ok(());
        }
        match self.tracker.on_data(seq, pkt.payload.len()) {
            Delivery::Accepted => log::debug!(
                "[receiver] ← DATA seq={seq} len={} accepted",
                pkt.payload.len()
            ),
            Delivery::OutOfOrder { expected } => {
                log::info!("[receiver] ← DATA seq={seq} out of order (expected {expected})")
            }
        }
        let ack = self.tracker.ack_number();
        self.socket.send_to(&Packet::ack(ack), self.peer).await?;
        log::debug!("[receiver] → ACK {ack}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn lossless() -> ReceiverConfig {
        ReceiverConfig {
            drop_probability: 0.0,
            seed: Some(1),
            fin_grace: Duration::from_millis(10),
            ..ReceiverConfig::default()
        }
    }

    async fn pair() -> (Arc<Socket>, Socket, PeerSession) {
        let server = Arc::new(Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let client = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let session = PeerSession::new(Arc::clone(&server), client.local_addr, &lossless(), Some(1));
        (server, client, session)
    }

    async fn recv(sock: &Socket) -> Packet {
        sock.recv_timeout(Duration::from_secs(2))
            .await
            .unwrap()
            .expect("reply")
            .0
    }

    #[tokio::test]
    async fn syn_then_data_is_acked_cumulatively() {
        let (_server, client, mut s) = pair().await;

        s.handle(Inbound::Packet(Packet::syn())).await.unwrap();
        let reply = recv(&client).await;
        assert!(reply.header.has(flags::SYN | flags::ACK));
        assert_eq!(s.conn.phase(), Phase::Transferring);

        s.handle(Inbound::Packet(Packet::data(1, vec![b'A'; 10])))
            .await
            .unwrap();
        assert_eq!(recv(&client).await.header.ack, 11);

        // Out of order: duplicate ACK of the frontier.
        s.handle(Inbound::Packet(Packet::data(21, vec![b'C'; 10])))
            .await
            .unwrap();
        assert_eq!(recv(&client).await.header.ack, 11);
        assert_eq!(s.report().stats.out_of_order, 1);
    }

    #[tokio::test]
    async fn data_before_syn_is_ignored() {
        let (_server, client, mut s) = pair().await;
        s.handle(Inbound::Packet(Packet::data(1, vec![b'A'; 4])))
            .await
            .unwrap();
        assert!(client
            .recv_timeout(Duration::from_millis(100))
            .await
            .unwrap()
            .is_none());
        assert_eq!(s.report().stats.accepted, 0);
    }

    #[tokio::test]
    async fn fin_runs_teardown_to_closed() {
        let (_server, client, mut s) = pair().await;
        s.handle(Inbound::Packet(Packet::syn())).await.unwrap();
        recv(&client).await;

        s.handle(Inbound::Packet(Packet::fin(0))).await.unwrap();
        let first = recv(&client).await;
        assert!(first.header.has(flags::ACK | flags::FIN));
        let second = recv(&client).await;
        assert!(second.header.has(flags::FIN));
        assert!(!second.header.has(flags::ACK));
        assert!(s.is_closed());
    }

    #[tokio::test]
    async fn malformed_datagrams_are_counted() {
        let (_server, _client, mut s) = pair().await;
        s.handle(Inbound::Malformed).await.unwrap();
        assert_eq!(s.report().stats.malformed, 1);
        assert_eq!(s.conn.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn silent_peer_is_abandoned_mid_transfer() {
        let server = Arc::new(Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let client = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let config = ReceiverConfig {
            idle_timeout: Duration::from_millis(100),
            ..lossless()
        };
        let session = PeerSession::new(server, client.local_addr, &config, Some(1));
        let (tx, rx) = mpsc::channel(8);
        tx.send(Inbound::Packet(Packet::syn())).await.unwrap();
        tx.send(Inbound::Packet(Packet::data(1, vec![b'A'; 10])))
            .await
            .unwrap();

        // `tx` stays alive, so only the idle timeout can end the task.
        let report = tokio::time::timeout(Duration::from_secs(5), peer_task(session, rx))
            .await
            .expect("idle session never ended");
        assert_eq!(report.phase, Phase::Transferring);
        assert_eq!(report.stats.accepted, 1);
        assert_eq!(report.expected, 11);
        drop(tx);
    }

    #[tokio::test]
    async fn activity_pushes_idle_deadline_back() {
        let (_server, _client, mut s) = pair().await;
        let before = s.idle_deadline();
        tokio::time::sleep(Duration::from_millis(20)).await;
        s.handle(Inbound::Malformed).await.unwrap();
        assert!(s.idle_deadline() > before);
    }
}

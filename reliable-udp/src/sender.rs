//! Sender session: handshake, Go-Back-N transfer, teardown.
//!
//! # Lifecycle
//!
//! ```text
//!  Sender::connect ── SYN ──▶ ◀── SYN+ACK ──  (Transferring)
//!        │
//!  transfer(blocks)
//!        ├── DedicatedReceiver: AckReceiver task reads the socket,
//!        │                       sender loop waits on Notify
//!        └── Poll:              one bounded receive per round
//!        │
//!  teardown ── FIN ──▶ ◀── ACK+FIN ── ◀── FIN ── ACK ──▶  (Closed)
//! ```
//!
//! ```ignore
//! let socket = Socket::bind("0.0.0.0:0".parse()?).await?;
//! let mut sender = Sender::connect(socket, peer, SenderConfig::default()).await?;
//! let report = sender.transfer_random(20).await?;
//! println!("{report}");
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tokio::time::timeout_at;

use crate::ack_receiver::{is_pure_ack, log_ack, AckReceiver, SharedWindow};
use crate::block::{self, Block};
use crate::config::{SchedulingModel, SenderConfig};
use crate::connection::{ConnError, Connection, Event};
use crate::packet::{flags, Packet};
use crate::socket::Socket;
use crate::state::Phase;
use crate::stats::SessionReport;
use crate::window::{SendWindow, Transmission};

/// Capacity of the listener → sender control channel.  Only teardown
/// packets travel on it.
const CONTROL_CHANNEL_CAPACITY: usize = 16;

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// The sending side of one session.
///
/// Obtain one with [`Sender::connect`]; every `transfer*` method runs the
/// data phase to completion and then tears the connection down.
#[derive(Debug)]
pub struct Sender {
    socket: Arc<Socket>,
    peer: SocketAddr,
    config: SenderConfig,
    conn: Connection,
}

impl Sender {
    /// Validate `config` and perform the three-way handshake with `peer`.
    ///
    /// SYN is retransmitted up to `handshake_attempts` times.  A reply from
    /// `peer` that is not SYN+ACK fails the handshake at once.
    pub async fn connect(
        socket: Socket,
        peer: SocketAddr,
        config: SenderConfig,
    ) -> Result<Self, ConnError> {
        config.validate()?;
        let mut sender = Self {
            socket: Arc::new(socket),
            peer,
            config,
            conn: Connection::sender(),
        };
        sender.handshake().await?;
        Ok(sender)
    }

    pub fn phase(&self) -> Phase {
        self.conn.phase()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    /// Partition `data` into blocks and deliver them.
    pub async fn transfer_bytes(&mut self, data: &[u8]) -> Result<SessionReport, ConnError> {
        let mut rng = self.block_rng();
        let blocks = block::partition(data, self.config.block_len.clone(), &mut rng)?;
        self.transfer(blocks).await
    }

    /// Generate `count` random blocks and deliver them.
    ///
    /// A count that could overrun 32-bit byte offsets fails with
    /// [`ConfigError::StreamTooLarge`](crate::config::ConfigError::StreamTooLarge)
    /// before anything is sent.
    pub async fn transfer_random(&mut self, count: usize) -> Result<SessionReport, ConnError> {
        let mut rng = self.block_rng();
        let blocks = block::random_blocks(count, self.config.block_len.clone(), &mut rng)?;
        self.transfer(blocks).await
    }

    /// Deliver `blocks` in order, then close the connection.
    ///
    /// Returns the session report once the peer has acknowledged every
    /// block and teardown has finished.
    pub async fn transfer(&mut self, blocks: Vec<Block>) -> Result<SessionReport, ConnError> {
        if !self.conn.is_transferring() {
            return Err(ConnError::InvalidTransition {
                role: self.conn.role(),
                phase: self.conn.phase(),
                event: Event::SendFin,
            });
        }
        log::info!(
            "[sender] transferring {} block(s) to {} ({:?} model)",
            blocks.len(),
            self.peer,
            self.config.model
        );
        let window = SendWindow::new(blocks, &self.config);
        let result = match self.config.model {
            SchedulingModel::DedicatedReceiver => self.run_dedicated(window).await,
            SchedulingModel::Poll => self.run_poll(window).await,
        };
        if result.is_err() {
            self.conn.abort();
        }
        result
    }

    fn block_rng(&self) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        }
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    async fn handshake(&mut self) -> Result<(), ConnError> {
        for attempt in 1..=self.config.handshake_attempts {
            self.socket.send_to(&Packet::syn(), self.peer).await?;
            self.conn.apply(Event::SendSyn)?;
            log::info!("[sender] → SYN (attempt {attempt})");

            let deadline = tokio::time::Instant::now() + self.config.handshake_timeout;
            loop {
                let (pkt, addr) = match timeout_at(deadline, self.socket.recv_from()).await {
                    Err(_elapsed) => break,
                    Ok(Ok(received)) => received,
                    Ok(Err(e)) if e.is_malformed_datagram() => {
                        log::warn!("[sender] discarding datagram: {e}");
                        continue;
                    }
                    Ok(Err(e)) => {
                        log::warn!("[sender] handshake receive: {e}");
                        break;
                    }
                };
                if addr != self.peer {
                    continue;
                }
                self.conn.on_handshake_reply(pkt.header.flags)?;
                log::info!("[sender] ← SYN+ACK ack={}; connected", pkt.header.ack);
                return Ok(());
            }
            log::debug!("[sender] no SYN+ACK within {:?}", self.config.handshake_timeout);
        }
        self.conn.abort();
        Err(ConnError::HandshakeFailed)
    }

    // -----------------------------------------------------------------------
    // Data phase
    // -----------------------------------------------------------------------

    /// Dedicated-receiver model: a spawned [`AckReceiver`] owns all socket
    /// reads while this loop schedules rounds and retransmissions.
    async fn run_dedicated(&mut self, window: SendWindow) -> Result<SessionReport, ConnError> {
        let shared = Arc::new(SharedWindow::new(window));
        let (control_tx, mut control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let listener = AckReceiver::spawn(
            Arc::clone(&self.socket),
            self.peer,
            Arc::clone(&shared),
            control_tx,
            self.config.ack_poll_interval,
            self.config.ack_mode,
        );

        let result = async {
            loop {
                let (timeout, batch) = {
                    let mut w = shared.window.lock().await;
                    if w.is_complete() {
                        break;
                    }
                    (w.timeout(), w.fill_round(Instant::now())?)
                };
                self.send_batch(&batch).await?;

                // Woken early by any ACK; otherwise the round's timeout
                // elapses and the expiry scan below does the work.
                let _ = tokio::time::timeout(timeout, shared.ack_arrived.notified()).await;

                let resend = {
                    let mut w = shared.window.lock().await;
                    if w.is_complete() {
                        break;
                    }
                    let now = Instant::now();
                    match w.oldest_expired(now, timeout) {
                        Some(from) => {
                            log::info!("[sender] timeout on block {from} ({timeout:?}); going back");
                            w.go_back(from, now)?
                        }
                        None => Vec::new(),
                    }
                };
                self.send_batch(&resend).await?;
            }
            let report = shared.window.lock().await.report();
            self.teardown(ControlSource::Channel(&mut control_rx)).await?;
            Ok::<_, ConnError>(report)
        }
        .await;

        listener.stop().await?;
        result
    }

    /// Poll model: each round sends, then performs one receive bounded by
    /// the round's timeout.
    async fn run_poll(&mut self, mut window: SendWindow) -> Result<SessionReport, ConnError> {
        while !window.is_complete() {
            let timeout = window.timeout();
            let batch = window.fill_round(Instant::now())?;
            self.send_batch(&batch).await?;

            match self.socket.recv_timeout(timeout).await {
                Ok(Some((pkt, addr))) if addr == self.peer && is_pure_ack(&pkt.header) => {
                    let outcome = window.on_ack(pkt.header.ack, Instant::now());
                    log_ack(&pkt.header, outcome, window.base(), self.config.ack_mode);
                }
                Ok(Some((pkt, addr))) => {
                    log::debug!("[sender] ignoring {:?} from {addr}", pkt.header);
                }
                Ok(None) => log::debug!("[sender] receive deadline passed"),
                Err(e) if e.is_malformed_datagram() => {
                    log::warn!("[sender] discarding datagram: {e}");
                }
                Err(e) => log::debug!("[sender] receive error: {e}"),
            }

            if window.is_complete() {
                break;
            }
            let now = Instant::now();
            if let Some(from) = window.oldest_expired(now, timeout) {
                log::info!("[sender] timeout on block {from} ({timeout:?}); going back");
                let resend = window.go_back(from, now)?;
                self.send_batch(&resend).await?;
            }
        }
        let report = window.report();
        let socket = Arc::clone(&self.socket);
        self.teardown(ControlSource::Socket(&socket)).await?;
        Ok(report)
    }

    async fn send_batch(&self, batch: &[Transmission]) -> Result<(), ConnError> {
        for t in batch {
            self.socket.send_to(&t.packet, self.peer).await?;
            let h = &t.packet.header;
            let verb = if t.retransmit { "↻ resent" } else { "→" };
            log::debug!(
                "[sender] {verb} DATA block={} seq={} len={}",
                t.index,
                h.seq,
                h.payload_len
            );
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// FIN → ACK+FIN → FIN → ACK.
    ///
    /// Exhausting the FIN attempts fails the session.  A peer that
    /// acknowledges our FIN but never sends its own is closed anyway.
    async fn teardown(&mut self, mut source: ControlSource<'_>) -> Result<(), ConnError> {
        let wait = self.config.teardown_timeout;
        let mut fin_acked = false;

        // Anything queued now predates our FIN and cannot answer it.
        let stale = source.discard_stale().await;
        if stale > 0 {
            log::debug!("[sender] discarded {stale} stale control packet(s)");
        }

        'attempts: for attempt in 1..=self.config.teardown_attempts {
            self.socket.send_to(&Packet::fin(0), self.peer).await?;
            self.conn.apply(Event::SendFin)?;
            log::info!("[sender] → FIN (attempt {attempt})");

            let deadline = tokio::time::Instant::now() + wait;
            while let Some(pkt) = source.next(self.peer, deadline).await {
                if pkt.header.has(flags::ACK | flags::FIN) {
                    self.conn.apply(Event::RecvFinAck)?;
                    log::info!("[sender] ← ACK+FIN");
                    fin_acked = true;
                    break 'attempts;
                }
                log::debug!("[sender] waiting for ACK+FIN, got {:?}", pkt.header);
            }
        }
        if !fin_acked {
            self.conn.abort();
            return Err(ConnError::TeardownFailed);
        }

        let deadline = tokio::time::Instant::now() + wait * self.config.teardown_attempts;
        while let Some(pkt) = source.next(self.peer, deadline).await {
            let h = pkt.header;
            if h.has(flags::FIN) && !h.has(flags::ACK) {
                self.conn.apply(Event::RecvFin)?;
                log::info!("[sender] ← FIN");
                self.socket.send_to(&Packet::ack(0), self.peer).await?;
                log::info!("[sender] → last ACK; closed");
                return Ok(());
            }
        }
        log::warn!("[sender] peer FIN never arrived; closing");
        self.conn.abort();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Teardown packet sources
// ---------------------------------------------------------------------------

/// Where teardown replies come from: straight off the socket in the poll
/// model, or forwarded by the ACK listener in the dedicated model.
enum ControlSource<'a> {
    Socket(&'a Socket),
    Channel(&'a mut mpsc::Receiver<Packet>),
}

impl ControlSource<'_> {
    /// Drop every packet already waiting, returning how many were dropped.
    async fn discard_stale(&mut self) -> usize {
        let mut dropped = 0;
        match self {
            Self::Channel(rx) => {
                while rx.try_recv().is_ok() {
                    dropped += 1;
                }
            }
            // An already-expired deadline still polls the receive once.
            Self::Socket(socket) => {
                let now = tokio::time::Instant::now();
                while let Ok(result) = timeout_at(now, socket.recv_from()).await {
                    if result.is_ok() {
                        dropped += 1;
                    }
                }
            }
        }
        dropped
    }

    /// Next FIN-bearing packet from `peer`, or `None` once `deadline` passes.
    async fn next(&mut self, peer: SocketAddr, deadline: tokio::time::Instant) -> Option<Packet> {
        match self {
            Self::Channel(rx) => timeout_at(deadline, rx.recv()).await.ok().flatten(),
            Self::Socket(socket) => loop {
                match timeout_at(deadline, socket.recv_from()).await {
                    Err(_elapsed) => return None,
                    Ok(Ok((pkt, addr))) if addr == peer && pkt.header.has(flags::FIN) => {
                        return Some(pkt);
                    }
                    Ok(Ok(_)) => continue,
                    Ok(Err(e)) => log::debug!("[sender] teardown receive: {e}"),
                }
            },
        }
    }
}

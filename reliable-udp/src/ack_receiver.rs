//! Dedicated ACK listener for the sender.
//!
//! In the dedicated-receiver scheduling model the sender loop never reads
//! the socket during a session.  An [`AckReceiver`] task does instead:
//!
//! ```text
//!            ┌──────────────┐   lock, on_ack, unlock   ┌────────────────┐
//!  socket ──▶│ AckReceiver  │─────────────────────────▶│ SharedWindow   │
//!            │   (task)     │── notify_one ───────────▶│  Mutex + Notify│
//!            └──────┬───────┘                          └───────▲────────┘
//!                   │ FIN-bearing packets (mpsc)               │
//!                   ▼                                          │
//!              sender loop ─────── lock, fill/go_back, unlock ─┘
//! ```
//!
//! The window lock is only ever held around state updates, never across a
//! socket call.  The task checks its run flag at the top of every
//! iteration and its receive is bounded by a poll interval, so it winds
//! down promptly once teardown is over.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::AckMode;
use crate::connection::ConnError;
use crate::packet::{clock_string, flags, Header, Packet};
use crate::socket::Socket;
use crate::window::{AckOutcome, SendWindow};

/// Window state shared between the sender loop and its ACK listener.
#[derive(Debug)]
pub struct SharedWindow {
    pub window: Mutex<SendWindow>,
    /// Signalled whenever an ACK has been applied.
    pub ack_arrived: Notify,
}

impl SharedWindow {
    pub fn new(window: SendWindow) -> Self {
        Self {
            window: Mutex::new(window),
            ack_arrived: Notify::new(),
        }
    }
}

/// Handle to a running ACK listener task.
///
/// Dropping the handle clears the run flag; the task exits within one poll
/// interval.
#[derive(Debug)]
pub struct AckReceiver {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AckReceiver {
    /// Spawn the listener.
    ///
    /// Packets from `peer` carrying FIN are forwarded on `control_tx`; pure
    /// ACKs are applied to `shared`; everything else is ignored.
    pub fn spawn(
        socket: Arc<Socket>,
        peer: SocketAddr,
        shared: Arc<SharedWindow>,
        control_tx: mpsc::Sender<Packet>,
        poll_interval: Duration,
        ack_mode: AckMode,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let handle = tokio::spawn(listen(
            socket,
            peer,
            shared,
            control_tx,
            poll_interval,
            ack_mode,
            Arc::clone(&running),
        ));
        Self {
            running,
            handle: Some(handle),
        }
    }

    /// Clear the run flag and wait for the task to finish.
    pub async fn stop(mut self) -> Result<(), ConnError> {
        self.running.store(false, Ordering::Release);
        match self.handle.take() {
            Some(handle) => handle.await.map_err(|e| ConnError::Task(e.to_string())),
            None => Ok(()),
        }
    }
}

impl Drop for AckReceiver {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

async fn listen(
    socket: Arc<Socket>,
    peer: SocketAddr,
    shared: Arc<SharedWindow>,
    control_tx: mpsc::Sender<Packet>,
    poll_interval: Duration,
    ack_mode: AckMode,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Acquire) {
        let (pkt, addr) = match socket.recv_timeout(poll_interval).await {
            Ok(Some(received)) => received,
            Ok(None) => continue,
            Err(e) if e.is_malformed_datagram() => {
                log::warn!("[ack] discarding datagram: {e}");
                continue;
            }
            Err(e) => {
                log::debug!("[ack] receive error: {e}");
                continue;
            }
        };
        if addr != peer {
            continue;
        }

        let h = pkt.header;
        if h.flags & flags::FIN != 0 {
            if control_tx.send(pkt).await.is_err() {
                break;
            }
            continue;
        }
        if !is_pure_ack(&h) {
            continue;
        }

        let now = Instant::now();
        let (outcome, base) = {
            let mut window = shared.window.lock().await;
            let outcome = window.on_ack(h.ack, now);
            (outcome, window.base())
        };
        log_ack(&h, outcome, base, ack_mode);
        shared.ack_arrived.notify_one();
    }
    log::debug!("[ack] listener stopped");
}

/// An acknowledgement that is not part of the handshake or teardown.
pub(crate) fn is_pure_ack(h: &Header) -> bool {
    h.flags == flags::ACK
}

/// Emit the per-ACK event line.
pub(crate) fn log_ack(h: &Header, outcome: AckOutcome, base: usize, ack_mode: AckMode) {
    match (outcome, ack_mode) {
        (AckOutcome::Acked { index, rtt }, AckMode::ByteOffset) => log::debug!(
            "[sender] ← ACK {} (bytes up to {}) block={} RTT={:.2} ms base={}",
            h.ack,
            h.ack.saturating_sub(1),
            index,
            rtt.as_secs_f64() * 1000.0,
            base
        ),
        (AckOutcome::Acked { index, rtt }, AckMode::BlockIndex) => log::debug!(
            "[sender] ← ACK {} RTT={:.2} ms receiver clock {} UTC base={}",
            index,
            rtt.as_secs_f64() * 1000.0,
            clock_string(h.timestamp_ms),
            base
        ),
        (AckOutcome::Duplicate { index }, _) => {
            log::debug!("[sender] ← duplicate ACK for block {index}")
        }
        (AckOutcome::Ignored, _) => log::debug!("[sender] ← ACK {} matches no block", h.ack),
    }
}

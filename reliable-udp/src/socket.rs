//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that speaks
//! [`crate::packet::Packet`] instead of raw bytes.  All protocol logic lives
//! elsewhere; this module owns only byte I/O.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::packet::{Packet, PacketError};

/// Largest datagram accepted.  Headers are 20 bytes and payloads are
/// bounded by the 16-bit length field.
const MAX_DATAGRAM: usize = 65_535;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The datagram could not be encoded or decoded.
    #[error("packet error from {addr:?}: {source}")]
    Packet {
        addr: Option<SocketAddr>,
        #[source]
        source: PacketError,
    },
}

impl SocketError {
    /// `true` for errors confined to one datagram; the socket is still usable.
    pub fn is_malformed_datagram(&self) -> bool {
        matches!(self, Self::Packet { addr: Some(_), .. })
    }
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// An async, packet-oriented UDP socket.
///
/// All methods are `&self` so the socket can be shared across tasks behind
/// an `Arc`.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing `0.0.0.0:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    /// Encode `packet` and send it as a single UDP datagram to `dest`.
    pub async fn send_to(&self, packet: &Packet, dest: SocketAddr) -> Result<(), SocketError> {
        let bytes = packet
            .encode()
            .map_err(|source| SocketError::Packet { addr: None, source })?;
        self.inner.send_to(&bytes, dest).await?;
        Ok(())
    }

    /// Receive the next datagram and decode it into a [`Packet`].
    ///
    /// Returns `(packet, sender_address)`.  Datagrams that fail to decode are
    /// returned as `Err` with the sender's address; the caller decides
    /// whether to keep reading.
    pub async fn recv_from(&self) -> Result<(Packet, SocketAddr), SocketError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        let packet = Packet::decode(&buf[..n]).map_err(|source| SocketError::Packet {
            addr: Some(addr),
            source,
        })?;
        Ok((packet, addr))
    }

    /// [`recv_from`](Self::recv_from) bounded by `deadline`.
    ///
    /// `Ok(None)` means the deadline passed with nothing received.
    pub async fn recv_timeout(
        &self,
        deadline: Duration,
    ) -> Result<Option<(Packet, SocketAddr)>, SocketError> {
        match tokio::time::timeout(deadline, self.recv_from()).await {
            Ok(result) => result.map(Some),
            Err(_elapsed) => Ok(None),
        }
    }
}

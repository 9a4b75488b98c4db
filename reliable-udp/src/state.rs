//! Connection finite-state machine (FSM) types.
//!
//! This module defines the phases a [`crate::connection::Connection`] can
//! occupy and the role it plays.  The transition table itself lives in
//! [`crate::connection`].
//!
//! ```text
//!  Sender:
//!   Idle ──SYN sent──▶ Handshaking ──SYN+ACK──▶ Transferring
//!                                                    │ all blocks acked,
//!                                                    │ FIN sent
//!                                                    ▼
//!   Closed ◀──FIN rcvd, ACK sent── ClosingRemote ◀──ACK+FIN── ClosingLocal
//!
//!  Receiver (per peer):
//!   Idle ──SYN rcvd, SYN+ACK sent──▶ Transferring
//!                                        │ FIN rcvd, ACK+FIN sent
//!                                        ▼
//!   Closed ◀──grace delay, FIN sent── ClosingRemote
//! ```

use std::fmt;

/// Which end of the transfer a connection drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Owns the blocks; opens and closes the connection.
    Sender,
    /// Tracks the expected byte offset and acknowledges.
    Receiver,
}

/// All possible phases of the connection FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Nothing exchanged yet.
    #[default]
    Idle,
    /// SYN sent; waiting for SYN+ACK.
    Handshaking,
    /// Handshake complete; DATA and ACKs flow.
    Transferring,
    /// Sender's FIN sent; waiting for ACK+FIN.
    ClosingLocal,
    /// Peer has acknowledged our FIN (sender) or sent its own (receiver);
    /// waiting for the final half of the exchange.
    ClosingRemote,
    /// Connection is finished.
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "IDLE",
            Phase::Handshaking => "HANDSHAKING",
            Phase::Transferring => "TRANSFERRING",
            Phase::ClosingLocal => "CLOSING_LOCAL",
            Phase::ClosingRemote => "CLOSING_REMOTE",
            Phase::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

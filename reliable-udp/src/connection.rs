//! Per-connection lifecycle and the session error type.
//!
//! A [`Connection`] records the [`Role`] and current [`Phase`] of one
//! peer-to-peer session and enforces the handshake/teardown transition
//! table.  It does no I/O: the sender session and the receiver server call
//! [`Connection::apply`] as control packets are sent and received, and an
//! event that is not legal in the current phase is rejected without
//! changing anything.

use thiserror::Error;

use crate::config::ConfigError;
use crate::packet::flags;
use crate::socket::SocketError;
use crate::state::{Phase, Role};

/// Control-packet events that drive the FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    SendSyn,
    RecvSyn,
    RecvSynAck,
    SendFin,
    RecvFinAck,
    RecvFin,
}

/// Errors surfaced by a session.
#[derive(Debug, Error)]
pub enum ConnError {
    #[error(transparent)]
    Socket(#[from] SocketError),
    /// No SYN+ACK arrived, or the reply lacked one of the two flags.
    #[error("handshake failed")]
    HandshakeFailed,
    /// A block hit the transmission cap without being acknowledged.
    #[error("block {index} unacknowledged after {transmissions} transmissions")]
    RetriesExhausted { index: usize, transmissions: u32 },
    /// The peer never answered our FIN.
    #[error("teardown failed: FIN not answered")]
    TeardownFailed,
    #[error("{event:?} is not valid for a {role:?} in phase {phase}")]
    InvalidTransition { role: Role, phase: Phase, event: Event },
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The ACK listener task panicked or was cancelled.
    #[error("ack listener task failed: {0}")]
    Task(String),
}

/// Handshake/teardown state for one session.
#[derive(Debug, Clone)]
pub struct Connection {
    role: Role,
    phase: Phase,
}

impl Connection {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            phase: Phase::Idle,
        }
    }

    pub fn sender() -> Self {
        Self::new(Role::Sender)
    }

    pub fn receiver() -> Self {
        Self::new(Role::Receiver)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// `true` while DATA may flow.
    pub fn is_transferring(&self) -> bool {
        self.phase == Phase::Transferring
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Apply `event`, returning the new phase.
    ///
    /// Retransmitted SYNs and FINs are self-loops; a repeated SYN seen by a
    /// receiver that is already transferring is accepted too, so a lost
    /// SYN+ACK can be re-sent.
    pub fn apply(&mut self, event: Event) -> Result<Phase, ConnError> {
        use Event::*;
        use Phase::*;

        let next = match (self.role, self.phase, event) {
            (Role::Sender, Idle | Handshaking, SendSyn) => Handshaking,
            (Role::Sender, Handshaking, RecvSynAck) => Transferring,
            (Role::Sender, Transferring | ClosingLocal, SendFin) => ClosingLocal,
            (Role::Sender, ClosingLocal, RecvFinAck) => ClosingRemote,
            (Role::Sender, ClosingRemote, RecvFin) => Closed,

            (Role::Receiver, Idle | Transferring, RecvSyn) => Transferring,
            (Role::Receiver, Transferring, RecvFin) => ClosingRemote,
            (Role::Receiver, ClosingRemote, SendFin) => Closed,

            (role, phase, event) => {
                return Err(ConnError::InvalidTransition { role, phase, event });
            }
        };
        self.phase = next;
        Ok(next)
    }

    /// Validate the reply to our SYN.
    ///
    /// A reply carrying both SYN and ACK moves the sender to
    /// [`Phase::Transferring`]; anything else closes the connection and
    /// fails the handshake.
    pub fn on_handshake_reply(&mut self, reply_flags: u16) -> Result<(), ConnError> {
        let wanted = flags::SYN | flags::ACK;
        if reply_flags & wanted != wanted {
            self.phase = Phase::Closed;
            return Err(ConnError::HandshakeFailed);
        }
        self.apply(Event::RecvSynAck).map(|_| ())
    }

    /// Abandon the session.
    pub fn abort(&mut self) {
        self.phase = Phase::Closed;
    }
}

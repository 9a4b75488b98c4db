//! Go-Back-N receive-side state machine.
//!
//! [`ReceiveTracker`] implements the receiver side of Go-Back-N:
//!
//! - Only **in-order** DATA is accepted (`seq == expected`).
//! - Out-of-order or duplicate DATA is reported and discarded; GBN
//!   receivers never buffer ahead.
//! - Every DATA that survives loss simulation is answered with a
//!   **cumulative ACK** carrying [`ack_number`](ReceiveTracker::ack_number).
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility.

use crate::block::FIRST_BYTE;
use crate::config::AckMode;

/// Result of offering one DATA packet to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// In order; the expected value advanced.
    Accepted,
    /// Not the expected value; carries what was expected instead.
    OutOfOrder { expected: u32 },
}

/// Per-peer counters reported when a session ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub accepted: u64,
    pub out_of_order: u64,
    pub dropped: u64,
    pub malformed: u64,
    pub bytes_accepted: u64,
}

/// Go-Back-N receive-side state for one peer.
#[derive(Debug)]
pub struct ReceiveTracker {
    mode: AckMode,
    /// Next expected byte offset (byte-offset mode) or block index
    /// (block-index mode).  Never decreases.
    expected: u32,
    pub stats: TrackerStats,
}

impl ReceiveTracker {
    pub fn new(mode: AckMode) -> Self {
        let expected = match mode {
            AckMode::ByteOffset => FIRST_BYTE,
            AckMode::BlockIndex => 1,
        };
        Self {
            mode,
            expected,
            stats: TrackerStats::default(),
        }
    }

    /// Next expected byte offset or block index.
    pub fn expected(&self) -> u32 {
        self.expected
    }

    /// Process an inbound DATA packet that survived loss simulation.
    pub fn on_data(&mut self, seq: u32, len: usize) -> Delivery {
        if seq != self.expected {
            self.stats.out_of_order += 1;
            return Delivery::OutOfOrder {
                expected: self.expected,
            };
        }
        let step = match self.mode {
            AckMode::ByteOffset => len as u32,
            AckMode::BlockIndex => 1,
        };
        self.expected = self.expected.wrapping_add(step);
        self.stats.accepted += 1;
        self.stats.bytes_accepted += len as u64;
        Delivery::Accepted
    }

    /// Count a DATA packet discarded by the loss simulator.
    pub fn on_drop(&mut self) {
        self.stats.dropped += 1;
    }

    /// Count a datagram that failed to decode.
    pub fn on_malformed(&mut self) {
        self.stats.malformed += 1;
    }

    /// Cumulative ACK value for the next outbound ACK.
    ///
    /// Byte-offset mode: the next expected byte.  Block-index mode: the last
    /// block received in order (0 before any).
    pub fn ack_number(&self) -> u32 {
        match self.mode {
            AckMode::ByteOffset => self.expected,
            AckMode::BlockIndex => self.expected - 1,
        }
    }
}

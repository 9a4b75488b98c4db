//! Go-Back-N send-side state machine.
//!
//! [`SendWindow`] owns every block of a session and decides what goes on the
//! wire each round.  It never touches the socket: callers take the
//! [`Transmission`]s it hands out, send them, and feed ACK values back in.
//!
//! # Protocol contract
//!
//! - At most `window_size` blocks beyond `base` may be in flight, and one
//!   round never sends more than `round_budget` payload bytes.
//! - ACKs are **cumulative**: acknowledging block `k` implies every block
//!   before it, so `base` jumps to `k + 1`.
//! - On timeout the caller asks for a Go-Back-N resend starting at the
//!   oldest expired block; every still-unacknowledged block from there is
//!   sent again.
//!
//! # Index layout
//!
//! ```text
//!   base          next_to_send
//!     │                 │
//!  ───┼─────────────────┼──────────────────▶ block index
//!     │ <── in flight ─▶│ <── sendable ───▶
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use crate::block::Block;
use crate::config::{AckMode, SenderConfig};
use crate::connection::ConnError;
use crate::packet::Packet;
use crate::stats::{self, RttStatistics, SessionReport};
use crate::timer::RetransmitTimer;

/// One DATA send handed to the caller.
#[derive(Debug, Clone)]
pub struct Transmission {
    pub index: usize,
    pub packet: Packet,
    /// `true` when this block had been sent before.
    pub retransmit: bool,
}

/// What an inbound ACK did to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// First acknowledgement of `index`; an RTT sample was recorded.
    Acked { index: usize, rtt: Duration },
    /// `index` had already been acknowledged.
    Duplicate { index: usize },
    /// The value does not map to any block that has been sent.
    Ignored,
}

/// Go-Back-N send-side state for one session.
#[derive(Debug)]
pub struct SendWindow {
    blocks: Vec<Block>,
    /// Lowest unacknowledged block index (left window edge).
    base: usize,
    /// Next block index to transmit.
    next_to_send: usize,
    window_size: usize,
    round_budget: usize,
    max_transmissions: u32,
    ack_mode: AckMode,
    send_times: HashMap<usize, Instant>,
    acked: BTreeSet<usize>,
    rtt_samples: Vec<Duration>,
    /// Transmission count per block, indexed by `index - 1`.
    tx_counts: Vec<u32>,
    total_sent: u64,
    go_back_events: u64,
    /// Trailing byte offset → block index.
    by_end_byte: BTreeMap<u32, usize>,
    timer: RetransmitTimer,
}

impl SendWindow {
    pub fn new(blocks: Vec<Block>, config: &SenderConfig) -> Self {
        let by_end_byte = blocks
            .iter()
            .filter(|b| !b.is_empty())
            .map(|b| (b.end_byte(), b.index))
            .collect();
        Self {
            tx_counts: vec![0; blocks.len()],
            blocks,
            base: 1,
            next_to_send: 1,
            window_size: config.window_size,
            round_budget: config.round_budget_bytes,
            max_transmissions: config.max_transmissions,
            ack_mode: config.ack_mode,
            send_times: HashMap::new(),
            acked: BTreeSet::new(),
            rtt_samples: Vec::new(),
            total_sent: 0,
            go_back_events: 0,
            by_end_byte,
            timer: RetransmitTimer::new(config.timeout.clone()),
        }
    }

    /// Number of blocks in the session.
    pub fn total(&self) -> usize {
        self.blocks.len()
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn next_to_send(&self) -> usize {
        self.next_to_send
    }

    /// `true` once every block is cumulatively acknowledged.
    pub fn is_complete(&self) -> bool {
        self.base > self.blocks.len()
    }

    pub fn block(&self, index: usize) -> Option<&Block> {
        index.checked_sub(1).and_then(|i| self.blocks.get(i))
    }

    pub fn is_acked(&self, index: usize) -> bool {
        self.acked.contains(&index)
    }

    pub fn rtt_samples(&self) -> &[Duration] {
        &self.rtt_samples
    }

    /// DATA transmissions so far, retransmissions included.
    pub fn total_sent(&self) -> u64 {
        self.total_sent
    }

    /// Times `index` has been put on the wire.
    pub fn transmissions_of(&self, index: usize) -> u32 {
        index
            .checked_sub(1)
            .and_then(|i| self.tx_counts.get(i))
            .copied()
            .unwrap_or(0)
    }

    /// Current retransmission timeout, recomputed from the RTT samples.
    pub fn timeout(&self) -> Duration {
        self.timer.timeout()
    }

    /// Send as many new blocks as the window and byte budget allow.
    ///
    /// Stops at the first block that would push this round past the budget;
    /// that block goes out in a later round.
    pub fn fill_round(&mut self, now: Instant) -> Result<Vec<Transmission>, ConnError> {
        let mut out = Vec::new();
        let mut round_bytes = 0usize;
        while self.next_to_send < self.base + self.window_size
            && self.next_to_send <= self.total()
        {
            let index = self.next_to_send;
            if self.acked.contains(&index) {
                self.next_to_send += 1;
                continue;
            }
            let len = self.blocks[index - 1].len();
            if round_bytes + len > self.round_budget {
                break;
            }
            out.push(self.transmit(index, now)?);
            round_bytes += len;
            self.next_to_send += 1;
        }
        Ok(out)
    }

    /// First unacknowledged block in `[base, next_to_send)` whose last
    /// transmission is older than `timeout`.
    pub fn oldest_expired(&self, now: Instant, timeout: Duration) -> Option<usize> {
        (self.base..self.next_to_send).find(|index| {
            !self.acked.contains(index)
                && self
                    .send_times
                    .get(index)
                    .is_some_and(|sent| now.saturating_duration_since(*sent) > timeout)
        })
    }

    /// Go-Back-N recovery: rewind `next_to_send` to `from` and resend every
    /// unacknowledged block up to the window and byte-budget limits.
    ///
    /// Acknowledged blocks in the range are skipped.  Fails with
    /// [`ConnError::RetriesExhausted`] when a block has already used up its
    /// transmission allowance.
    pub fn go_back(&mut self, from: usize, now: Instant) -> Result<Vec<Transmission>, ConnError> {
        debug_assert!(from >= self.base, "go_back below base");
        self.go_back_events += 1;
        self.next_to_send = from.max(self.base);
        self.fill_round(now)
    }

    /// Apply a cumulative ACK value.
    ///
    /// Unknown, stale and duplicate values are no-ops apart from the
    /// outcome they report.
    pub fn on_ack(&mut self, ack: u32, now: Instant) -> AckOutcome {
        let Some(index) = self.block_for_ack(ack) else {
            return AckOutcome::Ignored;
        };
        let Some(sent) = self.send_times.get(&index).copied() else {
            return AckOutcome::Ignored;
        };

        let outcome = if self.acked.insert(index) {
            let rtt = now.saturating_duration_since(sent);
            self.rtt_samples.push(rtt);
            self.timer.record_rtt_sample(rtt);
            AckOutcome::Acked { index, rtt }
        } else {
            AckOutcome::Duplicate { index }
        };

        if index + 1 > self.base {
            self.base = index + 1;
            self.next_to_send = self.next_to_send.max(self.base);
        }
        outcome
    }

    /// Summary of the session so far.
    ///
    /// Every block below `base` counts as acknowledged, whether or not it
    /// was confirmed individually.
    pub fn report(&self) -> SessionReport {
        let acknowledged = self.base - 1;
        SessionReport {
            blocks: self.total(),
            acknowledged,
            transmissions: self.total_sent,
            go_back_events: self.go_back_events,
            final_base: self.base,
            loss_rate: stats::loss_rate(acknowledged, self.total_sent),
            rtt: RttStatistics::from_samples(&self.rtt_samples),
        }
    }

    fn block_for_ack(&self, ack: u32) -> Option<usize> {
        match self.ack_mode {
            AckMode::ByteOffset => self.by_end_byte.get(&ack.checked_sub(1)?).copied(),
            AckMode::BlockIndex => {
                let index = ack as usize;
                (1..=self.total()).contains(&index).then_some(index)
            }
        }
    }

    fn transmit(&mut self, index: usize, now: Instant) -> Result<Transmission, ConnError> {
        let count = self.tx_counts[index - 1];
        if count >= self.max_transmissions {
            return Err(ConnError::RetriesExhausted {
                index,
                transmissions: count,
            });
        }
        let block = &self.blocks[index - 1];
        let seq = match self.ack_mode {
            AckMode::ByteOffset => block.start_byte,
            AckMode::BlockIndex => index as u32,
        };
        let packet = Packet::data(seq, block.payload.clone());

        self.tx_counts[index - 1] = count + 1;
        self.send_times.insert(index, now);
        self.total_sent += 1;
        Ok(Transmission {
            index,
            packet,
            retransmit: count > 0,
        })
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

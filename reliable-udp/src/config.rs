//! Session parameters for both ends of a connection.
//!
//! Everything here is a plain scalar; the binary fills these structs from
//! command-line flags and library users build them directly.  Defaults
//! carry the protocol's stock constants.

use std::ops::RangeInclusive;
use std::time::Duration;

use thiserror::Error;

/// How DATA sequence numbers and cumulative ACK values are interpreted.
///
/// Both peers must be configured with the same mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// `seq` is the first byte offset of a block; `ack` is the next
    /// expected byte offset.
    #[default]
    ByteOffset,
    /// `seq` is the 1-based block index; `ack` is the last block index
    /// received in order, and the ACK timestamp carries the receiver clock.
    BlockIndex,
}

/// Which task structure the sender uses during data transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingModel {
    /// Sender loop plus a dedicated ACK listener task sharing the window
    /// behind a mutex.
    #[default]
    DedicatedReceiver,
    /// A single loop that blocks on receive with the current timeout as its
    /// deadline.
    Poll,
}

/// Adaptive retransmission timeout parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutConfig {
    /// Used until the first RTT sample is available.
    pub default_timeout: Duration,
    /// Lower bound on the adaptive timeout.
    pub min_timeout: Duration,
    /// `timeout = mean(rtt) * multiplier`.
    pub multiplier: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(300),
            min_timeout: Duration::from_millis(50),
            multiplier: 5.0,
        }
    }
}

/// Sender-side session configuration.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Maximum number of blocks in flight (GBN window N).
    pub window_size: usize,
    /// Cap on total payload bytes transmitted in one round.
    pub round_budget_bytes: usize,
    /// Inclusive range block lengths are drawn from.
    pub block_len: RangeInclusive<usize>,
    pub timeout: TimeoutConfig,
    /// A block transmitted this many times without being acknowledged
    /// aborts the session.
    pub max_transmissions: u32,
    /// SYN attempts before the handshake is declared failed.
    pub handshake_attempts: u32,
    /// How long to wait for each handshake reply.
    pub handshake_timeout: Duration,
    /// FIN attempts before teardown is declared failed.
    pub teardown_attempts: u32,
    /// How long to wait for each teardown reply.
    pub teardown_timeout: Duration,
    /// Receive poll interval of the dedicated ACK listener.
    pub ack_poll_interval: Duration,
    pub model: SchedulingModel,
    pub ack_mode: AckMode,
    /// Seed for block generation; `None` draws from the thread RNG.
    pub seed: Option<u64>,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            window_size: 5,
            round_budget_bytes: 400,
            block_len: 40..=80,
            timeout: TimeoutConfig::default(),
            max_transmissions: 50,
            handshake_attempts: 5,
            handshake_timeout: Duration::from_secs(1),
            teardown_attempts: 5,
            teardown_timeout: Duration::from_secs(2),
            ack_poll_interval: Duration::from_millis(100),
            model: SchedulingModel::default(),
            ack_mode: AckMode::default(),
            seed: None,
        }
    }
}

impl SenderConfig {
    /// Reject parameter combinations the send loop cannot make progress with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        let (min, max) = (*self.block_len.start(), *self.block_len.end());
        if min == 0 || min > max || max > u16::MAX as usize {
            return Err(ConfigError::BlockLength { min, max });
        }
        if self.round_budget_bytes < max {
            return Err(ConfigError::BudgetBelowBlock {
                budget: self.round_budget_bytes,
                max,
            });
        }
        if !(self.timeout.multiplier > 0.0) {
            return Err(ConfigError::Multiplier(self.timeout.multiplier));
        }
        if self.max_transmissions == 0 || self.handshake_attempts == 0 || self.teardown_attempts == 0
        {
            return Err(ConfigError::ZeroAttempts);
        }
        Ok(())
    }
}

/// Receiver-side configuration.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Probability in `[0, 1]` that an inbound DATA datagram is dropped.
    pub drop_probability: f64,
    /// Seed for the loss simulator; `None` draws from OS entropy.
    pub seed: Option<u64>,
    /// Delay between ACK+FIN and the trailing FIN during teardown.
    pub fin_grace: Duration,
    /// A peer silent for this long is abandoned and its session ends in
    /// whatever phase it reached.
    pub idle_timeout: Duration,
    pub ack_mode: AckMode,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            drop_probability: 0.2,
            seed: None,
            fin_grace: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(30),
            ack_mode: AckMode::default(),
        }
    }
}

impl ReceiverConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.drop_probability) {
            return Err(ConfigError::DropProbability(self.drop_probability));
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::ZeroIdleTimeout);
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("window size must be at least 1")]
    ZeroWindow,
    #[error("invalid block length range {min}..={max}")]
    BlockLength { min: usize, max: usize },
    #[error("round budget of {budget} bytes cannot fit a {max}-byte block")]
    BudgetBelowBlock { budget: usize, max: usize },
    #[error("timeout multiplier must be positive, got {0}")]
    Multiplier(f64),
    #[error("attempt limits must be at least 1")]
    ZeroAttempts,
    #[error("drop probability must be within [0, 1], got {0}")]
    DropProbability(f64),
    #[error("idle timeout must be non-zero")]
    ZeroIdleTimeout,
    /// Byte offsets are 32-bit; a stream this long cannot be numbered.
    #[error("stream of {0} bytes exceeds the 32-bit byte-offset space")]
    StreamTooLarge(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(SenderConfig::default().validate(), Ok(()));
        assert_eq!(ReceiverConfig::default().validate(), Ok(()));
    }

    #[test]
    fn zero_window_rejected() {
        let cfg = SenderConfig {
            window_size: 0,
            ..SenderConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroWindow));
    }

    #[test]
    fn inverted_block_range_rejected() {
        let cfg = SenderConfig {
            block_len: 10..=5,
            ..SenderConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::BlockLength { min: 10, max: 5 }));
    }

    #[test]
    fn budget_must_fit_largest_block() {
        let cfg = SenderConfig {
            round_budget_bytes: 60,
            ..SenderConfig::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::BudgetBelowBlock { budget: 60, max: 80 })
        );
    }

    #[test]
    fn drop_probability_out_of_range_rejected() {
        let cfg = ReceiverConfig {
            drop_probability: 1.5,
            ..ReceiverConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::DropProbability(1.5)));
    }

    #[test]
    fn zero_idle_timeout_rejected() {
        let cfg = ReceiverConfig {
            idle_timeout: Duration::ZERO,
            ..ReceiverConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroIdleTimeout));
    }
}

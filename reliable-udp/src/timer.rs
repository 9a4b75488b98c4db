//! Adaptive retransmission timeout.
//!
//! Unacknowledged blocks are re-sent once they have been in flight longer
//! than the current timeout.  The estimate is a plain moving mean over every
//! RTT sample observed so far, scaled by a multiplier and clamped from
//! below:
//!
//! ```text
//!   timeout = max(min_timeout, mean(rtt_samples) × multiplier)
//! ```
//!
//! Before the first sample arrives the configured default is used.  The
//! estimate is recomputed every send round, so it tracks the samples as
//! they accumulate.

use std::time::Duration;

use crate::config::TimeoutConfig;

/// Running mean of RTT samples plus the scaling parameters.
///
/// Keeps a sum rather than re-summing the sample vector each round.
#[derive(Debug, Clone)]
pub struct RetransmitTimer {
    pub config: TimeoutConfig,
    sum: Duration,
    count: u32,
}

impl Default for RetransmitTimer {
    fn default() -> Self {
        Self::new(TimeoutConfig::default())
    }
}

impl RetransmitTimer {
    pub fn new(config: TimeoutConfig) -> Self {
        Self {
            config,
            sum: Duration::ZERO,
            count: 0,
        }
    }

    /// Fold one RTT sample into the mean.
    pub fn record_rtt_sample(&mut self, sample: Duration) {
        self.sum += sample;
        self.count += 1;
    }

    /// Mean of all samples so far, or `None` before the first one.
    pub fn mean_rtt(&self) -> Option<Duration> {
        (self.count > 0).then(|| self.sum / self.count)
    }

    /// Current retransmission timeout.
    pub fn timeout(&self) -> Duration {
        match self.mean_rtt() {
            Some(mean) => {
                let scaled = (mean.as_nanos() as f64 * self.config.multiplier).round();
                Duration::from_nanos(scaled as u64).max(self.config.min_timeout)
            }
            None => self.config.default_timeout,
        }
    }
}

//! End-of-session RTT summary and delivery-efficiency figure.

use std::fmt;
use std::time::Duration;

/// Descriptive statistics over a session's RTT samples, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RttStatistics {
    pub count: usize,
    pub max_ms: f64,
    pub min_ms: f64,
    pub mean_ms: f64,
    /// Population standard deviation.
    pub std_dev_ms: f64,
}

impl RttStatistics {
    /// Summarise `samples`; `None` when there are none.
    pub fn from_samples(samples: &[Duration]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let ms: Vec<f64> = samples.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
        let n = ms.len() as f64;
        let mean = ms.iter().sum::<f64>() / n;
        let variance = ms.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        Some(Self {
            count: ms.len(),
            max_ms: ms.iter().copied().fold(f64::MIN, f64::max),
            min_ms: ms.iter().copied().fold(f64::MAX, f64::min),
            mean_ms: mean,
            std_dev_ms: variance.sqrt(),
        })
    }
}

impl fmt::Display for RttStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "RTT samples: {}", self.count)?;
        writeln!(f, "RTT Max: {:.2} ms", self.max_ms)?;
        writeln!(f, "RTT Min: {:.2} ms", self.min_ms)?;
        writeln!(f, "RTT Avg: {:.2} ms", self.mean_ms)?;
        write!(f, "RTT Std: {:.2} ms", self.std_dev_ms)
    }
}

/// `1 - acknowledged / transmissions`, as a fraction in `[0, 1]`.
///
/// Transmissions include every retransmission, so this measures how many
/// sends were wasted rather than the raw per-packet loss probability.
/// Zero transmissions yields zero.
pub fn loss_rate(acknowledged: usize, transmissions: u64) -> f64 {
    if transmissions == 0 {
        return 0.0;
    }
    (1.0 - acknowledged as f64 / transmissions as f64).max(0.0)
}

/// Outcome of one sender session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    /// Number of blocks the session set out to deliver.
    pub blocks: usize,
    /// Blocks whose delivery was confirmed.
    pub acknowledged: usize,
    /// DATA transmissions including retransmissions.
    pub transmissions: u64,
    /// Go-Back-N recovery events.
    pub go_back_events: u64,
    /// Final cumulative-ack frontier.
    pub final_base: usize,
    pub loss_rate: f64,
    pub rtt: Option<RttStatistics>,
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Summary ===")?;
        writeln!(
            f,
            "Blocks: {}  Transmissions: {}  Go-back events: {}",
            self.blocks, self.transmissions, self.go_back_events
        )?;
        write!(f, "Loss rate: {:.2}%", self.loss_rate * 100.0)?;
        match &self.rtt {
            Some(rtt) => write!(f, "\n{rtt}"),
            None => write!(f, "\nRTT: no samples"),
        }
    }
}

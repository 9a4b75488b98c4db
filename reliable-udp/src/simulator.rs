//! Receiver-side loss injection.
//!
//! To exercise the retransmission path without depending on real network
//! conditions, the receiver passes every inbound DATA datagram through a
//! [`LossSimulator`] before it reaches the tracker.  A dropped datagram is
//! simply forgotten: no ACK goes back, exactly as if the network had lost
//! it.  Control packets (SYN, FIN) are never dropped.
//!
//! Give the simulator a seed to make drop decisions reproducible.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Bernoulli drop decision with a fixed probability.
#[derive(Debug)]
pub struct LossSimulator {
    drop_probability: f64,
    rng: StdRng,
    decisions: u64,
    drops: u64,
}

impl LossSimulator {
    /// Create a simulator dropping with `drop_probability` in `[0, 1]`.
    ///
    /// `seed = None` seeds from OS entropy.
    pub fn new(drop_probability: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            drop_probability: drop_probability.clamp(0.0, 1.0),
            rng,
            decisions: 0,
            drops: 0,
        }
    }

    /// A simulator that never drops.
    pub fn lossless() -> Self {
        Self::new(0.0, Some(0))
    }

    pub fn drop_probability(&self) -> f64 {
        self.drop_probability
    }

    /// Decide the fate of one datagram; `true` means discard it.
    pub fn should_drop(&mut self) -> bool {
        self.decisions += 1;
        // random::<f64>() is in [0, 1), so p = 0 never drops and p = 1
        // always does.
        let dropped = self.rng.random::<f64>() < self.drop_probability;
        if dropped {
            self.drops += 1;
        }
        dropped
    }

    /// Number of datagrams dropped so far.
    pub fn drops(&self) -> u64 {
        self.drops
    }

    /// Number of drop decisions made so far.
    pub fn decisions(&self) -> u64 {
        self.decisions
    }
}

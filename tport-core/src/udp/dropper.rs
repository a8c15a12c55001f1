use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};

/// Simulated packet loss for outgoing datagrams.
pub struct PacketDropper {
    probability: f64,
    rng: Mutex<StdRng>,
}

impl PacketDropper {
    pub fn new(probability: f64) -> Result<Self> {
        Self::with_rng(probability, StdRng::from_entropy())
    }
    /// Deterministic variant for reproducible loss patterns.
    pub fn with_seed(probability: f64, seed: u64) -> Result<Self> {
        Self::with_rng(probability, StdRng::seed_from_u64(seed))
    }
    fn with_rng(probability: f64, rng: StdRng) -> Result<Self> {
        if !(0.0..=1.0).contains(&probability) {
            return Err(Error::Config(format!(
                "drop probability {probability} outside 0..=1"
            )));
        }
        Ok(Self {
            probability,
            rng: Mutex::new(rng),
        })
    }
    pub fn probability(&self) -> f64 {
        self.probability
    }
    pub fn should_drop(&self) -> bool {
        if self.probability <= 0.0 {
            return false;
        }
        if self.probability >= 1.0 {
            return true;
        }
        self.rng.lock().gen::<f64>() < self.probability
    }
}

//! Shared, seedable source of randomness.
//!
//! Every draw the simulator makes (scheduling jitter, loss decisions, hold counts) goes
//! through one [Random] so a run can be reproduced from its seed.

use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::sync::Mutex;

/// A thread-safe random generator.
#[derive(Debug)]
pub struct Random {
    rng: Mutex<StdRng>,
}

impl Random {
    /// Create a generator from a fixed seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Create a generator seeded from the operating system.
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Restart the sequence from `seed`.
    #[cfg(test)]
    pub fn reseed(&self, seed: u64) {
        *self.rng.lock().unwrap() = StdRng::seed_from_u64(seed);
    }

    /// Draw uniformly from `[0, 1)`.
    pub fn uniform(&self) -> f64 {
        self.rng.lock().unwrap().gen::<f64>()
    }

    /// Draw from a normal distribution.
    ///
    /// A standard deviation that is not a positive finite number returns the mean unchanged.
    pub fn normal(&self, mean: f64, std_dev: f64) -> f64 {
        if !std_dev.is_finite() || std_dev <= 0.0 {
            return mean;
        }
        match Normal::new(mean, std_dev) {
            Ok(normal) => normal.sample(&mut *self.rng.lock().unwrap()),
            Err(_) => mean,
        }
    }
}

impl Default for Random {
    fn default() -> Self {
        Self::from_entropy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_sequence() {
        let a = Random::new(7);
        let b = Random::new(7);
        for _ in 0..100 {
            assert_eq!(a.uniform(), b.uniform());
        }
    }

    #[test]
    fn test_reseed_restarts() {
        let random = Random::new(3);
        let first: Vec<f64> = (0..10).map(|_| random.uniform()).collect();
        random.reseed(3);
        let second: Vec<f64> = (0..10).map(|_| random.uniform()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_uniform_range() {
        let random = Random::new(0);
        for _ in 0..1_000 {
            let value = random.uniform();
            assert!((0.0..1.0).contains(&value));
        }
    }

    #[test]
    fn test_normal_zero_deviation() {
        let random = Random::new(0);
        assert_eq!(random.normal(50.0, 0.0), 50.0);
        assert_eq!(random.normal(50.0, -1.0), 50.0);
        assert_eq!(random.normal(50.0, f64::NAN), 50.0);
    }

    #[test]
    fn test_normal_centered() {
        let random = Random::new(11);
        let samples = 10_000;
        let mean = (0..samples).map(|_| random.normal(100.0, 10.0)).sum::<f64>() / samples as f64;
        assert!((mean - 100.0).abs() < 1.0, "mean = {mean}");
    }
}

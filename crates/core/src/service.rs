//! Service-time oracle.
//!
//! Draws simulated service durations from a configured distribution. Each
//! worker and client owns its own generator, deterministically sub-seeded
//! from the global seed via [`sub_seed`], so reproducibility does not cost
//! RNG contention across tasks.

use rand::Rng;
use std::time::Duration;

/// Floor applied to normal draws, which can otherwise go negative.
const MIN_SERVICE_SECS: f64 = 0.01;

/// Service-time distribution used by stage-1 and stage-2 workers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ServiceTimes {
    Fixed { value: f64 },
    Uniform { low: f64, high: f64 },
    Exponential { lambda: f64 },
    Normal { mean: f64, std_dev: f64 },
}

impl ServiceTimes {
    /// Draw one service duration.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let secs = match *self {
            ServiceTimes::Fixed { value } => value,
            ServiceTimes::Uniform { low, high } => rng.gen_range(low..high),
            ServiceTimes::Exponential { lambda } => {
                let mut chi: f64 = rng.gen();
                while chi == 0.0 {
                    chi = rng.gen();
                }
                -chi.ln() / lambda
            }
            ServiceTimes::Normal { mean, std_dev } => {
                // Box-Muller transform.
                let mut chi_1: f64 = rng.gen();
                while chi_1 == 0.0 {
                    chi_1 = rng.gen();
                }
                let chi_2: f64 = rng.gen();
                let z = (-2.0 * chi_1.ln()).sqrt() * (2.0 * std::f64::consts::PI * chi_2).cos();
                (mean + std_dev * z).max(MIN_SERVICE_SECS)
            }
        };
        Duration::from_secs_f64(secs)
    }
}

impl Default for ServiceTimes {
    fn default() -> Self {
        ServiceTimes::Exponential { lambda: 1.0 }
    }
}

/// Derive a per-entity RNG seed from the global seed and an entity index.
pub fn sub_seed(seed: u64, index: u64) -> u64 {
    seed.wrapping_add(index).wrapping_mul(0x517cc1b727220a95)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn fixed_returns_the_configured_value() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let dist = ServiceTimes::Fixed { value: 0.25 };
        assert_eq!(dist.sample(&mut rng), Duration::from_millis(250));
    }

    #[test]
    fn uniform_stays_within_bounds() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let dist = ServiceTimes::Uniform { low: 0.5, high: 2.0 };
        for _ in 0..1000 {
            let d = dist.sample(&mut rng).as_secs_f64();
            assert!((0.5..2.0).contains(&d), "out of range: {d}");
        }
    }

    #[test]
    fn exponential_is_positive() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let dist = ServiceTimes::Exponential { lambda: 1.0 };
        for _ in 0..1000 {
            assert!(dist.sample(&mut rng) > Duration::ZERO);
        }
    }

    #[test]
    fn normal_is_floored() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let dist = ServiceTimes::Normal { mean: 0.0, std_dev: 0.001 };
        for _ in 0..100 {
            assert!(dist.sample(&mut rng) >= Duration::from_millis(10));
        }
    }

    #[test]
    fn draws_are_deterministic_for_a_seed() {
        let dist = ServiceTimes::Exponential { lambda: 2.0 };
        let draw = |seed| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            (0..32).map(|_| dist.sample(&mut rng)).collect::<Vec<_>>()
        };
        assert_eq!(draw(99), draw(99));
        assert_ne!(draw(99), draw(100));
    }

    #[test]
    fn sub_seeds_differ_per_entity() {
        let a = sub_seed(325, 1);
        let b = sub_seed(325, 2);
        assert_ne!(a, b);
        assert_eq!(a, sub_seed(325, 1));
    }
}

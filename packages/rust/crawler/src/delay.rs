//! Politeness delay policies applied before each child fetch.

use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Chooses how long to wait given the configured `[min, max]` interval.
pub trait DelayPolicy: Send + Sync {
    fn next_delay(&self, min: Duration, max: Duration) -> Duration;
}

/// Uniformly random delay within `[min, max]`.
pub struct JitteredDelay {
    rng: Mutex<StdRng>,
}

impl JitteredDelay {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Reproducible jitter sequence.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for JitteredDelay {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayPolicy for JitteredDelay {
    fn next_delay(&self, min: Duration, max: Duration) -> Duration {
        if max <= min {
            return min;
        }
        let secs = match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(min.as_secs_f64()..=max.as_secs_f64()),
            Err(poisoned) => poisoned
                .into_inner()
                .gen_range(min.as_secs_f64()..=max.as_secs_f64()),
        };
        Duration::from_secs_f64(secs)
    }
}

/// Never waits.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDelay;

impl DelayPolicy for NoDelay {
    fn next_delay(&self, _min: Duration, _max: Duration) -> Duration {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = JitteredDelay::new();
        let (min, max) = (Duration::from_millis(200), Duration::from_millis(500));
        for _ in 0..200 {
            let d = policy.next_delay(min, max);
            assert!(d >= min && d <= max, "{d:?} out of range");
        }
    }

    #[test]
    fn seeded_jitter_is_reproducible() {
        let (min, max) = (Duration::from_secs(2), Duration::from_secs(5));
        let a = JitteredDelay::seeded(7);
        let b = JitteredDelay::seeded(7);
        let first: Vec<_> = (0..5).map(|_| a.next_delay(min, max)).collect();
        let second: Vec<_> = (0..5).map(|_| b.next_delay(min, max)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn degenerate_interval_returns_min() {
        let policy = JitteredDelay::seeded(1);
        let d = Duration::from_secs(3);
        assert_eq!(policy.next_delay(d, d), d);
        assert_eq!(policy.next_delay(d, Duration::from_secs(1)), d);
    }

    #[test]
    fn no_delay_is_zero() {
        assert_eq!(
            NoDelay.next_delay(Duration::from_secs(2), Duration::from_secs(5)),
            Duration::ZERO
        );
    }
}

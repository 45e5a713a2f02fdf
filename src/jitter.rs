//! Jitter strategies to prevent thundering herd
//!
//! When to use which strategy:
//! - `None`: deterministic retries for tests or tightly controlled workflows.
//! - `Bounded`: uniform offset in `[-bound, +bound]` added to the delay, clamped at zero. This is
//!   the classic "delay plus or minus jitter" retry configuration.
//!
//! Notes:
//! - RNG: uses `rand`'s thread-local RNG by default; deterministic RNGs can be injected via `apply_with_rng`.
//! - Precision: millisecond conversions saturate to `u64::MAX` to avoid panics on very large durations.
//!
//! Example:
//! ```rust
//! use faultguard::Jitter;
//! use std::time::Duration;
//!
//! let jitter = Jitter::bounded(Duration::from_millis(200));
//! let delay = jitter.apply(Duration::from_millis(1_000));
//! assert!(delay >= Duration::from_millis(800) && delay <= Duration::from_millis(1_200));
//! ```

use rand::{rng, Rng};
use std::time::Duration;

/// Jitter strategy for randomizing retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// No jitter - use exact backoff delay
    #[default]
    None,
    /// Bounded jitter: delay plus a random offset in `[-bound, +bound]`
    Bounded(Duration),
}

impl Jitter {
    /// Create a bounded jitter strategy; a zero bound means no jitter.
    pub fn bounded(bound: Duration) -> Self {
        if bound.is_zero() {
            Jitter::None
        } else {
            Jitter::Bounded(bound)
        }
    }

    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_internal(delay, &mut rng)
    }

    /// Apply jitter with a custom RNG (for testing)
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        self.apply_internal(delay, rng)
    }

    fn as_millis_saturated(duration: Duration) -> u64 {
        duration.as_millis().try_into().unwrap_or(u64::MAX) // Saturate extremely large durations
    }

    fn apply_internal<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Bounded(bound) => {
                let bound = i128::from(Self::as_millis_saturated(*bound));
                if bound == 0 {
                    return delay;
                }
                let offset = rng.random_range(-bound..=bound);
                let millis = i128::from(Self::as_millis_saturated(delay)) + offset;
                Duration::from_millis(millis.clamp(0, i128::from(u64::MAX)) as u64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn none_jitter_returns_exact_delay() {
        let delay = Duration::from_secs(1);
        assert_eq!(Jitter::None.apply(delay), delay);
        assert_eq!(Jitter::bounded(Duration::ZERO), Jitter::None);
    }

    #[test]
    fn bounded_jitter_stays_within_bound() {
        let jitter = Jitter::bounded(Duration::from_millis(200));
        let delay = Duration::from_millis(1_000);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let jittered = jitter.apply_with_rng(delay, &mut rng);
            assert!(jittered >= Duration::from_millis(800));
            assert!(jittered <= Duration::from_millis(1_200));
        }
    }

    #[test]
    fn bounded_jitter_clamps_at_zero() {
        let jitter = Jitter::bounded(Duration::from_millis(500));
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let jittered = jitter.apply_with_rng(Duration::from_millis(10), &mut rng);
            assert!(jittered <= Duration::from_millis(510));
        }
    }

    #[test]
    fn bounded_jitter_is_deterministic_with_seeded_rng() {
        let jitter = Jitter::bounded(Duration::from_millis(100));
        let delay = Duration::from_millis(300);
        let a: Vec<Duration> = {
            let mut rng = StdRng::seed_from_u64(99);
            (0..10).map(|_| jitter.apply_with_rng(delay, &mut rng)).collect()
        };
        let b: Vec<Duration> = {
            let mut rng = StdRng::seed_from_u64(99);
            (0..10).map(|_| jitter.apply_with_rng(delay, &mut rng)).collect()
        };
        assert_eq!(a, b);
    }

    #[test]
    fn zero_delay_only_ever_grows_by_the_bound() {
        assert_eq!(Jitter::None.apply(Duration::ZERO), Duration::ZERO);
        let jitter = Jitter::bounded(Duration::from_millis(50));
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            assert!(jitter.apply_with_rng(Duration::ZERO, &mut rng) <= Duration::from_millis(50));
        }
    }

    #[test]
    fn saturates_large_durations_without_panicking() {
        let huge = Duration::from_millis(u64::MAX);
        let mut rng = StdRng::seed_from_u64(999);
        assert!(Jitter::bounded(Duration::from_secs(1)).apply_with_rng(huge, &mut rng) <= huge);
    }
}

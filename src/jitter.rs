//! Jitter strategies to keep retry storms from synchronizing.
//!
//! - `None`: deterministic delays for tests.
//! - `Full`: uniform in `[0, delay]`.
//! - `Scaled`: uniform in `[delay/2, 3*delay/2]`, the default for
//!   reconnection backoff: keeps a floor while spreading peaks.
//!
//! Millisecond conversions saturate instead of panicking on absurd durations,
//! and a deterministic RNG can be injected via `apply_with_rng`.

use rand::{rng, Rng};
use std::time::Duration;

/// Randomization applied to a computed backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    /// Use the exact backoff delay.
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// Uniform in `[delay/2, 3*delay/2]`.
    Scaled,
}

impl Jitter {
    /// Randomize `delay` with the thread-local RNG.
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    /// Randomize `delay` with a caller-supplied RNG (deterministic tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = Self::as_millis_saturated(delay);
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
            Jitter::Scaled => {
                if millis == 0 {
                    return Duration::ZERO;
                }
                let lower = millis / 2;
                let upper = millis.saturating_add(lower);
                Duration::from_millis(rng.random_range(lower..=upper))
            }
        }
    }

    fn as_millis_saturated(duration: Duration) -> u64 {
        duration.as_millis().try_into().unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn none_returns_exact_delay() {
        assert_eq!(Jitter::None.apply(Duration::from_secs(1)), Duration::from_secs(1));
    }

    #[test]
    fn full_stays_within_bounds() {
        let delay = Duration::from_secs(1);
        for _ in 0..100 {
            let jittered = Jitter::Full.apply(delay);
            assert!(jittered <= delay);
        }
    }

    #[test]
    fn scaled_stays_within_half_to_one_and_a_half() {
        let delay = Duration::from_millis(1000);
        for _ in 0..100 {
            let jittered = Jitter::Scaled.apply(delay);
            assert!(jittered >= Duration::from_millis(500));
            assert!(jittered <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn zero_delay_stays_zero() {
        assert_eq!(Jitter::Full.apply(Duration::ZERO), Duration::ZERO);
        assert_eq!(Jitter::Scaled.apply(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn deterministic_rng_is_reproducible() {
        let delay = Duration::from_millis(800);
        let a = Jitter::Scaled.apply_with_rng(delay, &mut StdRng::seed_from_u64(7));
        let b = Jitter::Scaled.apply_with_rng(delay, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }

    #[test]
    fn saturates_huge_durations() {
        let huge = Duration::from_millis(u64::MAX);
        let jittered = Jitter::Scaled.apply_with_rng(huge, &mut StdRng::seed_from_u64(3));
        assert!(jittered >= Duration::from_millis(u64::MAX / 2));
    }
}

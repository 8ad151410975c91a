//! Backoff strategies for retries and reconnection scheduling.
//!
//! Attempt semantics: attempt `0` is the initial call and carries no delay;
//! retries start at attempt `1`. Exponential delays grow as
//! `base * factor^(attempt - 1)` and saturate at [`MAX_BACKOFF`] so large
//! attempt counts never overflow.

use std::fmt;
use std::time::Duration;

/// Hard ceiling applied when calculations would overflow (1 hour).
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffError {
    /// `with_max` is meaningless for constant backoff.
    ConstantDoesNotSupportMax,
    /// The cap must be non-zero.
    MaxMustBePositive,
    /// The cap must be at least the base delay.
    MaxLessThanBase { base: Duration, max: Duration },
    /// Growth factor must be at least 2.
    FactorTooSmall { provided: u32 },
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::ConstantDoesNotSupportMax => {
                write!(f, "with_max is only valid for exponential backoff")
            }
            BackoffError::MaxMustBePositive => write!(f, "max must be greater than zero"),
            BackoffError::MaxLessThanBase { base, max } => {
                write!(f, "max ({:?}) must be >= base ({:?})", max, base)
            }
            BackoffError::FactorTooSmall { provided } => {
                write!(f, "factor must be >= 2 (got {})", provided)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BackoffKind {
    Constant { delay: Duration },
    Exponential { base: Duration, factor: u32, max: Option<Duration> },
}

/// Delay schedule for retry attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    kind: BackoffKind,
}

impl Backoff {
    /// Same delay for every retry.
    pub fn constant(delay: Duration) -> Self {
        Self { kind: BackoffKind::Constant { delay } }
    }

    /// Doubling delay starting from `base`.
    pub fn exponential(base: Duration) -> Self {
        Self { kind: BackoffKind::Exponential { base, factor: 2, max: None } }
    }

    /// Override the growth factor (default 2). Must be >= 2.
    pub fn with_factor(mut self, factor: u32) -> Result<Self, BackoffError> {
        if factor < 2 {
            return Err(BackoffError::FactorTooSmall { provided: factor });
        }
        match &mut self.kind {
            BackoffKind::Exponential { factor: existing, .. } => {
                *existing = factor;
                Ok(self)
            }
            BackoffKind::Constant { .. } => Err(BackoffError::ConstantDoesNotSupportMax),
        }
    }

    /// Cap exponential growth. Errors on constant backoff, a zero cap, or a
    /// cap below the base delay.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        match &mut self.kind {
            BackoffKind::Exponential { base, max: existing, .. } => {
                if max < *base {
                    return Err(BackoffError::MaxLessThanBase { base: *base, max });
                }
                *existing = Some(max);
                Ok(self)
            }
            BackoffKind::Constant { .. } => Err(BackoffError::ConstantDoesNotSupportMax),
        }
    }

    /// Delay before the given attempt (0-based; 0 = initial call, no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match &self.kind {
            BackoffKind::Constant { delay } => *delay,
            BackoffKind::Exponential { base, factor, max } => {
                let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
                let multiplier = u128::from(*factor).saturating_pow(exponent);
                let nanos = base.as_nanos().saturating_mul(multiplier);
                let raw = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
                let capped = max.map(|m| raw.min(m)).unwrap_or(raw);
                capped.min(MAX_BACKOFF)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_repeats_delay() {
        let backoff = Backoff::constant(Duration::from_secs(1));
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(50), Duration::from_secs(1));
    }

    #[test]
    fn exponential_doubles_by_default() {
        let backoff = Backoff::exponential(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_honors_custom_factor() {
        let backoff =
            Backoff::exponential(Duration::from_millis(10)).with_factor(3).expect("valid factor");
        assert_eq!(backoff.delay(1), Duration::from_millis(10));
        assert_eq!(backoff.delay(2), Duration::from_millis(30));
        assert_eq!(backoff.delay(3), Duration::from_millis(90));
    }

    #[test]
    fn exponential_respects_cap() {
        let backoff = Backoff::exponential(Duration::from_millis(100))
            .with_max(Duration::from_secs(1))
            .expect("valid cap");
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(20), Duration::from_secs(1));
    }

    #[test]
    fn delays_are_monotone_up_to_cap() {
        let backoff = Backoff::exponential(Duration::from_millis(50))
            .with_max(Duration::from_secs(30))
            .expect("valid cap");
        let mut previous = Duration::ZERO;
        for attempt in 1..32 {
            let delay = backoff.delay(attempt);
            assert!(delay >= previous, "delay shrank at attempt {}", attempt);
            assert!(delay <= Duration::from_secs(30));
            previous = delay;
        }
    }

    #[test]
    fn huge_attempts_saturate() {
        let backoff = Backoff::exponential(Duration::from_secs(1));
        assert_eq!(backoff.delay(1_000_000_000), MAX_BACKOFF);
        assert_eq!(backoff.delay((u32::MAX as usize) + 5), MAX_BACKOFF);
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        assert!(matches!(
            Backoff::constant(Duration::from_secs(1)).with_max(Duration::from_secs(2)),
            Err(BackoffError::ConstantDoesNotSupportMax)
        ));
        assert!(matches!(
            Backoff::exponential(Duration::from_secs(1)).with_max(Duration::ZERO),
            Err(BackoffError::MaxMustBePositive)
        ));
        assert!(matches!(
            Backoff::exponential(Duration::from_secs(10)).with_max(Duration::from_secs(1)),
            Err(BackoffError::MaxLessThanBase { .. })
        ));
        assert!(matches!(
            Backoff::exponential(Duration::from_secs(1)).with_factor(1),
            Err(BackoffError::FactorTooSmall { provided: 1 })
        ));
    }
}

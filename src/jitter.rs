//! Jitter applied to retry delays to avoid synchronized retries

use rand::Rng;
use std::time::Duration;

/// Jitter strategy for randomizing retry delays.
///
/// `Factor(f)` spreads a delay uniformly across `delay ± f * delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Use the exact computed delay
    None,
    /// Uniform spread of `± factor * delay`, factor in `[0, 1]`
    Factor(f64),
}

/// Errors returned when configuring jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JitterError {
    /// Factor must lie within `[0, 1]`.
    FactorOutOfRange(f64),
}

impl std::fmt::Display for JitterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JitterError::FactorOutOfRange(v) => {
                write!(f, "jitter factor must be within [0, 1] (got {})", v)
            }
        }
    }
}

impl std::error::Error for JitterError {}

impl Jitter {
    pub fn none() -> Self {
        Jitter::None
    }

    pub fn factor(factor: f64) -> Result<Self, JitterError> {
        if !(0.0..=1.0).contains(&factor) {
            return Err(JitterError::FactorOutOfRange(factor));
        }
        if factor == 0.0 {
            Ok(Jitter::None)
        } else {
            Ok(Jitter::Factor(factor))
        }
    }

    /// Apply jitter to a delay.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Apply jitter with a caller-supplied RNG (deterministic tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Factor(factor) => {
                let millis = delay.as_millis() as u64;
                if millis == 0 {
                    return Duration::ZERO;
                }
                let spread = (millis as f64 * factor).round() as u64;
                if spread == 0 {
                    return delay;
                }
                let low = millis.saturating_sub(spread);
                let high = millis.saturating_add(spread);
                Duration::from_millis(rng.random_range(low..=high))
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
    fn none_returns_exact_delay() {
        let delay = Duration::from_secs(1);
        assert_eq!(Jitter::None.apply(delay), delay);
    }

    #[test]
    fn factor_stays_within_spread() {
        let jitter = Jitter::factor(0.2).unwrap();
        let delay = Duration::from_millis(1000);
        for _ in 0..200 {
            let jittered = jitter.apply(delay);
            assert!(jittered >= Duration::from_millis(800), "{:?}", jittered);
            assert!(jittered <= Duration::from_millis(1200), "{:?}", jittered);
        }
    }

    #[test]
    fn zero_factor_collapses_to_none() {
        assert_eq!(Jitter::factor(0.0).unwrap(), Jitter::None);
    }

    #[test]
    fn out_of_range_factor_is_rejected() {
        assert!(matches!(Jitter::factor(1.5), Err(JitterError::FactorOutOfRange(_))));
        assert!(matches!(Jitter::factor(-0.1), Err(JitterError::FactorOutOfRange(_))));
    }

    #[test]
    fn zero_delay_stays_zero() {
        let jitter = Jitter::factor(0.5).unwrap();
        assert_eq!(jitter.apply(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn deterministic_with_seeded_rng() {
        let jitter = Jitter::factor(0.3).unwrap();
        let mut rng_a = StdRng::seed_from_u64(7);
        let mut rng_b = StdRng::seed_from_u64(7);
        let delay = Duration::from_millis(500);
        assert_eq!(
            jitter.apply_with_rng(delay, &mut rng_a),
            jitter.apply_with_rng(delay, &mut rng_b)
        );
    }
}

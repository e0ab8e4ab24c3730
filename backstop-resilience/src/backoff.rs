//! Exponential backoff with proportional jitter

use rand::Rng;
use std::time::Duration;

use crate::config::RecoveryConfig;

/// Backoff delay calculator
///
/// `delay = min(base * 2^attempt, max_delay)`, then a random share of up to
/// `jitter_fraction` of that delay is added on top. Attempts are 0-indexed.
#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    base_delay: Duration,
    max_delay: Duration,
    jitter_fraction: f64,
}

impl BackoffCalculator {
    /// Create a new backoff calculator
    pub fn new(base_delay: Duration, max_delay: Duration, jitter_fraction: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter_fraction: unit_interval(jitter_fraction),
        }
    }

    /// Build a calculator from the delay settings of a recovery config
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self::new(config.base_delay, config.max_delay, config.jitter_fraction)
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter_fraction(&self) -> f64 {
        self.jitter_fraction
    }

    /// Calculate the delay for an attempt using the thread-local RNG.
    ///
    /// `base_override` replaces the configured base delay, typically with a
    /// provider's retry-after hint.
    pub fn compute_delay(&self, attempt: u32, base_override: Option<Duration>) -> Duration {
        let sample = rand::thread_rng().gen::<f64>();
        self.compute_delay_with(attempt, base_override, sample)
    }

    /// Calculate the delay for an attempt with an explicit random sample in `[0, 1]`.
    pub fn compute_delay_with(
        &self,
        attempt: u32,
        base_override: Option<Duration>,
        sample: f64,
    ) -> Duration {
        let capped = self.capped_delay(attempt, base_override);
        let jitter = capped.as_secs_f64() * self.jitter_fraction * unit_interval(sample);
        capped + Duration::from_secs_f64(jitter)
    }

    /// Upper bound of any delay this calculator can produce
    pub fn ceiling(&self) -> Duration {
        self.max_delay.mul_f64(1.0 + self.jitter_fraction)
    }

    fn capped_delay(&self, attempt: u32, base_override: Option<Duration>) -> Duration {
        let base = base_override
            .filter(|delay| !delay.is_zero())
            .unwrap_or(self.base_delay);

        // Overflow of either the shift or the multiplication means we are past the cap
        1u32.checked_shl(attempt)
            .and_then(|factor| base.checked_mul(factor))
            .map(|delay| delay.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }
}

/// Clamp to `[0, 1]`, mapping NaN and infinities to 0
fn unit_interval(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

impl Default for BackoffCalculator {
    fn default() -> Self {
        Self::from_config(&RecoveryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calculator() -> BackoffCalculator {
        BackoffCalculator::new(Duration::from_millis(100), Duration::from_secs(10), 0.3)
    }

    #[test]
    fn test_exponential_growth_without_jitter() {
        let calc = calculator();

        assert_eq!(calc.compute_delay_with(0, None, 0.0), Duration::from_millis(100));
        assert_eq!(calc.compute_delay_with(1, None, 0.0), Duration::from_millis(200));
        assert_eq!(calc.compute_delay_with(2, None, 0.0), Duration::from_millis(400));
        assert_eq!(calc.compute_delay_with(3, None, 0.0), Duration::from_millis(800));
    }

    #[test]
    fn test_max_delay_cap() {
        let calc = BackoffCalculator::new(Duration::from_millis(100), Duration::from_millis(500), 0.0);

        assert_eq!(calc.compute_delay_with(3, None, 0.5), Duration::from_millis(500));
        assert_eq!(calc.compute_delay_with(10, None, 0.5), Duration::from_millis(500));
        assert_eq!(calc.compute_delay_with(u32::MAX, None, 0.5), Duration::from_millis(500));
    }

    #[test]
    fn test_full_jitter_sample_adds_fraction() {
        let calc = calculator();

        let delay = calc.compute_delay_with(0, None, 1.0);
        assert_eq!(delay.as_millis(), 130);
    }

    #[test]
    fn test_base_override() {
        let calc = calculator();

        let delay = calc.compute_delay_with(1, Some(Duration::from_secs(2)), 0.0);
        assert_eq!(delay, Duration::from_secs(4));

        // A zero hint falls back to the configured base
        let delay = calc.compute_delay_with(0, Some(Duration::ZERO), 0.0);
        assert_eq!(delay, Duration::from_millis(100));
    }

    #[test]
    fn test_monotonic_for_fixed_sample() {
        let calc = calculator();

        for sample in [0.0, 0.25, 0.9] {
            let mut previous = Duration::ZERO;
            for attempt in 0..20 {
                let delay = calc.compute_delay_with(attempt, None, sample);
                assert!(delay >= previous, "attempt {} shrank the delay", attempt);
                previous = delay;
            }
        }
    }

    #[test]
    fn test_random_delays_are_positive_and_bounded() {
        let calc = calculator();

        for attempt in 0..30 {
            let delay = calc.compute_delay(attempt, None);
            assert!(delay > Duration::ZERO);
            assert!(delay <= calc.ceiling());
        }
    }

    #[test]
    fn test_jitter_fraction_is_clamped() {
        let calc = BackoffCalculator::new(Duration::from_millis(10), Duration::from_secs(1), 4.0);
        assert_eq!(calc.jitter_fraction(), 1.0);
    }

    #[test]
    fn test_non_finite_jitter_disables_jitter() {
        for fraction in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let calc = BackoffCalculator::new(Duration::from_millis(10), Duration::from_secs(1), fraction);
            assert_eq!(calc.jitter_fraction(), 0.0);
            assert_eq!(calc.compute_delay(2, None), Duration::from_millis(40));
        }

        let calc = calculator();
        assert_eq!(
            calc.compute_delay_with(0, None, f64::NAN),
            Duration::from_millis(100)
        );
    }
}

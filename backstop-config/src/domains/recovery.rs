//! Recovery configuration validation

use crate::error::ConfigResult;
use crate::validation::{validate_positive, validate_range, Validatable};
use backstop_resilience::RecoveryConfig;

impl Validatable for RecoveryConfig {
    fn validate(&self) -> ConfigResult<()> {
        let domain = self.domain_name();

        validate_positive(self.base_delay.as_millis(), "base_delay (ms)", domain)?;
        if self.max_delay < self.base_delay {
            return Err(self.validation_error(format!(
                "max_delay ({:?}) cannot be lower than base_delay ({:?})",
                self.max_delay, self.base_delay
            )));
        }

        validate_range(self.jitter_fraction, 0.0, 1.0, "jitter_fraction", domain)?;
        validate_positive(self.circuit_breaker_threshold, "circuit_breaker_threshold", domain)?;
        validate_positive(
            self.circuit_breaker_timeout.as_millis(),
            "circuit_breaker_timeout (ms)",
            domain,
        )?;
        validate_positive(self.half_open_max_calls, "half_open_max_calls", domain)?;
        validate_positive(self.max_queue_size, "max_queue_size", domain)?;
        validate_positive(self.queue_interval.as_millis(), "queue_interval (ms)", domain)?;

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "recovery"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_recovery_config_is_valid() {
        assert!(RecoveryConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_values() {
        let cases: Vec<(&str, RecoveryConfig)> = vec![
            ("base_delay", RecoveryConfig::builder().base_delay(Duration::ZERO).build()),
            ("circuit_breaker_threshold", {
                let mut config = RecoveryConfig::default();
                config.circuit_breaker_threshold = 0;
                config
            }),
            (
                "circuit_breaker_timeout",
                RecoveryConfig::builder()
                    .circuit_breaker_timeout(Duration::ZERO)
                    .build(),
            ),
            ("half_open_max_calls", {
                let mut config = RecoveryConfig::default();
                config.half_open_max_calls = 0;
                config
            }),
            ("max_queue_size", RecoveryConfig::builder().max_queue_size(0).build()),
            ("queue_interval", RecoveryConfig::builder().queue_interval(Duration::ZERO).build()),
        ];

        for (field, config) in cases {
            let err = config.validate().unwrap_err();
            assert!(
                err.to_string().contains(field),
                "expected {} in '{}'",
                field,
                err
            );
        }
    }

    #[test]
    fn test_rejects_max_delay_below_base() {
        let config = RecoveryConfig::builder()
            .base_delay(Duration::from_secs(10))
            .max_delay(Duration::from_secs(5))
            .build();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_delay"));
    }

    #[test]
    fn test_rejects_jitter_out_of_range() {
        let mut config = RecoveryConfig::default();
        config.jitter_fraction = 1.5;
        assert!(config.validate().is_err());
        config.jitter_fraction = -0.1;
        assert!(config.validate().is_err());
    }
}

//! Rate-limit classification of arbitrary operation errors
//!
//! External clients fail with their own error shapes. The [`RateLimitSignal`]
//! trait lets each shape expose whatever it knows (HTTP status, error name,
//! retry-after hint, quota headers) and [`RateLimitClassifier`] turns that into
//! a yes/no decision plus the wait and quota details the executor needs.
//!
//! Detection is liberal but never guesses: an error is only classified as a
//! rate limit when it carries a 429 status or names itself as one.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::state::ProviderKey;

/// Retry-after values below this are seconds, everything else milliseconds
const SECONDS_CUTOFF: u64 = 1000;

const RATE_LIMIT_MARKERS: [&str; 3] = ["rate limit", "too many requests", "429"];

/// Rate-limit facts an error can expose.
///
/// Every method defaults to "unknown"; the message used for text matching
/// comes from `Display`.
pub trait RateLimitSignal: std::fmt::Display {
    /// Numeric status code attached to the failure, if any
    fn status_code(&self) -> Option<u16> {
        None
    }

    /// Symbolic name of the error (e.g. `RateLimitError`)
    fn error_name(&self) -> Option<&str> {
        None
    }

    /// Raw retry-after value, in seconds when below 1000 and milliseconds otherwise
    fn retry_after(&self) -> Option<u64> {
        None
    }

    /// Remaining quota reported alongside the failure
    fn remaining(&self) -> Option<u64> {
        None
    }

    /// Quota limit reported alongside the failure
    fn limit(&self) -> Option<u64> {
        None
    }

    /// Quota reset time as reported (RFC 3339 or Unix seconds)
    fn reset_at(&self) -> Option<&str> {
        None
    }
}

/// Wait and quota data extracted from a rate-limit failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDetails {
    pub provider: ProviderKey,
    /// How long the provider asked us to wait, or the base delay when it did not say
    #[serde(with = "humantime_serde")]
    pub retry_after: Duration,
    pub remaining: Option<u64>,
    pub limit: Option<u64>,
    pub reset_at: Option<DateTime<Utc>>,
}

/// Stateless rate-limit classifier
#[derive(Debug, Clone)]
pub struct RateLimitClassifier {
    fallback_delay: Duration,
}

impl RateLimitClassifier {
    /// `fallback_delay` is reported as the retry-after when the error carries none
    pub fn new(fallback_delay: Duration) -> Self {
        Self { fallback_delay }
    }

    /// Whether the failure is a rate-limit rejection
    pub fn is_rate_limit_error<E: RateLimitSignal + ?Sized>(&self, error: &E) -> bool {
        if let Some(status) = error.status_code() {
            if status == 429 {
                return true;
            }
        }

        if let Some(name) = error.error_name() {
            if contains_marker(name) {
                return true;
            }
        }

        contains_marker(&error.to_string())
    }

    /// Extract wait duration and quota snapshot from a failure
    pub fn extract_details<E: RateLimitSignal + ?Sized>(
        &self,
        provider: &ProviderKey,
        error: &E,
    ) -> RateLimitDetails {
        let retry_after = error
            .retry_after()
            .filter(|raw| *raw > 0)
            .map(normalize_retry_after)
            .unwrap_or(self.fallback_delay);

        RateLimitDetails {
            provider: provider.clone(),
            retry_after,
            remaining: error.remaining(),
            limit: error.limit(),
            reset_at: error.reset_at().and_then(parse_reset_at),
        }
    }
}

impl Default for RateLimitClassifier {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

fn contains_marker(text: &str) -> bool {
    let lowered = text.to_lowercase();
    RATE_LIMIT_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

/// Normalize a raw retry-after value to a duration
pub fn normalize_retry_after(raw: u64) -> Duration {
    if raw < SECONDS_CUTOFF {
        Duration::from_secs(raw)
    } else {
        Duration::from_millis(raw)
    }
}

/// Parse a reset timestamp given as RFC 3339 or as Unix epoch seconds
pub fn parse_reset_at(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();

    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }

    trimmed
        .parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

/// Generic provider failure for clients without an error type of their own
#[derive(Debug, Clone, Default, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ProviderError {
    pub message: String,
    pub status: Option<u16>,
    pub name: Option<String>,
    pub retry_after: Option<u64>,
    pub remaining: Option<u64>,
    pub limit: Option<u64>,
    pub reset_at: Option<String>,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// A 429 response with an optional retry-after hint
    pub fn rate_limited(retry_after: Option<u64>) -> Self {
        Self {
            message: "Too Many Requests".to_string(),
            status: Some(429),
            retry_after,
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_retry_after(mut self, retry_after: u64) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_quota(mut self, remaining: u64, limit: u64) -> Self {
        self.remaining = Some(remaining);
        self.limit = Some(limit);
        self
    }

    pub fn with_reset_at(mut self, reset_at: impl Into<String>) -> Self {
        self.reset_at = Some(reset_at.into());
        self
    }
}

impl RateLimitSignal for ProviderError {
    fn status_code(&self) -> Option<u16> {
        self.status
    }

    fn error_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn retry_after(&self) -> Option<u64> {
        self.retry_after
    }

    fn remaining(&self) -> Option<u64> {
        self.remaining
    }

    fn limit(&self) -> Option<u64> {
        self.limit
    }

    fn reset_at(&self) -> Option<&str> {
        self.reset_at.as_deref()
    }
}

impl RateLimitSignal for String {}

impl RateLimitSignal for &str {}

impl RateLimitSignal for std::io::Error {}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> RateLimitClassifier {
        RateLimitClassifier::new(Duration::from_millis(1500))
    }

    #[test]
    fn test_status_code_429() {
        let error = ProviderError::new("upstream said no").with_status(429);
        assert!(classifier().is_rate_limit_error(&error));
    }

    #[test]
    fn test_other_status_codes_are_not_rate_limits() {
        let error = ProviderError::new("bad gateway").with_status(502);
        assert!(!classifier().is_rate_limit_error(&error));
    }

    #[test]
    fn test_name_and_message_markers() {
        let spaced = ProviderError::new("oops").with_name("Rate Limit Exceeded");
        assert!(classifier().is_rate_limit_error(&spaced));

        assert!(classifier().is_rate_limit_error(&"Too Many Requests".to_string()));
        assert!(classifier().is_rate_limit_error(&"HTTP 429 from api.linear.app"));
        assert!(classifier().is_rate_limit_error(&"GraphQL: RATE LIMIT exceeded"));
    }

    #[test]
    fn test_absence_of_information_is_not_a_rate_limit() {
        assert!(!classifier().is_rate_limit_error(&ProviderError::default()));
        assert!(!classifier().is_rate_limit_error(&"connection reset by peer"));
    }

    #[test]
    fn test_retry_after_normalization() {
        let provider = ProviderKey::from("notion");

        let seconds = ProviderError::rate_limited(Some(30));
        let details = classifier().extract_details(&provider, &seconds);
        assert_eq!(details.retry_after, Duration::from_secs(30));

        let millis = ProviderError::rate_limited(Some(2500));
        let details = classifier().extract_details(&provider, &millis);
        assert_eq!(details.retry_after, Duration::from_millis(2500));

        let missing = ProviderError::rate_limited(None);
        let details = classifier().extract_details(&provider, &missing);
        assert_eq!(details.retry_after, Duration::from_millis(1500));
    }

    #[test]
    fn test_quota_and_reset_extraction() {
        let provider = ProviderKey::from("github");
        let error = ProviderError::rate_limited(Some(1))
            .with_quota(0, 5000)
            .with_reset_at("2026-03-01T12:00:00Z");

        let details = classifier().extract_details(&provider, &error);
        assert_eq!(details.provider, provider);
        assert_eq!(details.remaining, Some(0));
        assert_eq!(details.limit, Some(5000));
        assert_eq!(
            details.reset_at,
            Some(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_parse_reset_at_formats() {
        assert_eq!(
            parse_reset_at("1700000000"),
            Utc.timestamp_opt(1_700_000_000, 0).single()
        );
        assert!(parse_reset_at("2026-01-02T03:04:05+02:00").is_some());
        assert!(parse_reset_at("soon").is_none());
    }
}

//! Backoff policy for retryable outcomes and unavailable apps.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use pushgate_common::config::RetryConfig;

/// Exponential backoff with bounded jitter and a hard cap.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Attempts after which a retryable outcome becomes permanent.
    pub max_attempts: u32,
    /// Delay for attempt 1. Actual delay = base * 2^(attempt - 1) + jitter.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Adds random jitter in [0, base_delay/2), never past `max_delay`.
    pub jitter: bool,
}

impl From<&RetryConfig> for BackoffPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            jitter: config.jitter,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-indexed).
    ///
    /// Non-decreasing in `attempt`: the jitter is smaller than the gap to the
    /// next exponential step and never crosses the cap.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        let capped = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        let remaining_ms =
            u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }

    /// Whether `attempt` has reached the cap.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Absolute time of retry number `attempt`.
    pub fn next_attempt_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay(attempt))
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)));
        now + delay
    }
}

/// Parse a `Retry-After` header: delta-seconds or an HTTP date.
///
/// Dates in the past resolve to `now`.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        let secs = i64::try_from(secs).ok()?;
        return now.checked_add_signed(chrono::Duration::try_seconds(secs)?);
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some(at.max(now))
}

/// Read and parse the `Retry-After` header of a response.
pub fn retry_after_header(
    headers: &reqwest::header::HeaderMap,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_retry_after(v, now))
}

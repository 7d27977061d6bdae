// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use rand::Rng;
use sigrid_config::RetryConfig;

/// Exponential backoff with full jitter.
///
/// The deterministic ceiling doubles per attempt from `base_delay_ms` and
/// is capped at `max_delay_ms`; the actual delay is drawn uniformly from
/// `[0, ceiling]` so concurrent clients do not retry in lockstep.
pub fn backoff_delay(attempt: u32, cfg: &RetryConfig) -> Duration {
    let ceiling = cfg
        .base_delay_ms
        .saturating_mul(1u64 << attempt.min(16))
        .min(cfg.max_delay_ms);
    let jittered = rand::thread_rng().gen_range(0..=ceiling);
    Duration::from_millis(jittered)
}

/// Final delay for a 429: the max of the server's `retry-after` hint and
/// the computed backoff.
pub fn rate_limit_delay(backoff: Duration, hint: Option<Duration>) -> Duration {
    match hint {
        Some(h) => backoff.max(h),
        None => backoff,
    }
}

/// Parse an HTTP `retry-after` header value (delta-seconds form only; the
/// HTTP-date form is rare on API endpoints and simply ignored).
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RetryConfig {
        RetryConfig {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }

    #[test]
    fn backoff_never_exceeds_cap() {
        let cfg = cfg();
        for attempt in 0..20 {
            let d = backoff_delay(attempt, &cfg);
            assert!(d <= Duration::from_millis(cfg.max_delay_ms));
        }
    }

    #[test]
    fn backoff_ceiling_grows_with_attempts() {
        // With full jitter individual samples vary; sample repeatedly and
        // check the maximum observed delay grows between attempt 0 and 4.
        let cfg = cfg();
        let max_at = |attempt| {
            (0..64)
                .map(|_| backoff_delay(attempt, &cfg))
                .max()
                .unwrap()
        };
        assert!(max_at(4) > max_at(0));
    }

    #[test]
    fn rate_limit_delay_takes_max_of_hint_and_backoff() {
        let b = Duration::from_millis(500);
        assert_eq!(
            rate_limit_delay(b, Some(Duration::from_secs(3))),
            Duration::from_secs(3)
        );
        assert_eq!(rate_limit_delay(b, Some(Duration::from_millis(10))), b);
        assert_eq!(rate_limit_delay(b, None), b);
    }

    #[test]
    fn parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after(" 12 "), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }
}

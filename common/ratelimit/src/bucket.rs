//! Token-bucket arithmetic, kept pure so the refill behavior is testable
//! without a database. The shared-state reads/writes live in lib.rs.

/// Tokens available after `elapsed_secs` of refill, capped at `burst`.
pub fn refill(tokens: f64, burst: f64, rps: f64, elapsed_secs: f64) -> f64 {
    let elapsed = elapsed_secs.max(0.0);
    (tokens + elapsed * rps).min(burst)
}

/// Seconds until one whole token is available given the current level.
/// Zero when a token is already available.
pub fn wait_for_one(tokens: f64, rps: f64) -> f64 {
    if tokens >= 1.0 {
        return 0.0;
    }
    if rps <= 0.0 {
        return f64::MAX;
    }
    (1.0 - tokens) / rps
}

/// Apply a jitter factor to a wait. Factors are sampled by the caller in
/// the 0.8..1.2 band so neighboring workers do not wake in lockstep.
pub fn jittered(seconds: f64, factor: f64) -> f64 {
    (seconds * factor).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn refill_caps_at_burst() {
        assert_eq!(refill(0.0, 6.0, 6.0, 100.0), 6.0);
        assert_eq!(refill(5.5, 6.0, 1.0, 0.25), 5.75);
    }

    #[test]
    fn refill_ignores_negative_elapsed() {
        // Clock skew between workers must never drain the bucket.
        assert_eq!(refill(3.0, 6.0, 2.0, -5.0), 3.0);
    }

    #[test]
    fn wait_is_zero_when_token_available() {
        assert_eq!(wait_for_one(1.0, 1.0), 0.0);
        assert_eq!(wait_for_one(4.2, 0.5), 0.0);
    }

    #[test]
    fn wait_scales_with_deficit() {
        assert_eq!(wait_for_one(0.0, 1.0), 1.0);
        assert_eq!(wait_for_one(0.5, 1.0), 0.5);
        assert_eq!(wait_for_one(0.0, 2.0), 0.5);
    }

    proptest! {
        #[test]
        fn refill_is_monotonic_in_elapsed(
            tokens in 0.0f64..10.0,
            rps in 0.01f64..10.0,
            a in 0.0f64..100.0,
            b in 0.0f64..100.0,
        ) {
            let burst = 10.0;
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(refill(tokens, burst, rps, lo) <= refill(tokens, burst, rps, hi));
        }

        #[test]
        fn refill_never_exceeds_burst(
            tokens in 0.0f64..10.0,
            burst in 1.0f64..10.0,
            rps in 0.01f64..10.0,
            elapsed in 0.0f64..1000.0,
        ) {
            let start = tokens.min(burst);
            prop_assert!(refill(start, burst, rps, elapsed) <= burst);
        }

        #[test]
        fn jitter_stays_in_band(seconds in 0.0f64..100.0, factor in 0.8f64..1.2) {
            let j = jittered(seconds, factor);
            prop_assert!(j >= seconds * 0.8 - 1e-9);
            prop_assert!(j <= seconds * 1.2 + 1e-9);
        }
    }
}

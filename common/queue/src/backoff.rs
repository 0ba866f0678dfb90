//! Retry delay schedule shared by job retries and rate-limited
//! re-enqueues. The default schedule can be overridden with
//! `RETRY_SCHEDULE` (comma-separated seconds).

use rand::Rng;
use std::sync::OnceLock;
use std::time::Duration;

const DEFAULT_SCHEDULE_SECS: [u64; 5] = [5, 15, 45, 90, 180];
const CAP_SECS: u64 = 24 * 60 * 60;

fn schedule() -> &'static [u64] {
    static SCHEDULE: OnceLock<Vec<u64>> = OnceLock::new();
    SCHEDULE.get_or_init(|| {
        let parsed: Vec<u64> = std::env::var("RETRY_SCHEDULE")
            .unwrap_or_default()
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        if parsed.is_empty() {
            DEFAULT_SCHEDULE_SECS.to_vec()
        } else {
            parsed
        }
    })
}

/// Delay before re-attempting after `attempts` deliveries (1-based: the
/// first failure retries after 5s). Past the fixed schedule the tail
/// doubles, capped at 24 hours.
pub fn retry_delay(attempts: i32) -> Duration {
    let schedule = schedule();
    let n = attempts.max(1) as usize;
    let secs = if n <= schedule.len() {
        schedule[n - 1]
    } else {
        let doublings = (n - schedule.len()).min(16) as u32;
        schedule[schedule.len() - 1].saturating_mul(1u64 << doublings)
    };
    Duration::from_secs(secs.min(CAP_SECS))
}

/// `retry_delay` with ±15% jitter so retries from a burst of failures
/// do not land on the same tick.
pub fn jittered_retry_delay(attempts: i32) -> Duration {
    let base = retry_delay(attempts).as_secs_f64();
    let factor = rand::thread_rng().gen_range(0.85..1.15);
    Duration::from_secs_f64(base * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_published_schedule() {
        assert_eq!(retry_delay(1), Duration::from_secs(5));
        assert_eq!(retry_delay(2), Duration::from_secs(15));
        assert_eq!(retry_delay(3), Duration::from_secs(45));
        assert_eq!(retry_delay(4), Duration::from_secs(90));
        assert_eq!(retry_delay(5), Duration::from_secs(180));
    }

    #[test]
    fn tail_doubles_and_caps_at_24h() {
        assert_eq!(retry_delay(6), Duration::from_secs(360));
        assert_eq!(retry_delay(7), Duration::from_secs(720));
        assert_eq!(retry_delay(40), Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn zero_and_negative_attempts_use_first_slot() {
        assert_eq!(retry_delay(0), Duration::from_secs(5));
        assert_eq!(retry_delay(-3), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_band() {
        for attempts in 1..8 {
            let base = retry_delay(attempts).as_secs_f64();
            for _ in 0..50 {
                let j = jittered_retry_delay(attempts).as_secs_f64();
                assert!(j >= base * 0.85 - 1e-6 && j <= base * 1.15 + 1e-6);
            }
        }
    }
}

// Upspin cacheserver.
//! Exponential backoff with jitter for writeback retries (spec 4.2):
//! `min(cap, base * 2^attempt)`, perturbed by up to 20% so that many
//! entries that failed at the same moment don't all retry in lockstep.

use std::time::Duration;

use rand::Rng;

const BASE: Duration = Duration::from_millis(500);
const CAP: Duration = Duration::from_secs(300);

/// `attempt` is the number of prior failed attempts for this entry (0 for
/// the first retry after an initial failure).
pub fn backoff_with_jitter(attempt: u32) -> Duration {
    let exp = attempt.min(20); // avoid overflow in 2^attempt
    let scaled = BASE.checked_mul(1u32 << exp).unwrap_or(CAP);
    let capped = scaled.min(CAP);
    let jitter_frac: f64 = rand::thread_rng().gen_range(-0.2..0.2);
    let jittered_nanos = (capped.as_nanos() as f64 * (1.0 + jitter_frac)).max(0.0);
    Duration::from_nanos(jittered_nanos as u64)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn grows_with_attempt_and_respects_cap() {
        let first = backoff_with_jitter(0);
        let later = backoff_with_jitter(10);
        assert!(first <= Duration::from_millis(700));
        assert!(later <= CAP + CAP / 5);
    }

    #[test]
    fn never_overflows_for_large_attempt_counts() {
        let d = backoff_with_jitter(u32::MAX);
        assert!(d <= CAP + CAP / 5);
    }
}

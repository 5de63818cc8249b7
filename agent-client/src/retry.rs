//! Exponential backoff for idempotent requests (spec.md §4.4): 1s, 2s, 4s, capped at 10s.

use std::time::Duration;

pub const MAX_RETRIES: u32 = 4;
const BASE: Duration = Duration::from_secs(1);
const CAP: Duration = Duration::from_secs(10);

pub fn delay_for_attempt(attempt: u32) -> Duration {
    let millis = BASE.as_millis().saturating_mul(1u128 << attempt.min(6));
    Duration::from_millis(millis.min(CAP.as_millis()) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence_caps_at_ten_seconds() {
        assert_eq!(delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(delay_for_attempt(4), Duration::from_secs(10));
        assert_eq!(delay_for_attempt(10), Duration::from_secs(10));
    }
}

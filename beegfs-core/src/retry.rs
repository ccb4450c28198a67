//! Staged retry delays for polling loops (mgmt heartbeat wait, registration)
//!
//! Stages by time elapsed since the first attempt:
//! - < 3s:   ~1s (±100ms jitter)
//! - < 10s:  2s
//! - < 30s:  5s
//! - < 60s:  7s
//! - < 300s: 10s
//! - later:  ~30s (±2s jitter)

use rand::Rng;
use std::time::{Duration, Instant};

/// Delay in milliseconds before the next attempt, given the time already spent
pub fn retry_delay_ms(elapsed_ms: u64) -> u64 {
    let mut rng = rand::thread_rng();

    if elapsed_ms < 3_000 {
        (1_000i64 + rng.gen_range(-100i64..=100)) as u64
    } else if elapsed_ms < 10_000 {
        2_000
    } else if elapsed_ms < 30_000 {
        5_000
    } else if elapsed_ms < 60_000 {
        7_000
    } else if elapsed_ms < 300_000 {
        10_000
    } else {
        (30_000i64 + rng.gen_range(-2_000i64..=2_000)) as u64
    }
}

/// [`retry_delay_ms`] on durations
pub fn retry_delay(elapsed: Duration) -> Duration {
    Duration::from_millis(retry_delay_ms(elapsed.as_millis() as u64))
}

/// Tracks the start of a retry sequence
#[derive(Debug, Clone)]
pub struct Backoff {
    started: Instant,
    attempts: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        self.attempts += 1;
        retry_delay(self.started.elapsed())
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_stage_boundaries() {
        let first = retry_delay_ms(0);
        assert!((900..=1100).contains(&first), "got {}", first);

        assert_eq!(retry_delay_ms(3_000), 2_000);
        assert_eq!(retry_delay_ms(5_000), 2_000);
        assert_eq!(retry_delay_ms(10_000), 5_000);
        assert_eq!(retry_delay_ms(30_000), 7_000);
        assert_eq!(retry_delay_ms(60_000), 10_000);
        assert_eq!(retry_delay_ms(299_999), 10_000);

        let late = retry_delay_ms(400_000);
        assert!((28_000..=32_000).contains(&late), "got {}", late);
    }

    #[test]
    fn test_backoff_counts_attempts() {
        let mut backoff = Backoff::new();
        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_millis(900));
        assert!(delay <= Duration::from_millis(1100));
        assert_eq!(backoff.attempts(), 1);
    }

    proptest! {
        #[test]
        fn delay_stays_within_table(elapsed in 0u64..1_000_000) {
            let delay = retry_delay_ms(elapsed);
            prop_assert!((900..=32_000).contains(&delay));
            if elapsed >= 300_000 {
                prop_assert!(delay >= 28_000);
            }
        }
    }
}

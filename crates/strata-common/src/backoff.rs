//! Requeue backoff table
//!
//! A fixed ascending sequence of wait durations. The time a condition has
//! persisted selects a bucket by walking the cumulative sum of the sequence;
//! past the end of the table the largest entry is used. This gives coarse,
//! capped, exponential-like backoff without per-resource retry counters.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Default sequence, in seconds
const DEFAULT_STEPS_SECS: [u64; 16] = [1, 2, 2, 5, 5, 5, 10, 10, 10, 20, 30, 30, 60, 60, 120, 300];

/// Maps elapsed time since the last condition transition to a requeue delay
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffTable {
    steps: Vec<Duration>,
}

impl Default for BackoffTable {
    fn default() -> Self {
        Self {
            steps: DEFAULT_STEPS_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        }
    }
}

impl BackoffTable {
    /// Create a table from an explicit sequence.
    ///
    /// Returns `None` for an empty sequence or one that is not ascending.
    pub fn new(steps: Vec<Duration>) -> Option<Self> {
        if steps.is_empty() || steps.windows(2).any(|w| w[0] > w[1]) {
            return None;
        }
        Some(Self { steps })
    }

    /// Smallest wait the table can return
    pub fn min(&self) -> Duration {
        self.steps[0]
    }

    /// Largest wait the table can return
    pub fn max(&self) -> Duration {
        self.steps[self.steps.len() - 1]
    }

    /// Wait for a condition that has persisted for `elapsed`
    pub fn for_elapsed(&self, elapsed: Duration) -> Duration {
        let mut cumulative = Duration::ZERO;
        for step in &self.steps {
            cumulative += *step;
            if elapsed < cumulative {
                return *step;
            }
        }
        self.max()
    }

    /// Wait before the next attempt given the last transition time and `now`.
    ///
    /// A transition time in the future (clock skew) counts as zero elapsed.
    pub fn next(&self, last_transition: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        let elapsed = (now - last_transition).to_std().unwrap_or(Duration::ZERO);
        self.for_elapsed(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn first_bucket_for_fresh_condition() {
        let table = BackoffTable::default();
        assert_eq!(table.for_elapsed(Duration::ZERO), secs(1));
        assert_eq!(table.for_elapsed(Duration::from_millis(999)), secs(1));
    }

    #[test]
    fn walks_cumulative_sum() {
        let table = BackoffTable::default();
        // 1 | 2 (ends at 3) | 2 (ends at 5) | 5 (ends at 10)
        assert_eq!(table.for_elapsed(secs(1)), secs(2));
        assert_eq!(table.for_elapsed(secs(4)), secs(2));
        assert_eq!(table.for_elapsed(secs(5)), secs(5));
        assert_eq!(table.for_elapsed(secs(9)), secs(5));
        // 1+2+2+5+5+5+10+10+10 = 50, next bucket is 20s
        assert_eq!(table.for_elapsed(secs(50)), secs(20));
    }

    #[test]
    fn caps_at_largest_entry() {
        let table = BackoffTable::default();
        // full sum is 670s
        assert_eq!(table.for_elapsed(secs(669)), secs(300));
        assert_eq!(table.for_elapsed(secs(670)), secs(300));
        assert_eq!(table.for_elapsed(secs(86_400)), secs(300));
    }

    #[test]
    fn monotonic_and_bounded() {
        let table = BackoffTable::default();
        let now = Utc::now();
        let mut previous = Duration::ZERO;
        for elapsed in (0..2_000).step_by(7) {
            let wait = table.next(now - chrono::Duration::seconds(elapsed), now);
            assert!(wait >= previous, "backoff decreased at {elapsed}s");
            assert!(wait >= table.min() && wait <= table.max());
            previous = wait;
        }
        assert_eq!(table.min(), secs(1));
        assert_eq!(table.max(), secs(300));
    }

    #[test]
    fn future_transition_counts_as_zero() {
        let table = BackoffTable::default();
        let now = Utc::now();
        assert_eq!(table.next(now + chrono::Duration::seconds(30), now), secs(1));
    }

    #[test]
    fn deterministic_for_same_now() {
        let table = BackoffTable::default();
        let now = Utc::now();
        let last = now - chrono::Duration::seconds(42);
        assert_eq!(table.next(last, now), table.next(last, now));
    }

    #[test]
    fn rejects_invalid_tables() {
        assert!(BackoffTable::new(vec![]).is_none());
        assert!(BackoffTable::new(vec![secs(5), secs(1)]).is_none());
        let custom = BackoffTable::new(vec![secs(1), secs(10)]).expect("valid table");
        assert_eq!(custom.for_elapsed(secs(3)), secs(10));
        assert_eq!(custom.for_elapsed(secs(300)), secs(10));
    }
}

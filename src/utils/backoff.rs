use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential retry policy: `base * 2^attempt`, clamped at `cap`.
/// `max_attempts = None` retries forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    #[serde(with = "millis")]
    pub base: Duration,
    #[serde(with = "millis")]
    pub cap: Duration,
}

impl RetryPolicy {
    pub const fn unbounded(base: Duration, cap: Duration) -> Self {
        Self { max_attempts: None, base, cap }
    }

    pub const fn bounded(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self { max_attempts: Some(max_attempts), base, cap }
    }

    /// Delay to wait after the `attempt`-th failure (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn allows(&self, attempts_made: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts_made < max)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff { policy: *self, failures: 0 }
    }
}

/// Running failure count against a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: u32,
}

impl Backoff {
    /// Records a failure. Returns the delay before the next attempt, or
    /// `None` once the policy is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.policy.delay_for(self.failures);
        self.failures = self.failures.saturating_add(1);
        if self.policy.allows(self.failures) {
            Some(delay)
        } else {
            None
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_cap() {
        let policy = RetryPolicy::unbounded(Duration::from_secs(1), Duration::from_secs(30));
        let delays: Vec<u64> = (0..7).map(|a| policy.delay_for(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(policy.delay_for(200), Duration::from_secs(30));
    }

    #[test]
    fn bounded_backoff_runs_out() {
        let policy = RetryPolicy::bounded(3, Duration::from_millis(10), Duration::from_secs(1));
        let mut backoff = policy.backoff();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(backoff.next_delay(), None);
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
    }

    #[test]
    fn unbounded_backoff_never_runs_out() {
        let mut backoff =
            RetryPolicy::unbounded(Duration::from_millis(1), Duration::from_millis(4)).backoff();
        for _ in 0..1000 {
            assert!(backoff.next_delay().is_some());
        }
    }
}

use std::time::Duration;

/// Exponential backoff applied after the signaling transport drops unexpectedly.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait before the given 1-based reconnection attempt, `None` once
    /// the attempt is past the cap.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1));
        Some(self.base_delay.saturating_mul(factor))
    }

    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_attempts).filter_map(|attempt| self.delay_for(attempt))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_schedule_doubles() {
        let delays: Vec<_> = RetryPolicy::default().delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(4000),
                Duration::from_millis(8000),
            ]
        );
    }

    #[test]
    fn test_no_delay_outside_attempt_range() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), None);
        assert_eq!(policy.delay_for(6), None);
    }

    #[test]
    fn test_zero_attempts_never_retries() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delays().count(), 0);
    }

    #[test]
    fn test_huge_multiplier_saturates() {
        let policy = RetryPolicy {
            max_attempts: 40,
            base_delay: Duration::from_secs(1),
            multiplier: 10,
        };
        assert!(policy.delay_for(40).is_some());
    }
}

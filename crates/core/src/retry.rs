use chrono::Duration;

/// Default attempt ceiling applied when configuration does not override it.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Retry schedule for failed deliveries.
///
/// Exponential without jitter: `base * multiplier^(attempt - 1)`. The delay
/// strictly increases with the attempt count, which is the only property the
/// queue store relies on; the attempt ceiling keeps it bounded in practice.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    base_secs: i64,
    multiplier: i64,
}

impl BackoffPolicy {
    pub const fn new(base_secs: i64, multiplier: i64) -> Self {
        Self {
            base_secs,
            multiplier,
        }
    }

    /// Delay to wait before the given attempt becomes eligible again.
    /// `attempt` is 1-indexed: the first failure schedules `base`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let factor = self.multiplier.saturating_pow(exponent);
        Duration::seconds(self.base_secs.saturating_mul(factor))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(30, 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_doubles() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::seconds(30));
        assert_eq!(policy.delay_for(2), Duration::seconds(60));
        assert_eq!(policy.delay_for(3), Duration::seconds(120));
    }

    #[test]
    fn delay_strictly_increases() {
        let policy = BackoffPolicy::default();
        for attempt in 1..10 {
            assert!(policy.delay_for(attempt + 1) > policy.delay_for(attempt));
        }
    }

    #[test]
    fn zero_attempt_clamps_to_base() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::seconds(30));
    }
}

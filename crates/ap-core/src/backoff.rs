use std::time::Duration;

/// Exponential backoff applied to requeued tasks.
///
/// `delay_for(n) = base * multiplier^(n - 1)`, capped at `max_delay`. Pure:
/// no clock, no jitter, so the same attempt count always maps to the same
/// delay.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt.
    pub base: Duration,
    /// Growth factor per additional attempt.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    /// A policy that never waits. Handy for tests.
    pub fn immediate() -> Self {
        Self {
            base: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before the next attempt, given how many attempts have failed
    /// so far (1-indexed). `0` is treated like `1`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let secs = self.base.as_secs_f64() * factor;
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else if capped.is_finite() {
            Duration::ZERO
        } else {
            self.max_delay
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_growth() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn zero_attempts_uses_base() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(0), policy.base);
    }

    #[test]
    fn capped_at_max_delay() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(10),
            multiplier: 10.0,
            max_delay: Duration::from_secs(30),
        };
        assert_eq!(policy.delay_for(5), Duration::from_secs(30));
        // Huge exponents overflow f64 to infinity; still capped.
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn immediate_policy_never_waits() {
        let policy = BackoffPolicy::immediate();
        assert_eq!(policy.delay_for(1), Duration::ZERO);
        assert_eq!(policy.delay_for(7), Duration::ZERO);
    }
}

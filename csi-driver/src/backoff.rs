//! Retry and polling schedules.
//!
//! Both policies are pure functions of (attempt count, elapsed time), so the
//! loops that use them can be driven by a paused tokio clock in tests.

use std::time::Duration;

/// Next step of a retry or poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Wait this long, then try again
    Retry(Duration),
    /// Stop: the budget is spent
    GiveUp,
}

/// Maximum number of login attempts per portal
const LOGIN_ATTEMPTS: u32 = 3;
/// Fixed delay between login attempts
const LOGIN_BACKOFF: Duration = Duration::from_secs(1);

/// Fixed-backoff policy for per-portal login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginRetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for LoginRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: LOGIN_ATTEMPTS,
            backoff: LOGIN_BACKOFF,
        }
    }
}

impl LoginRetryPolicy {
    /// Decide after `attempts` failed attempts (1-based).
    pub fn next(&self, attempts: u32) -> Decision {
        if attempts >= self.max_attempts {
            Decision::GiveUp
        } else {
            Decision::Retry(self.backoff)
        }
    }
}

/// Initial device poll delay in milliseconds
const INITIAL_POLL_MS: u64 = 100;
/// Maximum device poll delay in milliseconds
const MAX_POLL_MS: u64 = 2000;
/// Backoff multiplier (exponential factor)
const POLL_MULTIPLIER: u32 = 2;
/// Total time allowed for a device node to appear
const POLL_BUDGET: Duration = Duration::from_secs(30);

/// Bounded exponential backoff for device-node polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevicePollPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
    pub budget: Duration,
}

impl Default for DevicePollPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(INITIAL_POLL_MS),
            max: Duration::from_millis(MAX_POLL_MS),
            multiplier: POLL_MULTIPLIER,
            budget: POLL_BUDGET,
        }
    }
}

impl DevicePollPolicy {
    /// Decide after `polls` unsuccessful polls (1-based), `elapsed` since the
    /// first one.
    ///
    /// The delay is clipped so the loop never sleeps past the budget; once the
    /// budget is spent the answer is [`Decision::GiveUp`].
    pub fn next(&self, polls: u32, elapsed: Duration) -> Decision {
        if elapsed >= self.budget {
            return Decision::GiveUp;
        }

        let exponent = polls.saturating_sub(1).min(16);
        let delay = self
            .initial
            .saturating_mul(self.multiplier.saturating_pow(exponent))
            .min(self.max);

        Decision::Retry(delay.min(self.budget - elapsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_policy_fixed_backoff() {
        let policy = LoginRetryPolicy::default();
        assert_eq!(policy.next(1), Decision::Retry(Duration::from_secs(1)));
        assert_eq!(policy.next(2), Decision::Retry(Duration::from_secs(1)));
        assert_eq!(policy.next(3), Decision::GiveUp);
    }

    #[test]
    fn test_single_attempt_login_policy() {
        let policy = LoginRetryPolicy {
            max_attempts: 1,
            backoff: Duration::ZERO,
        };
        assert_eq!(policy.next(1), Decision::GiveUp);
    }

    #[test]
    fn test_poll_policy_grows_and_caps() {
        let policy = DevicePollPolicy::default();
        let delays: Vec<_> = (1..=7)
            .map(|n| match policy.next(n, Duration::ZERO) {
                Decision::Retry(d) => d.as_millis(),
                Decision::GiveUp => panic!("gave up early"),
            })
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 2000, 2000]);
    }

    #[test]
    fn test_poll_policy_respects_budget() {
        let policy = DevicePollPolicy::default();
        assert_eq!(
            policy.next(10, Duration::from_millis(29_500)),
            Decision::Retry(Duration::from_millis(500))
        );
        assert_eq!(policy.next(10, Duration::from_secs(30)), Decision::GiveUp);
        assert_eq!(policy.next(1, Duration::from_secs(31)), Decision::GiveUp);
    }

    #[test]
    fn test_poll_policy_large_attempt_count_does_not_overflow() {
        let policy = DevicePollPolicy::default();
        assert_eq!(
            policy.next(u32::MAX, Duration::ZERO),
            Decision::Retry(Duration::from_secs(2))
        );
    }
}

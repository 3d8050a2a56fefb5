//! Retry utilities: budgeted exponential backoff for `backon`.
//!
//! [`Backoff`] is a `backon` backoff builder. Every retry run gets its own
//! [`BudgetedBackoff`] schedule, whose delays never carry the run past the
//! configured budget.

use std::time::Duration;

use backon::BackoffBuilder;
use rand::Rng;
use tokio::time::Instant;

/// Configuration for budgeted exponential backoff.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay before the first retry (before jitter).
    pub base_delay: Duration,
    /// Upper bound of the random jitter added to every delay.
    pub max_jitter: Duration,
    /// Total time allowed across all attempts and sleeps.
    pub budget: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::metadata()
    }
}

impl Backoff {
    /// Backoff for identity-token retrieval from the metadata service.
    ///
    /// - Base delay: 1s, doubling each attempt
    /// - Jitter: up to 500ms
    /// - Budget: 16s
    pub fn metadata() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_jitter: Duration::from_millis(500),
            budget: Duration::from_secs(16),
        }
    }

    /// Delay before retry number `attempt` (0-indexed), without jitter.
    ///
    /// `base * 2^attempt`, saturating instead of overflowing.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay
            .checked_mul(1u32 << attempt.min(20))
            .unwrap_or(Duration::MAX)
    }

    /// Delay before retry number `attempt` (0-indexed), with jitter in
    /// `[0, max_jitter]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };
        self.base_delay_for_attempt(attempt).saturating_add(jitter)
    }
}

impl BackoffBuilder for Backoff {
    type Backoff = BudgetedBackoff;

    fn build(self) -> Self::Backoff {
        BudgetedBackoff {
            policy: self,
            attempt: 0,
            started: Instant::now(),
        }
    }
}

/// Delay schedule for one retry run.
///
/// The budget is measured from when the schedule was built, so time spent in
/// attempts counts against it too. Each delay is clamped to what is left;
/// the schedule ends once nothing is.
#[derive(Debug)]
pub struct BudgetedBackoff {
    policy: Backoff,
    attempt: u32,
    started: Instant,
}

impl Iterator for BudgetedBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let remaining = self.policy.budget.saturating_sub(self.started.elapsed());
        if remaining.is_zero() {
            return None;
        }

        let delay = self.policy.delay_for_attempt(self.attempt).min(remaining);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }
}

#[cfg(test)]
mod tests;

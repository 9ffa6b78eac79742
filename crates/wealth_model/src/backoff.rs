//! Exponential retry backoff for liquidation attempts

/// Retry schedule for a liquidation task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: 120,
            max_delay_secs: 1_800,
            max_attempts: 20,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `attempt_count` attempts.
    ///
    /// `min(base * 2^(attempt_count - 1), max)`; attempt 0 is treated as 1.
    pub fn delay_secs(&self, attempt_count: u32) -> u64 {
        let exponent = attempt_count.saturating_sub(1).min(32);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        self.base_delay_secs
            .saturating_mul(factor)
            .min(self.max_delay_secs)
    }

    /// Whether a task with `attempt_count` attempts has used up its budget.
    pub fn exhausted(&self, attempt_count: u32) -> bool {
        attempt_count >= self.max_attempts
    }
}

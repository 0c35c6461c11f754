//! Restart backoff schedule.

use hm_core::HmConfig;
use hm_state::CrashCount;

/// How long a crashing index waits between restart attempts.
///
/// ```text
/// attempts < threshold   delay = grace_period
/// attempts >= threshold  delay = grace_period * 2^(attempts - threshold + 1)
///                        capped at max_delay
/// ```
///
/// With a threshold of 3, starts go out at t0, t0+G, t0+2G, then t0+4G,
/// t0+8G and so on until the cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Minimum seconds between two attempts.
    pub grace_period: u64,
    /// Attempts sent at grace cadence before the delay escalates.
    pub threshold: u32,
    /// Upper bound on the delay.
    pub max_delay: u64,
}

impl BackoffPolicy {
    pub fn new(grace_period: u64, threshold: u32, max_delay: u64) -> Self {
        Self {
            grace_period,
            threshold,
            max_delay,
        }
    }

    pub fn from_config(config: &HmConfig) -> Self {
        Self::new(
            config.grace_period,
            config.backoff_threshold,
            config.max_backoff_delay,
        )
    }

    /// Seconds that must pass after the `attempts`-th start before the next.
    pub fn delay(&self, attempts: u32) -> u64 {
        if attempts < self.threshold {
            return self.grace_period;
        }
        let exponent = attempts - self.threshold + 1;
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        self.grace_period
            .saturating_mul(factor)
            .min(self.max_delay)
            .max(self.grace_period)
    }

    /// Whether another start may be sent for `record` at `now`.
    pub fn attempt_due(&self, record: &CrashCount, now: u64) -> bool {
        now.saturating_sub(record.last_attempt_at) >= self.delay(record.crash_count)
    }

    /// Crash counts idle this long are forgotten.
    pub fn crash_count_ttl(&self) -> u64 {
        self.max_delay.saturating_mul(2)
    }
}

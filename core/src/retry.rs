/*!
# Retry Module

This module defines the retry policy and the backoff calculator for HookRelay.

A retry policy determines:
- How many failed attempts a delivery may accumulate before it is abandoned
- How long to wait before the next attempt (exponential growth from a base delay)
- How much random jitter to add so that endpoints recovering from an outage are
  not hit by a synchronized retry storm
- Whether abandoned deliveries are kept in the dead-letter store

The backoff calculation is pure apart from the jitter draw: given an attempt
count and a policy it returns the next due time, and nothing else.
*/

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration as StdDuration;

use crate::error::{HookRelayError, Result};

/// Retry policy for failed deliveries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts allowed before the delivery is abandoned
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,

    /// Upper bound for any single delay, jitter included
    pub max_delay_ms: u64,

    /// Growth factor applied per attempt
    pub exponential_multiplier: f64,

    /// Jitter is drawn uniformly from `[0, jitter_ms)`
    pub jitter_ms: u64,

    /// Keep abandoned deliveries in the dead-letter store instead of dropping them
    pub dead_letter_enabled: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000, // 5 minutes
            exponential_multiplier: 2.0,
            jitter_ms: 500,
            dead_letter_enabled: true,
        }
    }
}

impl RetryPolicy {
    /// Reject policies that would make the backoff meaningless
    pub fn validate(&self) -> Result<()> {
        if !self.exponential_multiplier.is_finite() || self.exponential_multiplier < 1.0 {
            return Err(HookRelayError::Config(format!(
                "exponential_multiplier must be >= 1, got {}",
                self.exponential_multiplier
            )));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(HookRelayError::Config(format!(
                "base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }

    /// Check whether `attempt_count` is past the retry budget
    pub fn is_exhausted(&self, attempt_count: u32) -> bool {
        attempt_count > self.max_retries
    }

    /// Exponential delay for `attempt_count`, before jitter, clamped to `max_delay_ms`
    pub fn base_delay(&self, attempt_count: u32) -> StdDuration {
        let exponent = attempt_count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay_ms as f64 * self.exponential_multiplier.powi(exponent);

        let millis = if raw.is_finite() && raw < self.max_delay_ms as f64 {
            raw as u64
        } else {
            self.max_delay_ms
        };

        StdDuration::from_millis(millis)
    }

    /// Full delay for `attempt_count`: exponential term plus jitter, clamped to `max_delay_ms`
    pub fn delay(&self, attempt_count: u32) -> StdDuration {
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..self.jitter_ms)
        } else {
            0
        };

        let total = (self.base_delay(attempt_count).as_millis() as u64).saturating_add(jitter);
        StdDuration::from_millis(total.min(self.max_delay_ms))
    }

    /// Calculate when attempt `attempt_count` becomes due, relative to `now`
    pub fn next_due_at_from(&self, attempt_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = Duration::milliseconds(self.delay(attempt_count).as_millis() as i64);
        now + delay
    }
}

/// Calculate the next attempt time for `attempt_count` under `policy`
pub fn next_due_at(attempt_count: u32, policy: &RetryPolicy) -> DateTime<Utc> {
    policy.next_due_at_from(attempt_count, Utc::now())
}

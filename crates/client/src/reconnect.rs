//! Reconnection policies
//!
//! `Native` leaves recovery to the transport itself and only observes.
//! `Backoff` schedules explicit retries with exponential delays and a bounded
//! attempt counter.

use std::time::Duration;

/// Explicit exponential backoff: `2^attempt * base` after each failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(crate::config::DEFAULT_BACKOFF_BASE_MS),
            max_attempts: crate::config::DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    Native,
    Backoff(BackoffPolicy),
}

/// What the driver does after a transport failed or closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { attempt: u32, delay: Duration },
    GiveUp { attempts: u32 },
}

impl ReconnectPolicy {
    /// Attempt budget reported to subscribers; zero for `Native`.
    pub fn max_attempts(&self) -> u32 {
        match self {
            ReconnectPolicy::Native => 0,
            ReconnectPolicy::Backoff(policy) => policy.max_attempts,
        }
    }

    /// Decide the next step given the failed attempts so far.
    pub fn next(&self, attempts: u32) -> ReconnectDecision {
        match self {
            ReconnectPolicy::Native => ReconnectDecision::GiveUp { attempts },
            ReconnectPolicy::Backoff(policy) => {
                if attempts < policy.max_attempts {
                    let attempt = attempts + 1;
                    ReconnectDecision::Retry {
                        attempt,
                        delay: policy.delay_for(attempt),
                    }
                } else {
                    ReconnectDecision::GiveUp {
                        attempts: policy.max_attempts,
                    }
                }
            }
        }
    }
}

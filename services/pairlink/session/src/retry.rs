//! Reconnect backoff for sessions that lose their peer.
//!
//! Delays grow exponentially from `initial_delay` by `backoff_multiplier` per
//! attempt and are capped at `max_delay`. After `max_attempts` scheduled
//! retries the state disarms itself and stays disarmed until re-armed by an
//! explicit connect or by enabling automatic retry again.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Backoff parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Growth factor applied per attempt
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Retries scheduled before giving up
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay for the zero-based `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.max(1.0);
        // Past 64 doublings every practical policy has hit its cap
        let exponent = attempt.min(64) as i32;
        let secs = self.initial_delay.as_secs_f64() * multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs).min(self.max_delay)
    }
}

/// Result of asking for the next retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// A retry was scheduled
    Scheduled {
        /// One-based attempt number
        attempt: u32,
        /// Delay until the attempt
        delay: Duration,
    },
    /// The attempt budget is spent; retry is now disarmed
    Exhausted {
        /// Attempts made
        attempts: u32,
    },
    /// Retry is not armed
    Disarmed,
}

/// Attempt counter and deadline for the current session
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    attempt: u32,
    next_retry_at: Option<Instant>,
    should_retry: bool,
}

impl RetryState {
    /// Allow retries to be scheduled
    pub fn arm(&mut self) {
        self.should_retry = true;
    }

    /// Stop scheduling retries and reset the counters
    pub fn disarm(&mut self) {
        self.should_retry = false;
        self.reset();
    }

    /// Whether retries may be scheduled
    pub fn is_armed(&self) -> bool {
        self.should_retry
    }

    /// Zero the attempt counter and clear any deadline
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next_retry_at = None;
    }

    /// Attempts scheduled so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether a retry deadline is pending
    pub fn is_pending(&self) -> bool {
        self.next_retry_at.is_some()
    }

    /// Time left until the pending retry
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.next_retry_at
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Compute and record the next retry
    pub fn schedule(&mut self, policy: &RetryPolicy, now: Instant) -> RetryDecision {
        if !self.should_retry {
            return RetryDecision::Disarmed;
        }
        if self.attempt >= policy.max_attempts {
            warn!("Retry budget of {} attempts exhausted", policy.max_attempts);
            let attempts = self.attempt;
            self.should_retry = false;
            self.next_retry_at = None;
            return RetryDecision::Exhausted { attempts };
        }

        let delay = policy.delay_for(self.attempt);
        self.attempt += 1;
        self.next_retry_at = Some(now + delay);
        debug!("Retry {} scheduled in {:?}", self.attempt, delay);
        RetryDecision::Scheduled {
            attempt: self.attempt,
            delay,
        }
    }

    /// Clear the pending deadline (fired or cancelled)
    pub fn clear_deadline(&mut self) {
        self.next_retry_at = None;
    }
}

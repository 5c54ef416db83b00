//! # Retry
//!
//! Module providing a `RetryPolicy` struct to configure delivery retrying.
use std::time;

use chrono::{DateTime, Utc};

pub const DEFAULT_BACKOFF_LADDER: [time::Duration; 5] = [
    time::Duration::from_secs(60),
    time::Duration::from_secs(5 * 60),
    time::Duration::from_secs(30 * 60),
    time::Duration::from_secs(2 * 60 * 60),
    time::Duration::from_secs(12 * 60 * 60),
];

#[derive(Clone, Debug, PartialEq)]
/// A retry policy to determine retry parameters for a queued delivery.
pub struct RetryPolicy {
    /// Number of failed attempts after which an item is failed for good.
    pub max_attempts: i32,
    /// Delay before the next attempt, indexed by the number of attempts made so far.
    /// The last step repeats once attempts run past the end of the ladder.
    pub backoff_ladder: Vec<time::Duration>,
    /// Maximum number of items claimed by a single sweep.
    pub batch_size: u32,
    /// How long a claimed item stays hidden from other sweeps.
    pub claim_timeout: time::Duration,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(max_attempts: i32, backoff_ladder: Vec<time::Duration>) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(max_attempts, backoff_ladder)
    }

    /// Delay before retrying an item that has failed `attempts` times.
    /// If not `None`, `preferred_retry_interval` is respected as long as it falls between the
    /// ladder step and the longest step of the ladder.
    pub fn retry_interval(
        &self,
        attempts: i32,
        preferred_retry_interval: Option<time::Duration>,
    ) -> time::Duration {
        let Some(last) = self.backoff_ladder.last() else {
            return time::Duration::ZERO;
        };

        let index = usize::try_from(attempts.max(0))
            .unwrap_or(usize::MAX)
            .min(self.backoff_ladder.len() - 1);
        let candidate_interval = self.backoff_ladder[index];
        let maximum_interval = self.backoff_ladder.iter().max().unwrap_or(last);

        match preferred_retry_interval {
            Some(duration) if candidate_interval <= duration && duration <= *maximum_interval => {
                duration
            }
            _ => candidate_interval,
        }
    }

    /// The instant at which an item that has failed `attempts` times becomes due again.
    pub fn next_retry_at(
        &self,
        now: DateTime<Utc>,
        attempts: i32,
        preferred_retry_interval: Option<time::Duration>,
    ) -> DateTime<Utc> {
        now + to_chrono(self.retry_interval(attempts, preferred_retry_interval))
    }

    /// The instant until which an item claimed at `now` stays claimed.
    pub fn claim_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + to_chrono(self.claim_timeout)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

fn to_chrono(duration: time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub max_attempts: i32,
    pub backoff_ladder: Vec<time::Duration>,
    pub batch_size: u32,
    pub claim_timeout: time::Duration,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ladder: DEFAULT_BACKOFF_LADDER.to_vec(),
            batch_size: 10,
            claim_timeout: time::Duration::from_secs(5 * 60),
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(max_attempts: i32, backoff_ladder: Vec<time::Duration>) -> Self {
        Self {
            max_attempts,
            backoff_ladder,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn batch_size(mut self, batch_size: u32) -> RetryPolicyBuilder {
        self.batch_size = batch_size;
        self
    }

    pub fn claim_timeout(mut self, timeout: time::Duration) -> RetryPolicyBuilder {
        self.claim_timeout = timeout;
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_ladder: self.backoff_ladder.clone(),
            batch_size: self.batch_size,
            claim_timeout: self.claim_timeout,
        }
    }
}

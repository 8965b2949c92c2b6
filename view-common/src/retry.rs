//! # Retry
//!
//! Backoff used when a view job hits a transient store failure and goes back on the queue.
use std::time;

/// How long a failed view job waits before it becomes available again, and where it goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Factor applied to the interval for every attempt after the first.
    pub backoff_coefficient: u32,
    pub initial_interval: time::Duration,
    /// Upper bound for any single interval.
    pub maximum_interval: Option<time::Duration>,
    /// Queue to re-schedule into instead of the job's own queue.
    pub queue: Option<String>,
}

impl RetryPolicy {
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Interval to wait after the given (1-based) attempt failed.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let factor = self
            .backoff_coefficient
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        let candidate = self
            .initial_interval
            .checked_mul(factor)
            .unwrap_or(time::Duration::MAX);

        match self.maximum_interval {
            Some(maximum) => candidate.min(maximum),
            None => candidate,
        }
    }

    pub fn retry_queue<'s>(&'s self, current_queue: &'s str) -> &'s str {
        self.queue.as_deref().unwrap_or(current_queue)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

pub struct RetryPolicyBuilder {
    backoff_coefficient: u32,
    initial_interval: time::Duration,
    maximum_interval: Option<time::Duration>,
    queue: Option<String>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
            queue: None,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn queue(mut self, queue: &str) -> RetryPolicyBuilder {
        self.queue = Some(queue.to_owned());
        self
    }

    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            queue: self.queue.clone(),
        }
    }
}

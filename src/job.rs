//! Job definitions and retry strategies.
//!
//! The consumer loop looks up the job named in a message's metadata to decide
//! what happens after a failed dispatch. Applications usually keep their own
//! catalogue of jobs; [`JobRegistry`] is the seam, and [`JobMap`] a plain
//! map-backed implementation.

use std::{collections::HashMap, fmt::Debug, sync::Arc, time::Duration};

use crate::Envelope;

/// Decides whether a failed message gets another attempt, and after how long.
pub trait RetryStrategy: Debug + Send + Sync {
    /// Whether the message may be retried. Called with the envelope as it was
    /// delivered, so `_retries` holds the number of retries already spent.
    fn can_retry(&self, envelope: &Envelope) -> bool;

    /// Delay before the next attempt.
    fn retry_interval(&self, envelope: &Envelope) -> Duration;
}

/// Never retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryStrategy for NoRetry {
    fn can_retry(&self, _envelope: &Envelope) -> bool {
        false
    }

    fn retry_interval(&self, _envelope: &Envelope) -> Duration {
        Duration::ZERO
    }
}

/// Retry up to `limit` times with a constant delay.
#[derive(Debug, Clone, Copy)]
pub struct FixedRetry {
    limit: u32,
    interval: Duration,
}

impl FixedRetry {
    pub fn new(limit: u32, interval: Duration) -> Self {
        Self { limit, interval }
    }
}

impl RetryStrategy for FixedRetry {
    fn can_retry(&self, envelope: &Envelope) -> bool {
        retries(envelope) < self.limit
    }

    fn retry_interval(&self, _envelope: &Envelope) -> Duration {
        self.interval
    }
}

/// Retry up to `limit` times, doubling the delay after every attempt up to
/// `max_interval`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    limit: u32,
    initial_interval: Duration,
    max_interval: Duration,
}

impl ExponentialBackoff {
    pub fn new(limit: u32, initial_interval: Duration) -> Self {
        Self {
            limit,
            initial_interval,
            max_interval: Duration::from_secs(3600),
        }
    }

    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval;
        self
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn can_retry(&self, envelope: &Envelope) -> bool {
        retries(envelope) < self.limit
    }

    fn retry_interval(&self, envelope: &Envelope) -> Duration {
        let factor = 2u32.checked_pow(retries(envelope)).unwrap_or(u32::MAX);
        self.initial_interval
            .checked_mul(factor)
            .map_or(self.max_interval, |interval| interval.min(self.max_interval))
    }
}

// An unreadable counter counts as exhausted.
fn retries(envelope: &Envelope) -> u32 {
    envelope.metadata.retries().unwrap_or(u32::MAX)
}

/// A registered job.
#[derive(Debug, Clone)]
pub struct JobDefinition {
    strategy: Arc<dyn RetryStrategy>,
}

impl JobDefinition {
    pub fn new(strategy: impl RetryStrategy + 'static) -> Self {
        Self {
            strategy: Arc::new(strategy),
        }
    }

    pub fn strategy(&self) -> &dyn RetryStrategy {
        self.strategy.as_ref()
    }
}

/// Lookup of job definitions by name.
pub trait JobRegistry: Send + Sync {
    fn get(&self, job: &str) -> Option<&JobDefinition>;

    fn has(&self, job: &str) -> bool {
        self.get(job).is_some()
    }
}

impl<T: JobRegistry + ?Sized> JobRegistry for Arc<T> {
    fn get(&self, job: &str) -> Option<&JobDefinition> {
        (**self).get(job)
    }
}

/// Map-backed [`JobRegistry`].
#[derive(Debug, Clone, Default)]
pub struct JobMap {
    jobs: HashMap<String, JobDefinition>,
}

impl JobMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job, replacing any previous definition with the same name.
    pub fn with_job(mut self, name: impl Into<String>, definition: JobDefinition) -> Self {
        self.jobs.insert(name.into(), definition);
        self
    }
}

impl JobRegistry for JobMap {
    fn get(&self, job: &str) -> Option<&JobDefinition> {
        self.jobs.get(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Message, Metadata};

    fn envelope_with_retries(retries: u32) -> Envelope {
        Envelope::new(
            Message::new("SendEmail"),
            Metadata::new().with("_retries", retries),
        )
    }

    #[test]
    fn fixed_retry_stops_at_the_limit() {
        let strategy = FixedRetry::new(3, Duration::from_secs(1));

        assert!(strategy.can_retry(&envelope_with_retries(0)));
        assert!(strategy.can_retry(&envelope_with_retries(2)));
        assert!(!strategy.can_retry(&envelope_with_retries(3)));
        assert_eq!(
            strategy.retry_interval(&envelope_with_retries(2)),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let strategy = ExponentialBackoff::new(10, Duration::from_millis(500))
            .with_max_interval(Duration::from_secs(3));

        assert_eq!(
            strategy.retry_interval(&envelope_with_retries(0)),
            Duration::from_millis(500)
        );
        assert_eq!(
            strategy.retry_interval(&envelope_with_retries(2)),
            Duration::from_secs(2)
        );
        assert_eq!(
            strategy.retry_interval(&envelope_with_retries(3)),
            Duration::from_secs(3)
        );
        assert_eq!(
            strategy.retry_interval(&envelope_with_retries(40)),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn unreadable_counter_is_not_retried() {
        let envelope = Envelope::new(
            Message::new("SendEmail"),
            Metadata::new().with("_retries", "many"),
        );

        assert!(!FixedRetry::new(3, Duration::ZERO).can_retry(&envelope));
    }

    #[test]
    fn job_map_lookup() {
        let jobs = JobMap::new().with_job("email.send", JobDefinition::new(NoRetry));

        assert!(jobs.has("email.send"));
        assert!(!jobs.has("email.receive"));
        assert!(!jobs
            .get("email.send")
            .unwrap()
            .strategy()
            .can_retry(&envelope_with_retries(0)));
    }
}

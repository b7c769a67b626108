//! Hand-off of scan results to the durable job queue.
//!
//! | Publisher | Target |
//! |-----------|--------|
//! | [`AmqpPublisher`] | Durable AMQP queue with publisher confirms |
//! | [`MemoryPublisher`] | In-process list |
//!
//! [`RetryingPublisher`] wraps any of them with bounded exponential backoff so
//! that a brief broker outage costs a few seconds instead of a lost result.

mod amqp;

pub use amqp::AmqpPublisher;

use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

use crate::error::PublishError;
use crate::model::ScanResult;
use crate::retry::RetryPolicy;

/// Destination for completed scan results.
#[async_trait]
pub trait JobPublisher: Send + Sync {
    /// Returns the human-readable name of this publisher.
    fn name(&self) -> &'static str;

    /// Publishes one result. Returns once the broker has accepted it.
    async fn publish(&self, result: &ScanResult) -> Result<(), PublishError>;
}

/// Retries a wrapped publisher according to a [`RetryPolicy`].
///
/// Only the final failure is returned; intermediate ones are logged.
pub struct RetryingPublisher<P> {
    inner: P,
    policy: RetryPolicy,
}

impl<P: JobPublisher> RetryingPublisher<P> {
    pub fn new(inner: P, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}

#[async_trait]
impl<P: JobPublisher> JobPublisher for RetryingPublisher<P> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn publish(&self, result: &ScanResult) -> Result<(), PublishError> {
        let mut attempt = 1;
        loop {
            match self.inner.publish(result).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= self.policy.max_attempts => return Err(err),
                Err(err) => {
                    let delay = self.policy.delay_after(attempt);
                    warn!(
                        digest = %result.digest,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        retry_in = ?delay,
                        error = %err,
                        "publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Publisher that keeps results in memory.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    published: Mutex<Vec<ScanResult>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Results published so far, in publish order.
    pub fn published(&self) -> Vec<ScanResult> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ScanResult>> {
        self.published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl JobPublisher for MemoryPublisher {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, result: &ScanResult) -> Result<(), PublishError> {
        self.lock().push(result.clone());
        Ok(())
    }
}

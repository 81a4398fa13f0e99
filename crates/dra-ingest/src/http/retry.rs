//! Classification-based retry with capped exponential backoff

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RetryConfig;
use crate::error::{IngestError, IngestResult};

/// Decides whether an error is worth another attempt
pub type RetryClassifier = fn(&IngestError) -> bool;

/// Outcome of classifying one failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    fn stop() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    classifier: RetryClassifier,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            classifier: IngestError::is_transient,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay(), config.max_delay())
    }

    pub fn with_classifier(mut self, classifier: RetryClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the `attempt`-th failure (1-based): base, 2×base, 4×base, ...
    /// capped at the maximum delay.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    pub fn decide(&self, attempt: u32, err: &IngestError) -> RetryDecision {
        if attempt >= self.max_attempts || !(self.classifier)(err) {
            return RetryDecision::stop();
        }
        RetryDecision {
            retry: true,
            delay: self.backoff(attempt),
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt cap is reached. The last error is returned unchanged.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<F, Fut, T>(&self, cancel: &CancellationToken, mut op: F) -> IngestResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = IngestResult<T>>,
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }

            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let decision = self.decide(attempt, &err);
            if !decision.retry {
                return Err(err);
            }

            debug!(
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = decision.delay.as_millis() as u64,
                error = %err,
                "Retryable failure, backing off"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                _ = tokio::time::sleep(decision.delay) => {}
            }
            attempt += 1;
        }
    }
}

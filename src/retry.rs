//! Bounded retry loop over an operation.
//!
//! Failures go through the [`Classifier`]; only retryable `Inner` errors are
//! tried again, with backoff and jitter between attempts. Runtime-raised
//! errors (admission rejections, cancellation) pass through untouched.

use crate::backoff::Backoff;
use crate::classifier::{Classifier, ErrorTag, FailureKind};
use crate::error::{ConfigError, ResilienceError, MAX_RETRY_FAILURES};
use crate::events::{EventBus, RetryEvent, RuntimeEvent};
use crate::sleeper::{sleep_cancellable, Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Retry loop with bounded attempts, classification, and backoff.
#[derive(Debug, Clone)]
pub struct RetryEngine {
    max_attempts: usize,
    backoff: Backoff,
    classifier: Classifier,
    sleeper: Arc<dyn Sleeper>,
    bus: EventBus,
}

impl RetryEngine {
    pub fn builder() -> RetryEngineBuilder {
        RetryEngineBuilder::new()
    }

    /// Run `operation` without an external cancellation context.
    pub async fn run<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: ErrorTag + std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.run_with_cancel(operation, &CancellationToken::new()).await
    }

    /// Run `operation`, aborting immediately if `cancel` fires.
    ///
    /// The operation is invoked at least once and at most `max_attempts`
    /// times; cancellation is never counted as an attempt failure.
    pub async fn run_with_cancel<T, E, Fut, Op>(
        &self,
        mut operation: Op,
        cancel: &CancellationToken,
    ) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: ErrorTag + std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut failures = Vec::new();

        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return Err(ResilienceError::Cancelled);
            }

            match operation().await {
                Ok(value) => return Ok(value),
                Err(ResilienceError::Inner(e)) => {
                    if self.classifier.classify(&e) == FailureKind::NonRetryable {
                        return Err(ResilienceError::Inner(e));
                    }

                    failures.push(e);
                    if failures.len() > MAX_RETRY_FAILURES {
                        let excess = failures.len() - MAX_RETRY_FAILURES;
                        failures.drain(0..excess);
                    }

                    if attempt == self.max_attempts {
                        self.bus.emit(RuntimeEvent::Retry(RetryEvent::Exhausted {
                            attempts: self.max_attempts,
                        }));
                        return Err(ResilienceError::RetryExhausted {
                            attempts: self.max_attempts,
                            failures,
                        });
                    }

                    let delay = self.backoff.delay(attempt as u32);
                    tracing::debug!(attempt, ?delay, "attempt failed, backing off");
                    self.bus.emit(RuntimeEvent::Retry(RetryEvent::Backoff { attempt, delay }));

                    if !sleep_cancellable(self.sleeper.as_ref(), delay, cancel).await {
                        return Err(ResilienceError::Cancelled);
                    }
                }
                // Admission and other runtime errors are not retried.
                Err(e) => return Err(e),
            }
        }

        unreachable!("retry loop returns before exhausting the attempt range")
    }
}

pub struct RetryEngineBuilder {
    max_attempts: usize,
    backoff: Backoff,
    classifier: Classifier,
    sleeper: Arc<dyn Sleeper>,
    bus: EventBus,
}

impl RetryEngineBuilder {
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::exponential(Duration::from_secs(1), Duration::from_secs(30))
                .expect("default backoff is valid"),
            classifier: Classifier::none(),
            sleeper: Arc::new(TokioSleeper),
            bus: EventBus::default(),
        }
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn build(self) -> Result<RetryEngine, ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidThreshold { field: "max_attempts", value: 0 });
        }
        Ok(RetryEngine {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            classifier: self.classifier,
            sleeper: self.sleeper,
            bus: self.bus,
        })
    }
}

impl Default for RetryEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

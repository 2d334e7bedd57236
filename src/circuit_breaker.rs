//! Circuit breaker: a three-state admission gate around an arbitrary operation.
//!
//! CLOSED admits everything and counts failures (successes decay the count by
//! one). Tripping requires both the failure threshold and a minimum number of
//! requests in the current monitoring window, so low-traffic services don't
//! trip on a handful of stale failures. OPEN rejects until the recovery
//! timeout, then a bounded HALF_OPEN trial decides between reopening and
//! closing.

use crate::clock::{Clock, MonotonicClock};
use crate::error::{ConfigError, ResilienceError};
use crate::events::{BreakerEvent, EventBus, RuntimeEvent};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tuning; validated at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive-ish failure count (decayed by successes) that arms the trip.
    pub failure_threshold: u32,
    /// How long OPEN rejects before allowing a half-open trial.
    pub recovery_timeout: Duration,
    /// Width of the request-counting window backing the throughput gate.
    pub monitoring_period: Duration,
    /// Admissions allowed within one half-open trial window.
    pub half_open_max_calls: u32,
    /// Requests that must be observed in the window before a trip is allowed.
    pub minimum_throughput: u32,
}

impl BreakerConfig {
    /// Config with the given threshold and recovery timeout; the remaining
    /// knobs start at permissive defaults (60s window, 1 trial call,
    /// throughput gate of 1).
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            monitoring_period: Duration::from_secs(60),
            half_open_max_calls: 1,
            minimum_throughput: 1,
        }
    }

    pub fn with_monitoring_period(mut self, period: Duration) -> Self {
        self.monitoring_period = period;
        self
    }

    pub fn with_half_open_max_calls(mut self, max_calls: u32) -> Self {
        self.half_open_max_calls = max_calls;
        self
    }

    pub fn with_minimum_throughput(mut self, minimum: u32) -> Self {
        self.minimum_throughput = minimum;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidThreshold {
                field: "failure_threshold",
                value: self.failure_threshold as u64,
            });
        }
        if self.half_open_max_calls == 0 {
            return Err(ConfigError::InvalidThreshold {
                field: "half_open_max_calls",
                value: self.half_open_max_calls as u64,
            });
        }
        if self.minimum_throughput == 0 {
            return Err(ConfigError::InvalidThreshold {
                field: "minimum_throughput",
                value: self.minimum_throughput as u64,
            });
        }
        if self.recovery_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "recovery_timeout" });
        }
        if self.monitoring_period.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "monitoring_period" });
        }
        Ok(())
    }
}

/// Read-only snapshot of a breaker's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub requests_in_window: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_admitted: u32,
    requests_in_window: u32,
    window_started_millis: u64,
    last_failure_millis: u64,
}

/// Three-state circuit breaker.
///
/// All transitions are serialized behind one mutex; the admission decision is
/// immediate and the lock is never held across the guarded operation.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    clock: Arc<dyn Clock>,
    bus: EventBus,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_admitted: 0,
                requests_in_window: 0,
                window_started_millis: 0,
                last_failure_millis: 0,
            }),
            config,
            clock: Arc::new(MonotonicClock::default()),
            bus: EventBus::default(),
        })
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Publish transition events on the given bus.
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn status(&self) -> BreakerStatus {
        let inner = self.inner.lock().unwrap();
        BreakerStatus {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            requests_in_window: inner.requests_in_window,
        }
    }

    /// Operator override: force the breaker back to CLOSED and zero counters.
    pub fn reset(&self) {
        let was = {
            let mut inner = self.inner.lock().unwrap();
            let was = inner.state;
            inner.state = CircuitState::Closed;
            inner.failure_count = 0;
            inner.success_count = 0;
            inner.half_open_admitted = 0;
            inner.requests_in_window = 0;
            was
        };
        if was != CircuitState::Closed {
            tracing::info!(breaker = %self.name, "circuit breaker reset to closed");
            self.bus.emit(RuntimeEvent::CircuitBreaker {
                name: self.name.clone(),
                event: BreakerEvent::Closed,
            });
        }
    }

    /// Run `operation` if the breaker admits it.
    ///
    /// Only `Inner` errors count as failures; admission errors and
    /// `Cancelled` are surfaced without touching the counters.
    pub async fn execute<T, E, Fut, Op>(&self, mut operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.admit()?;

        let result = operation().await;

        match &result {
            Ok(_) => self.on_success(),
            Err(e) if e.is_inner() => self.on_failure(),
            Err(_) => {}
        }

        result
    }

    fn admit<E>(&self) -> Result<(), ResilienceError<E>> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap();

        // Window rotation resets the request count and nothing else.
        if now.saturating_sub(inner.window_started_millis)
            >= self.config.monitoring_period.as_millis() as u64
        {
            inner.window_started_millis = now;
            inner.requests_in_window = 0;
        }

        match inner.state {
            CircuitState::Closed => {
                inner.requests_in_window += 1;
                Ok(())
            }
            CircuitState::Open => {
                let elapsed = now.saturating_sub(inner.last_failure_millis);
                if elapsed >= self.config.recovery_timeout.as_millis() as u64 {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_admitted = 1;
                    inner.success_count = 0;
                    inner.requests_in_window += 1;
                    drop(inner);
                    tracing::warn!(breaker = %self.name, "circuit breaker entering half-open trial");
                    self.bus.emit(RuntimeEvent::CircuitBreaker {
                        name: self.name.clone(),
                        event: BreakerEvent::HalfOpen,
                    });
                    Ok(())
                } else {
                    Err(ResilienceError::CircuitOpen {
                        failure_count: inner.failure_count,
                        open_for: Duration::from_millis(elapsed),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_admitted >= self.config.half_open_max_calls {
                    Err(ResilienceError::HalfOpenExceeded {
                        max_calls: self.config.half_open_max_calls,
                    })
                } else {
                    inner.half_open_admitted += 1;
                    inner.requests_in_window += 1;
                    Ok(())
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.half_open_max_calls {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.half_open_admitted = 0;
                    drop(inner);
                    tracing::info!(breaker = %self.name, "circuit breaker closed");
                    self.bus.emit(RuntimeEvent::CircuitBreaker {
                        name: self.name.clone(),
                        event: BreakerEvent::Closed,
                    });
                }
            }
            CircuitState::Closed => {
                inner.failure_count = inner.failure_count.saturating_sub(1);
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.failure_count += 1;
                inner.last_failure_millis = now;
                let failures = inner.failure_count;
                drop(inner);
                tracing::warn!(
                    breaker = %self.name,
                    failures,
                    "half-open trial failed, circuit breaker reopened"
                );
                self.bus.emit(RuntimeEvent::CircuitBreaker {
                    name: self.name.clone(),
                    event: BreakerEvent::Opened { failure_count: failures },
                });
            }
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold
                    && inner.requests_in_window >= self.config.minimum_throughput
                {
                    inner.state = CircuitState::Open;
                    inner.last_failure_millis = now;
                    let failures = inner.failure_count;
                    drop(inner);
                    tracing::error!(
                        breaker = %self.name,
                        failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker opened"
                    );
                    self.bus.emit(RuntimeEvent::CircuitBreaker {
                        name: self.name.clone(),
                        event: BreakerEvent::Opened { failure_count: failures },
                    });
                }
            }
            CircuitState::Open => {}
        }
    }
}

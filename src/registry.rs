//! Named creation and teardown of runtime components.
//!
//! The registry is the lifecycle owner: every background task (probe loops,
//! ack timers, sink pumps) hangs off its cancellation tree, so `shutdown`
//! cancels everything and drops the state in one motion. Creation is
//! idempotent by name; re-registration with a different config is refused.

use crate::circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use crate::clock::{Clock, MonotonicClock};
use crate::delivery::{DeliveryConfig, DeliveryStream};
use crate::error::ConfigError;
use crate::events::EventBus;
use crate::health::{HealthCheckConfig, HealthMonitor, Probe};
use crate::sinks::{pump, EventSink};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Named lookup and lifecycle owner for breakers, streams, and probes.
pub struct Registry {
    bus: EventBus,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    streams: Mutex<HashMap<String, DeliveryStream>>,
    monitor: HealthMonitor,
    pumps: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_event_bus(EventBus::default())
    }

    pub fn with_event_bus(bus: EventBus) -> Self {
        let cancel = CancellationToken::new();
        let monitor = HealthMonitor::new()
            .with_event_bus(bus.clone())
            .with_cancellation(cancel.child_token());
        Self {
            bus,
            clock: Arc::new(MonotonicClock::default()),
            cancel,
            breakers: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            monitor,
            pumps: Mutex::new(Vec::new()),
        }
    }

    /// Override the clock handed to created components (useful for tests).
    ///
    /// Call before registering anything; the health monitor is rebuilt.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock.clone();
        self.monitor = HealthMonitor::new()
            .with_clock(clock)
            .with_event_bus(self.bus.clone())
            .with_cancellation(self.cancel.child_token());
        self
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// The registry-owned health monitor.
    pub fn health(&self) -> &HealthMonitor {
        &self.monitor
    }

    /// Get or create a named breaker.
    ///
    /// Idempotent for an equal config; a differing config is refused.
    pub fn breaker(
        &self,
        name: &str,
        config: BreakerConfig,
    ) -> Result<Arc<CircuitBreaker>, ConfigError> {
        let mut breakers = self.breakers.lock().unwrap();
        if let Some(existing) = breakers.get(name) {
            if existing.config() == &config {
                return Ok(existing.clone());
            }
            return Err(ConfigError::ConflictingRegistration { name: name.to_string() });
        }
        let breaker = Arc::new(
            CircuitBreaker::new(name, config)?
                .with_clock(self.clock.clone())
                .with_event_bus(self.bus.clone()),
        );
        breakers.insert(name.to_string(), breaker.clone());
        Ok(breaker)
    }

    /// Get or create a named delivery stream.
    pub fn stream(
        &self,
        name: &str,
        config: DeliveryConfig,
    ) -> Result<DeliveryStream, ConfigError> {
        let mut streams = self.streams.lock().unwrap();
        if let Some(existing) = streams.get(name) {
            if existing.config() == &config {
                return Ok(existing.clone());
            }
            return Err(ConfigError::ConflictingRegistration { name: name.to_string() });
        }
        let stream = DeliveryStream::builder(name, config)
            .with_event_bus(self.bus.clone())
            .with_cancellation(self.cancel.child_token())
            .build()?;
        streams.insert(name.to_string(), stream.clone());
        Ok(stream)
    }

    /// Register a health probe target; its loop starts immediately.
    pub fn probe<P>(
        &self,
        name: &str,
        probe: P,
        config: HealthCheckConfig,
    ) -> Result<(), ConfigError>
    where
        P: Probe + 'static,
    {
        self.monitor.register(name, probe, config)
    }

    /// Route all runtime events into `sink` until shutdown.
    pub fn attach_sink<S>(&self, sink: S)
    where
        S: EventSink,
        S::Future: Send + 'static,
    {
        let handle = pump(self.bus.subscribe(), sink, self.cancel.child_token());
        self.pumps.lock().unwrap().push(handle);
    }

    /// Sorted `(name, state)` view of every registered breaker.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let breakers = self.breakers.lock().unwrap();
        let mut entries: Vec<(String, CircuitState)> =
            breakers.iter().map(|(name, b)| (name.clone(), b.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Force a named breaker back to CLOSED. Returns whether it existed.
    pub fn reset_breaker(&self, name: &str) -> bool {
        let breaker = self.breakers.lock().unwrap().get(name).cloned();
        match breaker {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Cancel every owned timer and drop all component state.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.monitor.stop();

        let streams: Vec<DeliveryStream> = {
            let mut streams = self.streams.lock().unwrap();
            streams.drain().map(|(_, stream)| stream).collect()
        };
        for stream in streams {
            stream.close();
        }

        self.breakers.lock().unwrap().clear();

        let mut pumps = self.pumps.lock().unwrap();
        for handle in pumps.drain(..) {
            handle.abort();
        }
        tracing::info!("registry shut down");
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! Periodic liveness probes with hysteresis.
//!
//! Each registered target gets its own probe loop: probes for distinct targets
//! run concurrently, probes for the same target never overlap (a slow probe
//! defers the next tick). Status flips only after the configured number of
//! consecutive opposite outcomes.

use crate::clock::{Clock, MonotonicClock};
use crate::error::ConfigError;
use crate::events::{EventBus, HealthEvent, RuntimeEvent};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Error payload a probe may attach to a not-ok result.
pub type ProbeError = Box<dyn std::error::Error + Send + Sync>;

/// A cancellable liveness check; ok / not-ok with an optional error payload.
pub trait Probe: Send + Sync {
    fn check(&self) -> BoxFuture<'_, Result<(), ProbeError>>;
}

impl<F, Fut> Probe for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ProbeError>> + Send + 'static,
{
    fn check(&self) -> BoxFuture<'_, Result<(), ProbeError>> {
        Box::pin(self())
    }
}

/// Per-target probe tuning; validated at registration.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckConfig {
    /// Per-probe deadline; an overrun counts as a failure and the probe is dropped.
    pub timeout: Duration,
    /// Tick between probe starts for this target.
    pub interval: Duration,
    /// Consecutive successes required for UNHEALTHY → HEALTHY.
    pub healthy_threshold: u32,
    /// Consecutive failures required for HEALTHY → UNHEALTHY.
    pub unhealthy_threshold: u32,
}

impl HealthCheckConfig {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval, healthy_threshold: 2, unhealthy_threshold: 3 }
    }

    pub fn with_healthy_threshold(mut self, threshold: u32) -> Self {
        self.healthy_threshold = threshold;
        self
    }

    pub fn with_unhealthy_threshold(mut self, threshold: u32) -> Self {
        self.unhealthy_threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "probe_timeout" });
        }
        if self.interval.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "probe_interval" });
        }
        if self.healthy_threshold == 0 {
            return Err(ConfigError::InvalidThreshold {
                field: "healthy_threshold",
                value: self.healthy_threshold as u64,
            });
        }
        if self.unhealthy_threshold == 0 {
            return Err(ConfigError::InvalidThreshold {
                field: "unhealthy_threshold",
                value: self.unhealthy_threshold as u64,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Three-valued summary across all targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Read-only view of a target's probe history.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_probe_millis: Option<u64>,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct TargetState {
    status: HealthStatus,
    consecutive_successes: u32,
    consecutive_failures: u32,
    last_probe_millis: Option<u64>,
    last_error: Option<String>,
}

struct Target {
    name: String,
    probe: Arc<dyn Probe>,
    config: HealthCheckConfig,
    state: Mutex<TargetState>,
}

/// Runs registered probes on their intervals and aggregates their statuses.
pub struct HealthMonitor {
    targets: Mutex<HashMap<String, Arc<Target>>>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    cancel: CancellationToken,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            targets: Mutex::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
            clock: Arc::new(MonotonicClock::default()),
            bus: EventBus::default(),
            cancel: CancellationToken::new(),
        }
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

    /// Tie all probe loops to an external cancellation tree.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Register a target and start its probe loop.
    ///
    /// Registration is idempotent by name; a second registration with a
    /// different config is a configuration error.
    pub fn register<P>(
        &self,
        name: impl Into<String>,
        probe: P,
        config: HealthCheckConfig,
    ) -> Result<(), ConfigError>
    where
        P: Probe + 'static,
    {
        config.validate()?;
        let name = name.into();

        let mut targets = self.targets.lock().unwrap();
        if let Some(existing) = targets.get(&name) {
            if existing.config == config {
                return Ok(());
            }
            return Err(ConfigError::ConflictingRegistration { name });
        }

        let target = Arc::new(Target {
            name: name.clone(),
            probe: Arc::new(probe),
            config,
            state: Mutex::new(TargetState {
                status: HealthStatus::Healthy,
                consecutive_successes: 0,
                consecutive_failures: 0,
                last_probe_millis: None,
                last_error: None,
            }),
        });
        targets.insert(name, target.clone());
        drop(targets);

        let clock = self.clock.clone();
        let bus = self.bus.clone();
        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(target.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        probe_target(&target, clock.as_ref(), &bus).await;
                    }
                }
            }
        });
        self.handles.lock().unwrap().push(handle);
        Ok(())
    }

    /// Run one probe cycle for a target right now. Returns false for unknown names.
    pub async fn probe_now(&self, name: &str) -> bool {
        let target = self.targets.lock().unwrap().get(name).cloned();
        match target {
            Some(target) => {
                probe_target(&target, self.clock.as_ref(), &self.bus).await;
                true
            }
            None => false,
        }
    }

    /// Snapshot of a single target.
    pub fn snapshot(&self, name: &str) -> Option<HealthSnapshot> {
        let targets = self.targets.lock().unwrap();
        targets.get(name).map(|target| {
            let state = target.state.lock().unwrap();
            HealthSnapshot {
                status: state.status,
                consecutive_successes: state.consecutive_successes,
                consecutive_failures: state.consecutive_failures,
                last_probe_millis: state.last_probe_millis,
                last_error: state.last_error.clone(),
            }
        })
    }

    /// Status of every registered target.
    pub fn statuses(&self) -> HashMap<String, HealthStatus> {
        let targets = self.targets.lock().unwrap();
        targets
            .iter()
            .map(|(name, target)| (name.clone(), target.state.lock().unwrap().status))
            .collect()
    }

    /// Three-valued rollup: healthy iff no target is unhealthy; unhealthy
    /// when the unhealthy targets are at least as many as the healthy ones.
    pub fn aggregate(&self) -> OverallHealth {
        let statuses = self.statuses();
        let unhealthy =
            statuses.values().filter(|s| **s == HealthStatus::Unhealthy).count();
        let healthy = statuses.len() - unhealthy;

        if unhealthy == 0 {
            OverallHealth::Healthy
        } else if unhealthy >= healthy {
            OverallHealth::Unhealthy
        } else {
            OverallHealth::Degraded
        }
    }

    /// Cancel every probe loop. Target snapshots remain readable.
    pub fn stop(&self) {
        self.cancel.cancel();
        let mut handles = self.handles.lock().unwrap();
        for handle in handles.drain(..) {
            handle.abort();
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn probe_target(target: &Target, clock: &dyn Clock, bus: &EventBus) {
    let outcome = tokio::time::timeout(target.config.timeout, target.probe.check()).await;
    let (success, error) = match outcome {
        Ok(Ok(())) => (true, None),
        Ok(Err(e)) => (false, Some(e.to_string())),
        // The in-flight probe future is dropped here; overruns count as failures.
        Err(_) => (false, Some(format!("probe timed out after {:?}", target.config.timeout))),
    };

    let now = clock.now_millis();
    let mut state = target.state.lock().unwrap();
    state.last_probe_millis = Some(now);

    if success {
        state.consecutive_successes += 1;
        state.consecutive_failures = 0;
        state.last_error = None;
        if state.status == HealthStatus::Unhealthy
            && state.consecutive_successes >= target.config.healthy_threshold
        {
            state.status = HealthStatus::Healthy;
            let successes = state.consecutive_successes;
            drop(state);
            tracing::info!(target = %target.name, successes, "health target recovered");
            bus.emit(RuntimeEvent::Health {
                target: target.name.clone(),
                event: HealthEvent::Recovered { consecutive_successes: successes },
            });
        }
    } else {
        state.consecutive_failures += 1;
        state.consecutive_successes = 0;
        state.last_error = error;
        if state.status == HealthStatus::Healthy
            && state.consecutive_failures >= target.config.unhealthy_threshold
        {
            state.status = HealthStatus::Unhealthy;
            let failures = state.consecutive_failures;
            let last_error = state.last_error.clone();
            drop(state);
            tracing::warn!(
                target = %target.name,
                failures,
                ?last_error,
                "health target became unhealthy"
            );
            bus.emit(RuntimeEvent::Health {
                target: target.name.clone(),
                event: HealthEvent::BecameUnhealthy { consecutive_failures: failures },
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn config() -> HealthCheckConfig {
        HealthCheckConfig::new(Duration::from_millis(100), Duration::from_secs(60))
            .with_healthy_threshold(2)
            .with_unhealthy_threshold(3)
    }

    fn flag_probe(ok: Arc<AtomicBool>) -> impl Probe {
        move || {
            let ok = ok.clone();
            async move {
                if ok.load(Ordering::SeqCst) {
                    Ok(())
                } else {
                    Err::<(), ProbeError>("dependency refused".into())
                }
            }
        }
    }

    #[tokio::test]
    async fn targets_start_healthy() {
        let monitor = HealthMonitor::new();
        monitor.register("db", flag_probe(Arc::new(AtomicBool::new(true))), config()).unwrap();

        let snapshot = monitor.snapshot("db").unwrap();
        assert_eq!(snapshot.status, HealthStatus::Healthy);
        assert_eq!(snapshot.consecutive_failures, 0);
        monitor.stop();
    }

    #[tokio::test]
    async fn hysteresis_flips_after_consecutive_failures_then_recovers() {
        let monitor = HealthMonitor::new();
        let ok = Arc::new(AtomicBool::new(false));
        monitor.register("db", flag_probe(ok.clone()), config()).unwrap();

        // Two failures are not enough to flip with a threshold of three.
        monitor.probe_now("db").await;
        monitor.probe_now("db").await;
        assert_eq!(monitor.snapshot("db").unwrap().status, HealthStatus::Healthy);

        monitor.probe_now("db").await;
        let snapshot = monitor.snapshot("db").unwrap();
        assert_eq!(snapshot.status, HealthStatus::Unhealthy);
        assert_eq!(snapshot.consecutive_failures, 3);
        assert!(snapshot.last_error.is_some());

        // One success is not enough to recover with a threshold of two.
        ok.store(true, Ordering::SeqCst);
        monitor.probe_now("db").await;
        assert_eq!(monitor.snapshot("db").unwrap().status, HealthStatus::Unhealthy);

        monitor.probe_now("db").await;
        let snapshot = monitor.snapshot("db").unwrap();
        assert_eq!(snapshot.status, HealthStatus::Healthy);
        assert_eq!(snapshot.consecutive_successes, 2);
        assert_eq!(snapshot.last_error, None);
        monitor.stop();
    }

    #[tokio::test]
    async fn a_success_resets_the_failure_streak() {
        let monitor = HealthMonitor::new();
        let ok = Arc::new(AtomicBool::new(false));
        monitor.register("db", flag_probe(ok.clone()), config()).unwrap();

        monitor.probe_now("db").await;
        monitor.probe_now("db").await;
        ok.store(true, Ordering::SeqCst);
        monitor.probe_now("db").await;
        ok.store(false, Ordering::SeqCst);
        monitor.probe_now("db").await;
        monitor.probe_now("db").await;

        // Streak was broken; still two consecutive failures, still healthy.
        let snapshot = monitor.snapshot("db").unwrap();
        assert_eq!(snapshot.status, HealthStatus::Healthy);
        assert_eq!(snapshot.consecutive_failures, 2);
        monitor.stop();
    }

    #[tokio::test]
    async fn slow_probes_count_as_failures() {
        let monitor = HealthMonitor::new();
        let probe_config =
            HealthCheckConfig::new(Duration::from_millis(10), Duration::from_secs(60))
                .with_unhealthy_threshold(1);
        monitor
            .register(
                "slow",
                || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<(), ProbeError>(())
                },
                probe_config,
            )
            .unwrap();

        monitor.probe_now("slow").await;
        let snapshot = monitor.snapshot("slow").unwrap();
        assert_eq!(snapshot.status, HealthStatus::Unhealthy);
        assert!(snapshot.last_error.unwrap().contains("timed out"));
        monitor.stop();
    }

    #[tokio::test]
    async fn aggregate_rolls_up_three_values() {
        let monitor = HealthMonitor::new();
        assert_eq!(monitor.aggregate(), OverallHealth::Healthy);

        let ok_a = Arc::new(AtomicBool::new(true));
        let ok_b = Arc::new(AtomicBool::new(true));
        let ok_c = Arc::new(AtomicBool::new(true));
        let fast_flip = config().with_unhealthy_threshold(1);
        monitor.register("a", flag_probe(ok_a.clone()), fast_flip.clone()).unwrap();
        monitor.register("b", flag_probe(ok_b.clone()), fast_flip.clone()).unwrap();
        monitor.register("c", flag_probe(ok_c.clone()), fast_flip.clone()).unwrap();
        assert_eq!(monitor.aggregate(), OverallHealth::Healthy);

        ok_a.store(false, Ordering::SeqCst);
        monitor.probe_now("a").await;
        assert_eq!(monitor.aggregate(), OverallHealth::Degraded);

        ok_b.store(false, Ordering::SeqCst);
        monitor.probe_now("b").await;
        assert_eq!(monitor.aggregate(), OverallHealth::Unhealthy);
        monitor.stop();
    }

    #[tokio::test]
    async fn transition_events_are_published() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let monitor = HealthMonitor::new().with_event_bus(bus);
        let ok = Arc::new(AtomicBool::new(false));
        monitor
            .register("db", flag_probe(ok.clone()), config().with_unhealthy_threshold(1))
            .unwrap();

        monitor.probe_now("db").await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            RuntimeEvent::Health { event: HealthEvent::BecameUnhealthy { .. }, .. }
        ));

        ok.store(true, Ordering::SeqCst);
        monitor.probe_now("db").await;
        monitor.probe_now("db").await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            RuntimeEvent::Health { event: HealthEvent::Recovered { .. }, .. }
        ));
        monitor.stop();
    }

    #[tokio::test]
    async fn probe_loop_runs_on_its_interval_until_stopped() {
        let monitor = HealthMonitor::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let probe_config =
            HealthCheckConfig::new(Duration::from_millis(100), Duration::from_millis(20));
        monitor
            .register(
                "ticker",
                move || {
                    let count = count_clone.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), ProbeError>(())
                    }
                },
                probe_config,
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(110)).await;
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected at least 2 probes, saw {seen}");

        monitor.stop();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let frozen = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), frozen);
    }

    #[tokio::test]
    async fn re_registration_is_idempotent_only_for_equal_configs() {
        let monitor = HealthMonitor::new();
        let ok = Arc::new(AtomicBool::new(true));
        monitor.register("db", flag_probe(ok.clone()), config()).unwrap();
        monitor.register("db", flag_probe(ok.clone()), config()).unwrap();

        let err = monitor
            .register("db", flag_probe(ok), config().with_unhealthy_threshold(9))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ConflictingRegistration { .. }));
        monitor.stop();
    }

    #[test]
    fn config_validation_rejects_zeroes() {
        let bad = HealthCheckConfig::new(Duration::ZERO, Duration::from_secs(1));
        assert!(bad.validate().is_err());

        let bad = HealthCheckConfig::new(Duration::from_secs(1), Duration::from_secs(1))
            .with_healthy_threshold(0);
        assert!(bad.validate().is_err());
    }
}
